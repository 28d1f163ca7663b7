use chrono::NaiveDate;
use clap::Parser;
use serde::Deserialize;

use crate::services::pipeline::PipelineConfig;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for checkpoints, usage ledger and job counters
    pub redis_url: String,

    /// S3 bucket holding the race imagery
    pub s3_bucket: String,

    /// S3-compatible endpoint URL
    pub s3_endpoint: String,

    /// S3 region name
    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    /// S3 access key ID
    pub s3_access_key: String,

    /// S3 secret access key
    pub s3_secret_key: String,

    /// Key prefix under which partition folders live
    #[serde(default = "default_root_prefix")]
    pub s3_root_prefix: String,

    /// Base URL of the detection model service
    pub detection_url: String,

    /// Base URL of the text extraction model service
    pub extraction_url: String,

    /// Customer whose contract this process bills against
    pub customer_id: String,

    /// Images per job before the counter rolls over to a new suffix
    #[serde(default = "default_job_batch_size")]
    pub job_batch_size: u64,

    /// Detections below this confidence are dropped
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    /// Optional open aspect-ratio interval for accepted detections
    #[serde(default)]
    pub aspect_ratio_min: Option<f32>,
    #[serde(default)]
    pub aspect_ratio_max: Option<f32>,

    /// Exact digit count a cleaned tag must have, if set
    #[serde(default)]
    pub digit_length: Option<usize>,

    /// Width crops are resized to before extraction (0 disables resizing)
    #[serde(default = "default_crop_width")]
    pub target_crop_width: u32,

    /// Device ids the detection batches round-robin over
    #[serde(default = "default_devices")]
    pub detection_devices: Vec<u32>,

    /// Device ids the extraction batches round-robin over
    #[serde(default = "default_devices")]
    pub extraction_devices: Vec<u32>,
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_root_prefix() -> String {
    "images".to_string()
}

fn default_job_batch_size() -> u64 {
    50
}

fn default_min_confidence() -> f32 {
    0.7
}

fn default_crop_width() -> u32 {
    1024
}

fn default_devices() -> Vec<u32> {
    vec![0]
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            min_confidence: self.min_confidence,
            aspect_ratio: self.aspect_ratio_min.zip(self.aspect_ratio_max),
            target_crop_width: (self.target_crop_width > 0).then_some(self.target_crop_width),
            digit_length: self.digit_length,
            detection_devices: self.detection_devices.clone(),
            extraction_devices: self.extraction_devices.clone(),
            ..PipelineConfig::default()
        }
    }
}

/// Per-run arguments; everything environment-shaped stays in [`AppConfig`].
#[derive(Debug, Parser)]
#[command(name = "bib-batch", about = "Batch bib-number extraction over a photo partition")]
pub struct RunArgs {
    /// Partition date, e.g. 2025-03-01
    #[arg(long)]
    pub cutoff_date: NaiveDate,

    /// Partition environment name
    #[arg(long, default_value = "test")]
    pub env: String,

    /// Optional race id narrowing the partition
    #[arg(long)]
    pub race_id: Option<String>,

    /// Images listed (and dispatched) per page
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,

    /// Stop after this many images instead of draining the partition
    #[arg(long)]
    pub max_images: Option<u64>,

    /// Ignore the stored checkpoint and relist from the beginning
    #[arg(long)]
    pub force_restart: bool,
}
