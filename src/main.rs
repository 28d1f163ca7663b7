use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use bib_batch::config::{AppConfig, RunArgs};
use bib_batch::db::{self, PgResultStore};
use bib_batch::driver::{Driver, Services};
use bib_batch::models::partition::Partition;
use bib_batch::services::checkpoint::RedisCheckpointStore;
use bib_batch::services::detector::HttpDetector;
use bib_batch::services::extractor::HttpExtractor;
use bib_batch::services::jobs::RedisJobCounter;
use bib_batch::services::ledger::RedisUsageLedger;
use bib_batch::services::lister::IncrementalLister;
use bib_batch::services::pipeline::PipelineDispatcher;
use bib_batch::services::storage::S3Client;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let args = RunArgs::parse();
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    let partition = Partition {
        cutoff_date: args.cutoff_date,
        env: args.env.clone(),
        race_id: args.race_id.clone(),
    };

    tracing::info!(%partition, customer_id = %config.customer_id, "Initializing bib-batch run");

    // Register application metrics
    metrics::describe_counter!(
        "driver_images_processed_total",
        "Images fully processed and marked in the dedup tracker"
    );
    metrics::describe_counter!(
        "driver_tags_persisted_total",
        "Extraction records upserted into the result table"
    );
    metrics::describe_counter!(
        "driver_download_failures_total",
        "Images skipped because download or decode failed"
    );
    metrics::describe_counter!("pipeline_images_total", "Images dispatched through the pipeline");
    metrics::describe_counter!(
        "pipeline_crops_total",
        "Crops entering the extraction stage after detection filtering"
    );
    metrics::describe_counter!(
        "pipeline_detection_chunk_failures_total",
        "Detection chunks absorbed as empty results"
    );
    metrics::describe_counter!(
        "pipeline_extraction_chunk_failures_total",
        "Extraction chunks absorbed as empty results"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Redis backs checkpoints, the usage ledger and the job counter
    tracing::info!("Connecting to Redis");
    let redis_client =
        redis::Client::open(config.redis_url.as_str()).expect("Failed to initialize Redis client");

    tracing::info!("Initializing S3 storage client");
    let storage = Arc::new(
        S3Client::new(
            &config.s3_bucket,
            &config.s3_endpoint,
            &config.s3_region,
            &config.s3_access_key,
            &config.s3_secret_key,
        )
        .expect("Failed to initialize S3 client"),
    );

    tracing::info!("Initializing model service clients");
    let detector = Arc::new(HttpDetector::new(&config.detection_url));
    let extractor = Arc::new(HttpExtractor::new(&config.extraction_url));
    let dispatcher = PipelineDispatcher::new(detector, extractor, config.pipeline_config())
        .expect("Invalid pipeline configuration");

    let services = Services {
        lister: IncrementalLister::new(storage.clone(), &config.s3_root_prefix),
        storage,
        checkpoint: Arc::new(RedisCheckpointStore::new(redis_client.clone())),
        ledger: Arc::new(RedisUsageLedger::new(redis_client.clone())),
        jobs: Arc::new(RedisJobCounter::new(redis_client, config.job_batch_size)),
        store: Arc::new(PgResultStore::new(db_pool)),
        dispatcher,
    };

    let driver = Driver::new(
        services,
        partition,
        &config.customer_id,
        args.batch_size,
        args.max_images,
    );

    match driver.run(args.force_restart).await {
        Ok(summary) => {
            tracing::info!(
                pages = summary.pages,
                images_listed = summary.images_listed,
                images_deduped = summary.images_deduped,
                images_processed = summary.images_processed,
                images_failed = summary.images_failed,
                tags_persisted = summary.tags_persisted,
                "bib-batch run finished"
            );
        }
        Err(e) => {
            tracing::error!(error = %e, retryable = e.is_retryable(), "bib-batch run failed");
            std::process::exit(e.exit_code());
        }
    }
}
