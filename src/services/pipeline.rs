use std::sync::Arc;

use futures::future::join_all;
use image::{imageops::FilterType, DynamicImage, GenericImageView};

use crate::models::detection::{BBox, Detection, DetectionResult};
use crate::models::outcome::{Stage, StageFailure};
use crate::services::detector::Detector;
use crate::services::extractor::Extractor;

/// Tuning for the detection → crop → extraction pipeline. Device lists are
/// enumerated explicitly at startup; each worker stays bound to its device
/// for the lifetime of the run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Detections below this confidence are dropped.
    pub min_confidence: f32,
    /// Optional `(min, max)` width/height ratio filter; `None` disables it.
    pub aspect_ratio: Option<(f32, f32)>,
    /// Crops are widened to at least this size, centered on the detection.
    pub min_crop_width: u32,
    pub min_crop_height: u32,
    /// Optional canonical crop width; resizing preserves aspect ratio.
    pub target_crop_width: Option<u32>,
    /// When set, cleaned tags must be exactly this many digits.
    pub digit_length: Option<usize>,
    pub detection_devices: Vec<u32>,
    pub extraction_devices: Vec<u32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            aspect_ratio: None,
            min_crop_width: 150,
            min_crop_height: 100,
            target_crop_width: Some(1024),
            digit_length: None,
            detection_devices: vec![0],
            extraction_devices: vec![0],
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineConfigError> {
        for (name, devices) in [
            ("detection", &self.detection_devices),
            ("extraction", &self.extraction_devices),
        ] {
            if devices.is_empty() {
                return Err(PipelineConfigError::NoDevices { pool: name });
            }
            let mut seen = devices.clone();
            seen.sort_unstable();
            seen.dedup();
            if seen.len() != devices.len() {
                return Err(PipelineConfigError::DuplicateDevice { pool: name });
            }
        }
        if let Some((min, max)) = self.aspect_ratio {
            if !(min > 0.0 && max > min) {
                return Err(PipelineConfigError::BadAspectRange { min, max });
            }
        }
        Ok(())
    }

    /// The bbox-validity predicate applied between detection and cropping.
    fn keep_detection(&self, detection: &Detection) -> bool {
        if detection.confidence < self.min_confidence {
            return false;
        }
        match self.aspect_ratio {
            Some((min, max)) => {
                let ratio = detection.bbox.aspect_ratio();
                ratio > min && ratio < max
            }
            None => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineConfigError {
    #[error("{pool} worker pool has no devices configured")]
    NoDevices { pool: &'static str },

    #[error("{pool} worker pool lists a device twice")]
    DuplicateDevice { pool: &'static str },

    #[error("aspect ratio range ({min}, {max}) is not a valid open interval")]
    BadAspectRange { min: f32, max: f32 },
}

/// One crop in the flat arena. The explicit owner index (position of the
/// source image in the batch) is what reassembly groups on; positional
/// slicing is never used.
struct Crop {
    owner: usize,
    image: DynamicImage,
}

/// Everything one pipeline invocation produced, returned by value. One tag
/// list per input image, lengths summing to the surviving crop count before
/// cleaning drops anything.
#[derive(Debug)]
pub struct PipelineOutput {
    pub tags: Vec<Vec<String>>,
    pub mean_confidence: f32,
    pub crop_count: usize,
    pub failures: Vec<StageFailure>,
}

/// Fans a batch of images out to the detection worker pool, crops surviving
/// regions into an owner-tagged arena, fans the arena out to the extraction
/// pool, and reassembles per-image tag lists.
pub struct PipelineDispatcher {
    detector: Arc<dyn Detector>,
    extractor: Arc<dyn Extractor>,
    config: PipelineConfig,
}

impl PipelineDispatcher {
    pub fn new(
        detector: Arc<dyn Detector>,
        extractor: Arc<dyn Extractor>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineConfigError> {
        config.validate()?;
        Ok(Self {
            detector,
            extractor,
            config,
        })
    }

    /// Process one batch. Per-image and per-crop failures are absorbed into
    /// empty results and reported in `failures`; nothing here aborts the
    /// batch.
    pub async fn process(&self, images: &[DynamicImage]) -> PipelineOutput {
        let mut failures = Vec::new();

        let detections = self.detect_all(images, &mut failures).await;

        let (arena, confidences) = self.build_arena(images, &detections);
        let crop_count = arena.len();
        let mean_confidence = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f32>() / confidences.len() as f32
        };

        let texts = self.extract_all(&arena, &mut failures).await;

        let owners: Vec<usize> = arena.iter().map(|c| c.owner).collect();
        let raw = reassemble(&owners, &texts, images.len());

        let tags = raw
            .into_iter()
            .map(|list| {
                list.into_iter()
                    .filter_map(|text| clean_tag(&text, self.config.digit_length))
                    .collect()
            })
            .collect();

        metrics::counter!("pipeline_images_total").increment(images.len() as u64);
        metrics::counter!("pipeline_crops_total").increment(crop_count as u64);

        PipelineOutput {
            tags,
            mean_confidence,
            crop_count,
            failures,
        }
    }

    /// Round-robin the batch across the detection pool and merge results
    /// back into one `DetectionResult` per image index.
    async fn detect_all(
        &self,
        images: &[DynamicImage],
        failures: &mut Vec<StageFailure>,
    ) -> Vec<DetectionResult> {
        let chunks = round_robin(images.len(), self.config.detection_devices.len());

        let dispatched = chunks
            .into_iter()
            .zip(self.config.detection_devices.iter())
            .filter(|(chunk, _)| !chunk.is_empty());

        let futures = dispatched.map(|(chunk, &device)| async move {
            let chunk_images: Vec<DynamicImage> =
                chunk.iter().map(|&i| images[i].clone()).collect();
            let result = self.detector.detect(device, &chunk_images).await;
            (chunk, device, result)
        });

        let mut merged: Vec<DetectionResult> = vec![Vec::new(); images.len()];
        for (chunk, device, result) in join_all(futures).await {
            match result {
                Ok(lists) => {
                    for (&image_idx, list) in chunk.iter().zip(lists) {
                        merged[image_idx] = list;
                    }
                }
                Err(e) => {
                    tracing::warn!(device, error = %e, "detection chunk failed, yielding empty results");
                    metrics::counter!("pipeline_detection_chunk_failures_total").increment(1);
                    for &image_idx in &chunk {
                        failures.push(StageFailure {
                            index: image_idx,
                            stage: Stage::Detected,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        merged
    }

    /// Filter detections, widen and crop each surviving region, and lay the
    /// crops into the flat owner-tagged arena.
    fn build_arena(
        &self,
        images: &[DynamicImage],
        detections: &[DetectionResult],
    ) -> (Vec<Crop>, Vec<f32>) {
        let mut arena = Vec::new();
        let mut confidences = Vec::new();

        for (owner, (image, list)) in images.iter().zip(detections).enumerate() {
            let (img_w, img_h) = image.dimensions();
            for detection in list {
                if !self.config.keep_detection(detection) {
                    continue;
                }
                let Some((x, y, w, h)) = crop_rect(
                    &detection.bbox,
                    img_w,
                    img_h,
                    self.config.min_crop_width,
                    self.config.min_crop_height,
                ) else {
                    tracing::debug!(owner, bbox = ?detection.bbox, "degenerate bbox skipped");
                    continue;
                };

                let mut crop = image.crop_imm(x, y, w, h);
                if let Some(target_w) = self.config.target_crop_width {
                    if crop.width() != target_w {
                        let target_h =
                            ((crop.height() as u64 * target_w as u64) / crop.width() as u64).max(1);
                        crop = crop.resize_exact(target_w, target_h as u32, FilterType::Triangle);
                    }
                }

                confidences.push(detection.confidence);
                arena.push(Crop {
                    owner,
                    image: crop,
                });
            }
        }

        (arena, confidences)
    }

    /// Round-robin the arena across the extraction pool. Arena order is
    /// preserved per slot, so per-image crop order survives reassembly.
    async fn extract_all(&self, arena: &[Crop], failures: &mut Vec<StageFailure>) -> Vec<String> {
        let chunks = round_robin(arena.len(), self.config.extraction_devices.len());

        let dispatched = chunks
            .into_iter()
            .zip(self.config.extraction_devices.iter())
            .filter(|(chunk, _)| !chunk.is_empty());

        let futures = dispatched.map(|(chunk, &device)| async move {
            let crops: Vec<DynamicImage> = chunk.iter().map(|&i| arena[i].image.clone()).collect();
            let result = self.extractor.extract(device, &crops).await;
            (chunk, device, result)
        });

        let mut texts: Vec<String> = vec![String::new(); arena.len()];
        for (chunk, device, result) in join_all(futures).await {
            match result {
                Ok(strings) => {
                    for (&arena_idx, text) in chunk.iter().zip(strings) {
                        texts[arena_idx] = text;
                    }
                }
                Err(e) => {
                    tracing::warn!(device, error = %e, "extraction chunk failed, yielding empty strings");
                    metrics::counter!("pipeline_extraction_chunk_failures_total").increment(1);
                    let mut owners: Vec<usize> =
                        chunk.iter().map(|&i| arena[i].owner).collect();
                    owners.sort_unstable();
                    owners.dedup();
                    for owner in owners {
                        failures.push(StageFailure {
                            index: owner,
                            stage: Stage::Extracted,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        texts
    }
}

/// Distribute `n` items across `k` slots round-robin, preserving order
/// within each slot.
fn round_robin(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut chunks = vec![Vec::new(); k.max(1)];
    for i in 0..n {
        chunks[i % k.max(1)].push(i);
    }
    chunks
}

/// Group extracted texts by each crop's owner index. Always yields exactly
/// `image_count` lists whose lengths sum to the crop count; owner order
/// within a list follows arena order.
fn reassemble(owners: &[usize], texts: &[String], image_count: usize) -> Vec<Vec<String>> {
    debug_assert_eq!(owners.len(), texts.len());
    let mut grouped = vec![Vec::new(); image_count];
    for (&owner, text) in owners.iter().zip(texts) {
        grouped[owner].push(text.clone());
    }
    grouped
}

/// Canonicalize one extracted string: strip non-alphanumerics, drop empty
/// results, and optionally require an exact digit count.
fn clean_tag(raw: &str, digit_length: Option<usize>) -> Option<String> {
    let cleaned: String = raw.chars().filter(char::is_ascii_alphanumeric).collect();
    if cleaned.is_empty() {
        return None;
    }
    if let Some(len) = digit_length {
        if cleaned.len() != len || !cleaned.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
    }
    Some(cleaned)
}

/// Widen the bbox to the minimum crop size, centered, clamped to the image.
/// Returns `(x, y, width, height)` or `None` for a degenerate region.
fn crop_rect(
    bbox: &BBox,
    img_w: u32,
    img_h: u32,
    min_w: u32,
    min_h: u32,
) -> Option<(u32, u32, u32, u32)> {
    let mut x1 = bbox.x1 as i64;
    let mut x2 = bbox.x2 as i64;
    let mut y1 = bbox.y1 as i64;
    let mut y2 = bbox.y2 as i64;

    if x2 - x1 < min_w as i64 {
        let center = (x1 + x2) / 2;
        x1 = center - min_w as i64 / 2;
        x2 = center + min_w as i64 / 2;
    }
    if y2 - y1 < min_h as i64 {
        let center = (y1 + y2) / 2;
        y1 = center - min_h as i64 / 2;
        y2 = center + min_h as i64 / 2;
    }

    let x1 = x1.clamp(0, img_w as i64);
    let x2 = x2.clamp(0, img_w as i64);
    let y1 = y1.clamp(0, img_h as i64);
    let y2 = y2.clamp(0, img_h as i64);

    let w = (x2 - x1) as u32;
    let h = (y2 - y1) as u32;
    if w == 0 || h == 0 {
        return None;
    }
    Some((x1 as u32, y1 as u32, w, h))
}
