use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use image::DynamicImage;

use crate::db::ResultStore;
use crate::models::image_key::parse_natural_key;
use crate::models::partition::Partition;
use crate::models::record::ExtractionRecord;
use crate::services::checkpoint::{CheckpointError, CheckpointStore};
use crate::services::jobs::{JobCounter, JobError};
use crate::services::ledger::{LedgerError, UsageLedger};
use crate::services::lister::IncrementalLister;
use crate::services::pipeline::PipelineDispatcher;
use crate::services::storage::{ObjectStore, StorageError};

/// Everything the driver needs, constructed once at process start and
/// passed in explicitly so independent runs share no hidden state.
pub struct Services {
    pub lister: IncrementalLister,
    pub storage: Arc<dyn ObjectStore>,
    pub checkpoint: Arc<dyn CheckpointStore>,
    pub ledger: Arc<dyn UsageLedger>,
    pub jobs: Arc<dyn JobCounter>,
    pub store: Arc<dyn ResultStore>,
    pub dispatcher: PipelineDispatcher,
}

/// Run-level failure. Quota and contract violations are fatal until the
/// contract changes; everything else is retryable, with the checkpoint
/// left at the last fully completed page.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("listing failed: {0}")]
    Listing(#[source] StorageError),

    #[error("persistence failed: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error(transparent)]
    Ledger(LedgerError),

    #[error("checkpoint store failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("job counter failed: {0}")]
    Jobs(#[from] JobError),
}

impl RunError {
    /// Process exit code: 3 quota exhausted, 4 contract expired, 1 any
    /// retryable failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Ledger(LedgerError::QuotaExceeded { .. }) => 3,
            RunError::Ledger(LedgerError::ContractExpired { .. }) => 4,
            _ => 1,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RunError::Ledger(
                LedgerError::QuotaExceeded { .. } | LedgerError::ContractExpired { .. }
            )
        )
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub pages: u64,
    pub images_listed: u64,
    pub images_deduped: u64,
    pub images_processed: u64,
    pub images_failed: u64,
    pub tags_persisted: u64,
}

struct PageStats {
    processed: u64,
    failed: u64,
    tags: u64,
}

/// One listed page, claimed against the ledger and downloaded. `keys` and
/// `images` stay index-aligned.
struct FetchedBatch {
    keys: Vec<String>,
    images: Vec<DynamicImage>,
    next_cursor: Option<String>,
    listed: usize,
    deduped: usize,
    download_failures: u64,
    /// Truncated by the max-images budget; the page is not fully resolved,
    /// so the checkpoint must not advance past it.
    capped: bool,
    exhausted: bool,
}

impl FetchedBatch {
    fn exhausted() -> Self {
        Self {
            keys: Vec::new(),
            images: Vec::new(),
            next_cursor: None,
            listed: 0,
            deduped: 0,
            download_failures: 0,
            capped: false,
            exhausted: true,
        }
    }

    /// Reservations still held for this batch (download failures already
    /// released theirs).
    fn claimed(&self) -> u64 {
        self.images.len() as u64
    }
}

/// Sequential page-by-page driver. Within a page the dispatcher fans out to
/// the worker pools, and the next page's listing and downloads overlap the
/// current page's processing.
pub struct Driver {
    services: Services,
    partition: Partition,
    customer_id: String,
    page_size: usize,
    max_images: Option<u64>,
}

impl Driver {
    pub fn new(
        services: Services,
        partition: Partition,
        customer_id: impl Into<String>,
        page_size: usize,
        max_images: Option<u64>,
    ) -> Self {
        Self {
            services,
            partition,
            customer_id: customer_id.into(),
            page_size,
            max_images,
        }
    }

    /// Drain the partition (or hit the max-images budget) and return the
    /// run summary.
    pub async fn run(&self, force_restart: bool) -> Result<RunSummary, RunError> {
        let today = Utc::now().date_naive();

        let usage = self
            .services
            .ledger
            .usage(&self.customer_id)
            .await
            .map_err(RunError::Ledger)?;
        if usage.is_expired(today) {
            return Err(RunError::Ledger(LedgerError::ContractExpired {
                customer_id: self.customer_id.clone(),
                contract_end: usage.contract_end,
            }));
        }
        if usage.remaining() == 0 {
            return Err(RunError::Ledger(LedgerError::QuotaExceeded {
                customer_id: self.customer_id.clone(),
                requested: 0,
            }));
        }

        let cursor = if force_restart {
            tracing::info!(partition = %self.partition, "force restart, ignoring checkpoint");
            None
        } else {
            let cursor = self.services.checkpoint.get(&self.partition).await?;
            tracing::info!(partition = %self.partition, checkpoint = ?cursor, "resuming from checkpoint");
            cursor
        };

        let mut summary = RunSummary::default();
        let mut remaining = self.max_images;
        let mut current = self.fetch_batch(cursor, remaining).await?;

        while !current.exhausted {
            summary.images_listed += current.listed as u64;
            summary.images_deduped += current.deduped as u64;
            summary.images_failed += current.download_failures;

            let next_remaining =
                remaining.map(|r| r.saturating_sub(current.images.len() as u64));
            let should_prefetch =
                !current.capped && current.next_cursor.is_some() && next_remaining != Some(0);
            let prefetch_cursor = current.next_cursor.clone();

            let (page_result, prefetched) = tokio::join!(
                self.process_page(&current, today),
                async {
                    if should_prefetch {
                        self.fetch_batch(prefetch_cursor, next_remaining).await
                    } else {
                        Ok(FetchedBatch::exhausted())
                    }
                }
            );

            let stats = match page_result {
                Ok(stats) => stats,
                Err(e) => {
                    // Abort before any checkpoint movement. The failed page
                    // settled its own claim inside `process_page`; only the
                    // prefetched page's reservations are still outstanding.
                    if let Ok(next) = prefetched {
                        self.release_quietly(next.claimed()).await;
                    }
                    return Err(e);
                }
            };

            summary.images_processed += stats.processed;
            summary.images_failed += stats.failed;
            summary.tags_persisted += stats.tags;
            summary.pages += 1;

            // Advancing is the last step, and only for fully resolved pages.
            if !current.capped {
                if let Some(cursor) = &current.next_cursor {
                    self.services.checkpoint.advance(&self.partition, cursor).await?;
                }
            }

            remaining = next_remaining;
            if current.capped || remaining == Some(0) {
                if let Ok(next) = prefetched {
                    self.release_quietly(next.claimed()).await;
                }
                tracing::info!(partition = %self.partition, "max images budget reached");
                break;
            }

            current = prefetched?;
        }

        let processed_total = self.services.store.processed_count(&self.partition).await?;
        let report = self.services.store.fetch_report(&self.partition).await?;
        tracing::info!(
            partition = %self.partition,
            processed_total,
            report_rows = report.len(),
            pages = summary.pages,
            images_processed = summary.images_processed,
            images_failed = summary.images_failed,
            tags_persisted = summary.tags_persisted,
            "run complete"
        );

        Ok(summary)
    }

    /// List one page, dedup it, claim quota for the fresh keys, and
    /// download them concurrently. Download failures skip the image and
    /// hand back their reservation.
    async fn fetch_batch(
        &self,
        cursor: Option<String>,
        remaining: Option<u64>,
    ) -> Result<FetchedBatch, RunError> {
        let page = self
            .services
            .lister
            .list(&self.partition, cursor.as_deref(), self.page_size)
            .await
            .map_err(RunError::Listing)?;

        if page.is_exhausted() {
            return Ok(FetchedBatch::exhausted());
        }

        let listed = page.keys.len();
        let seen = self
            .services
            .store
            .already_processed(&self.partition, &page.keys)
            .await?;
        let mut fresh: Vec<String> = page
            .keys
            .into_iter()
            .filter(|k| !seen.contains(k))
            .collect();
        let deduped = listed - fresh.len();

        let mut capped = false;
        if let Some(budget) = remaining {
            if (fresh.len() as u64) > budget {
                fresh.truncate(budget as usize);
                capped = true;
            }
        }

        if !fresh.is_empty() {
            self.services
                .ledger
                .reserve(&self.customer_id, fresh.len() as u64)
                .await
                .map_err(RunError::Ledger)?;
        }

        let downloads = fresh.iter().map(|key| async move {
            let bytes = self.services.storage.download(key).await;
            (key.clone(), bytes)
        });

        let mut keys = Vec::with_capacity(fresh.len());
        let mut images = Vec::with_capacity(fresh.len());
        let mut download_failures = 0u64;
        for (key, result) in join_all(downloads).await {
            let decoded = result
                .map_err(|e| e.to_string())
                .and_then(|bytes| image::load_from_memory(&bytes).map_err(|e| e.to_string()));
            match decoded {
                Ok(img) => {
                    keys.push(key);
                    images.push(img);
                }
                Err(reason) => {
                    tracing::warn!(image_key = %key, %reason, "download failed, skipping image");
                    metrics::counter!("driver_download_failures_total").increment(1);
                    download_failures += 1;
                }
            }
        }
        if download_failures > 0 {
            self.release_quietly(download_failures).await;
        }

        Ok(FetchedBatch {
            keys,
            images,
            next_cursor: page.next_cursor,
            listed,
            deduped,
            download_failures,
            capped,
            exhausted: false,
        })
    }

    /// Dispatch one downloaded batch through the pipeline and persist the
    /// outcome: upsert records, mark processed keys, advance the job
    /// counter.
    async fn process_page(
        &self,
        batch: &FetchedBatch,
        today: chrono::NaiveDate,
    ) -> Result<PageStats, RunError> {
        if batch.images.is_empty() {
            return Ok(PageStats {
                processed: 0,
                failed: 0,
                tags: 0,
            });
        }

        let output = self.services.dispatcher.process(&batch.images).await;

        let mut records = Vec::new();
        let mut ok_keys = Vec::with_capacity(batch.keys.len());
        let mut parse_failures = 0u64;
        for (key, tags) in batch.keys.iter().zip(&output.tags) {
            match parse_natural_key(key) {
                Ok(natural) => {
                    records.extend(
                        tags.iter()
                            .map(|tag| ExtractionRecord::new(natural, tag.clone())),
                    );
                    ok_keys.push(key.clone());
                }
                Err(e) => {
                    tracing::warn!(image_key = %key, error = %e, "unparseable key, skipping image");
                    parse_failures += 1;
                }
            }
        }

        for failure in &output.failures {
            tracing::warn!(
                image_key = %batch.keys[failure.index],
                stage = %failure.stage,
                reason = %failure.reason,
                "stage failure absorbed"
            );
        }

        // This page's claim is settled exactly once: a persistence failure
        // hands the whole claim back here (unmarked keys are re-reserved on
        // retry); on success only the unpersistable parse failures return.
        if let Err(e) = self.persist_page(&records, &ok_keys).await {
            self.release_quietly(batch.claimed()).await;
            return Err(e.into());
        }
        if parse_failures > 0 {
            self.release_quietly(parse_failures).await;
        }

        if !ok_keys.is_empty() {
            // Persisted work stays billed even if the job counter fails.
            let job_id = self
                .services
                .jobs
                .advance(&self.customer_id, today, ok_keys.len() as u64)
                .await?;
            tracing::info!(
                partition = %self.partition,
                %job_id,
                images = ok_keys.len(),
                crops = output.crop_count,
                tags = records.len(),
                mean_confidence = output.mean_confidence,
                "page persisted"
            );
        }

        metrics::counter!("driver_images_processed_total").increment(ok_keys.len() as u64);
        metrics::counter!("driver_tags_persisted_total").increment(records.len() as u64);

        Ok(PageStats {
            processed: ok_keys.len() as u64,
            failed: parse_failures,
            tags: records.len() as u64,
        })
    }

    async fn persist_page(
        &self,
        records: &[ExtractionRecord],
        ok_keys: &[String],
    ) -> Result<(), sqlx::Error> {
        self.services
            .store
            .upsert_batch(&self.partition, records)
            .await?;
        self.services
            .store
            .mark_processed(&self.partition, ok_keys)
            .await
    }

    /// Hand reservations back to the ledger; a release failure only skews
    /// accounting, so it is logged rather than surfaced.
    async fn release_quietly(&self, count: u64) {
        if count == 0 {
            return;
        }
        if let Err(e) = self.services.ledger.release(&self.customer_id, count).await {
            tracing::error!(error = %e, count, "failed to release reserved quota");
        }
    }
}
