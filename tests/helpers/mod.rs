//! In-memory fakes for the driver's collaborator seams. Each fake keeps the
//! same contract as its Redis/Postgres/S3 counterpart so driver tests can
//! exercise full runs without external services.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use image::DynamicImage;

use bib_batch::db::ResultStore;
use bib_batch::models::detection::{BBox, Detection, DetectionResult};
use bib_batch::models::partition::Partition;
use bib_batch::models::record::{ExtractionRecord, ReportRow};
use bib_batch::models::usage::CustomerUsage;
use bib_batch::services::checkpoint::{CheckpointError, CheckpointStore};
use bib_batch::services::detector::{Detector, ModelError};
use bib_batch::services::extractor::Extractor;
use bib_batch::services::jobs::{format_job_id, JobCounter, JobError};
use bib_batch::services::ledger::{LedgerError, UsageLedger};
use bib_batch::services::storage::{ObjectStore, StorageError};

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn insert(&self, key: impl Into<String>, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.into(), bytes);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        page_size: usize,
    ) -> Result<(Vec<String>, Option<String>), StorageError> {
        let objects = self.objects.lock().unwrap();
        let page: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| start_after.map_or(true, |c| k.as_str() > c))
            .take(page_size)
            .cloned()
            .collect();
        let cursor = page.last().cloned();
        Ok((page, cursor))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::Config(format!("no such object: {key}")))
    }
}

/// Monotonic last-key checkpoint, same compare-and-set rule as the Redis
/// script.
#[derive(Default)]
pub struct MemoryCheckpoint {
    cursors: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoint {
    async fn get(&self, partition: &Partition) -> Result<Option<String>, CheckpointError> {
        Ok(self
            .cursors
            .lock()
            .unwrap()
            .get(&partition.state_key())
            .cloned())
    }

    async fn advance(&self, partition: &Partition, cursor: &str) -> Result<bool, CheckpointError> {
        let mut cursors = self.cursors.lock().unwrap();
        let key = partition.state_key();
        match cursors.get(&key) {
            Some(current) if cursor <= current.as_str() => Ok(false),
            _ => {
                cursors.insert(key, cursor.to_string());
                Ok(true)
            }
        }
    }
}

struct Contract {
    limit: u64,
    used: u64,
    end: NaiveDate,
}

#[derive(Default)]
struct LedgerState {
    contracts: HashMap<String, Contract>,
    reserved: u64,
    released: u64,
}

/// Atomic reserve-with-limit ledger, mirroring the Redis script contract
/// (expired contracts and overruns are rejected without any increment).
/// Running totals of reserved and released capacity let tests assert that
/// every reservation is settled exactly once.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn with_contract(customer_id: &str, limit: u64, end: NaiveDate) -> Self {
        let ledger = Self::default();
        ledger.state.lock().unwrap().contracts.insert(
            customer_id.to_string(),
            Contract {
                limit,
                used: 0,
                end,
            },
        );
        ledger
    }

    pub fn used(&self, customer_id: &str) -> u64 {
        self.state
            .lock()
            .unwrap()
            .contracts
            .get(customer_id)
            .map_or(0, |c| c.used)
    }

    pub fn reserved_total(&self) -> u64 {
        self.state.lock().unwrap().reserved
    }

    pub fn released_total(&self) -> u64 {
        self.state.lock().unwrap().released
    }
}

#[async_trait]
impl UsageLedger for MemoryLedger {
    async fn usage(&self, customer_id: &str) -> Result<CustomerUsage, LedgerError> {
        let state = self.state.lock().unwrap();
        let contract = state
            .contracts
            .get(customer_id)
            .ok_or_else(|| LedgerError::UnknownCustomer {
                customer_id: customer_id.to_string(),
            })?;
        Ok(CustomerUsage {
            contract_limit: contract.limit,
            total_processed: contract.used,
            contract_end: contract.end,
        })
    }

    async fn reserve(&self, customer_id: &str, delta: u64) -> Result<u64, LedgerError> {
        let mut state = self.state.lock().unwrap();
        let contract = state.contracts.get_mut(customer_id).ok_or_else(|| {
            LedgerError::UnknownCustomer {
                customer_id: customer_id.to_string(),
            }
        })?;
        if chrono::Utc::now().date_naive() > contract.end {
            return Err(LedgerError::ContractExpired {
                customer_id: customer_id.to_string(),
                contract_end: contract.end,
            });
        }
        if contract.used + delta > contract.limit {
            return Err(LedgerError::QuotaExceeded {
                customer_id: customer_id.to_string(),
                requested: delta,
            });
        }
        contract.used += delta;
        let used = contract.used;
        state.reserved += delta;
        Ok(used)
    }

    async fn release(&self, customer_id: &str, delta: u64) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        let contract = state.contracts.get_mut(customer_id).ok_or_else(|| {
            LedgerError::UnknownCustomer {
                customer_id: customer_id.to_string(),
            }
        })?;
        contract.used = contract.used.saturating_sub(delta);
        state.released += delta;
        Ok(())
    }
}

/// Rollover job counter with the same cap semantics as the Redis script:
/// a job closes at exactly `batch_size` images and the remainder opens the
/// next suffix.
pub struct MemoryJobCounter {
    batch_size: u64,
    totals: Mutex<HashMap<(String, NaiveDate), Vec<u64>>>,
}

impl MemoryJobCounter {
    pub fn new(batch_size: u64) -> Self {
        Self {
            batch_size,
            totals: Mutex::new(HashMap::new()),
        }
    }

    /// Image counts per job suffix, in suffix order.
    pub fn jobs(&self, customer_id: &str, date: NaiveDate) -> Vec<(String, u64)> {
        self.totals
            .lock()
            .unwrap()
            .get(&(customer_id.to_string(), date))
            .map(|totals| {
                totals
                    .iter()
                    .enumerate()
                    .map(|(i, total)| (format_job_id(date, i as u64 + 1), *total))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobCounter for MemoryJobCounter {
    async fn advance(
        &self,
        customer_id: &str,
        date: NaiveDate,
        count: u64,
    ) -> Result<String, JobError> {
        if count == 0 {
            return Err(JobError::EmptyAdvance);
        }
        let mut totals = self.totals.lock().unwrap();
        let jobs = totals
            .entry((customer_id.to_string(), date))
            .or_insert_with(|| vec![0]);
        let mut total = *jobs.last().unwrap() + count;
        while total > self.batch_size {
            *jobs.last_mut().unwrap() = self.batch_size;
            total -= self.batch_size;
            jobs.push(0);
        }
        *jobs.last_mut().unwrap() = total;
        Ok(format_job_id(date, jobs.len() as u64))
    }
}

#[derive(Default)]
struct StoreState {
    records: HashSet<(String, ExtractionRecord)>,
    replayed: u64,
    processed: HashSet<(String, String)>,
}

/// In-memory stand-in for the Postgres result store. `replayed` counts
/// conflicting upserts the way `modified_at` bumps would.
#[derive(Default)]
pub struct MemoryResultStore {
    state: Mutex<StoreState>,
}

impl MemoryResultStore {
    pub fn records(&self, partition: &Partition) -> HashSet<ExtractionRecord> {
        let key = partition.state_key();
        self.state
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn replayed_upserts(&self) -> u64 {
        self.state.lock().unwrap().replayed
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn upsert_batch(
        &self,
        partition: &Partition,
        records: &[ExtractionRecord],
    ) -> Result<(), sqlx::Error> {
        let mut state = self.state.lock().unwrap();
        let key = partition.state_key();
        for record in records {
            if !state.records.insert((key.clone(), record.clone())) {
                state.replayed += 1;
            }
        }
        Ok(())
    }

    async fn mark_processed(
        &self,
        partition: &Partition,
        keys: &[String],
    ) -> Result<(), sqlx::Error> {
        let mut state = self.state.lock().unwrap();
        let pkey = partition.state_key();
        for key in keys {
            state.processed.insert((pkey.clone(), key.clone()));
        }
        Ok(())
    }

    async fn already_processed(
        &self,
        partition: &Partition,
        keys: &[String],
    ) -> Result<HashSet<String>, sqlx::Error> {
        let state = self.state.lock().unwrap();
        let pkey = partition.state_key();
        Ok(keys
            .iter()
            .filter(|k| state.processed.contains(&(pkey.clone(), (*k).clone())))
            .cloned()
            .collect())
    }

    async fn processed_count(&self, partition: &Partition) -> Result<i64, sqlx::Error> {
        let state = self.state.lock().unwrap();
        let pkey = partition.state_key();
        Ok(state.processed.iter().filter(|(k, _)| *k == pkey).count() as i64)
    }

    async fn fetch_report(&self, partition: &Partition) -> Result<Vec<ReportRow>, sqlx::Error> {
        let state = self.state.lock().unwrap();
        let pkey = partition.state_key();
        let mut rows: Vec<ReportRow> = state
            .records
            .iter()
            .filter(|(k, r)| *k == pkey && !r.tag.is_empty())
            .map(|(_, r)| ReportRow {
                eid: r.eid,
                cid: r.cid,
                photonum: r.photonum,
                tag: r.tag.clone(),
            })
            .collect();
        rows.sort_by_key(|r| (r.eid, r.cid, r.photonum, r.tag.clone()));
        Ok(rows)
    }
}

/// Result store whose upserts always fail, for exercising batch-abort
/// paths; everything else delegates to an inner in-memory store.
#[derive(Default)]
pub struct FailingResultStore {
    inner: MemoryResultStore,
}

#[async_trait]
impl ResultStore for FailingResultStore {
    async fn upsert_batch(
        &self,
        _partition: &Partition,
        _records: &[ExtractionRecord],
    ) -> Result<(), sqlx::Error> {
        Err(sqlx::Error::PoolTimedOut)
    }

    async fn mark_processed(
        &self,
        partition: &Partition,
        keys: &[String],
    ) -> Result<(), sqlx::Error> {
        self.inner.mark_processed(partition, keys).await
    }

    async fn already_processed(
        &self,
        partition: &Partition,
        keys: &[String],
    ) -> Result<HashSet<String>, sqlx::Error> {
        self.inner.already_processed(partition, keys).await
    }

    async fn processed_count(&self, partition: &Partition) -> Result<i64, sqlx::Error> {
        self.inner.processed_count(partition).await
    }

    async fn fetch_report(&self, partition: &Partition) -> Result<Vec<ReportRow>, sqlx::Error> {
        self.inner.fetch_report(partition).await
    }
}

/// Returns one full-frame detection per image at fixed confidence.
pub struct OneBoxDetector {
    pub confidence: f32,
}

#[async_trait]
impl Detector for OneBoxDetector {
    async fn detect(
        &self,
        _device: u32,
        images: &[DynamicImage],
    ) -> Result<Vec<DetectionResult>, ModelError> {
        Ok(images
            .iter()
            .map(|img| {
                vec![Detection {
                    bbox: BBox {
                        x1: 0.0,
                        y1: 0.0,
                        x2: img.width() as f32,
                        y2: img.height() as f32,
                    },
                    confidence: self.confidence,
                }]
            })
            .collect())
    }
}

/// Hands out texts from a fixed queue, one per crop, in arrival order.
pub struct QueueExtractor {
    texts: Mutex<Vec<String>>,
}

impl QueueExtractor {
    pub fn new(texts: &[&str]) -> Self {
        Self {
            texts: Mutex::new(texts.iter().rev().map(|s| s.to_string()).collect()),
        }
    }
}

#[async_trait]
impl Extractor for QueueExtractor {
    async fn extract(
        &self,
        _device: u32,
        crops: &[DynamicImage],
    ) -> Result<Vec<String>, ModelError> {
        let mut queue = self.texts.lock().unwrap();
        Ok(crops
            .iter()
            .map(|_| queue.pop().unwrap_or_default())
            .collect())
    }
}
