use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::models::partition::Partition;
use crate::models::record::{ExtractionRecord, ReportRow};

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Relational persistence seam: the idempotent result sink plus the
/// processed-key tracker that makes re-listing safe.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Idempotent upsert; replays update only `modified_at`.
    async fn upsert_batch(
        &self,
        partition: &Partition,
        records: &[ExtractionRecord],
    ) -> Result<(), sqlx::Error>;

    /// Idempotent insert of processed markers (duplicates are no-ops).
    async fn mark_processed(
        &self,
        partition: &Partition,
        keys: &[String],
    ) -> Result<(), sqlx::Error>;

    /// Which of `keys` already carry a processed marker in this partition.
    async fn already_processed(
        &self,
        partition: &Partition,
        keys: &[String],
    ) -> Result<HashSet<String>, sqlx::Error>;

    async fn processed_count(&self, partition: &Partition) -> Result<i64, sqlx::Error>;

    async fn fetch_report(&self, partition: &Partition) -> Result<Vec<ReportRow>, sqlx::Error>;
}

/// Production `ResultStore` backed by the sqlx Postgres pool.
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn upsert_batch(
        &self,
        partition: &Partition,
        records: &[ExtractionRecord],
    ) -> Result<(), sqlx::Error> {
        results::upsert_batch(&self.pool, partition, records).await
    }

    async fn mark_processed(
        &self,
        partition: &Partition,
        keys: &[String],
    ) -> Result<(), sqlx::Error> {
        processed::mark_processed(&self.pool, partition, keys).await
    }

    async fn already_processed(
        &self,
        partition: &Partition,
        keys: &[String],
    ) -> Result<HashSet<String>, sqlx::Error> {
        processed::already_processed(&self.pool, partition, keys).await
    }

    async fn processed_count(&self, partition: &Partition) -> Result<i64, sqlx::Error> {
        processed::processed_count(&self.pool, partition).await
    }

    async fn fetch_report(&self, partition: &Partition) -> Result<Vec<ReportRow>, sqlx::Error> {
        results::fetch_report(&self.pool, partition).await
    }
}

pub mod processed;
pub mod results;
