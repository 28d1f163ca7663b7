use async_trait::async_trait;
use chrono::NaiveDate;

const JOBS_PREFIX: &str = "bib_batch:jobs";

/// Groups consumed capacity into capped-size job records. When an increment
/// would push the open job past the cap, the open job is capped at exactly
/// the batch size and the remainder starts the next suffix; nothing is ever
/// discarded.
#[async_trait]
pub trait JobCounter: Send + Sync {
    /// Add `count` processed images to the open job for `(customer, date)`
    /// and return the job id the count landed in, e.g. `2025-03-01-02`.
    async fn advance(
        &self,
        customer_id: &str,
        date: NaiveDate,
        count: u64,
    ) -> Result<String, JobError>;
}

pub fn format_job_id(date: NaiveDate, suffix: u64) -> String {
    format!("{}-{:02}", date, suffix)
}

/// Redis-backed job counter; one hash per `(customer, date)` with an `open`
/// suffix pointer and a `total:{suffix}` field per job. The rollover runs
/// as a single server-side script, so concurrent completions serialize.
pub struct RedisJobCounter {
    client: redis::Client,
    batch_size: u64,
    advance_script: redis::Script,
}

const ADVANCE_SCRIPT: &str = r#"
local open = tonumber(redis.call('HGET', KEYS[1], 'open') or '1')
local count = tonumber(ARGV[1])
local cap = tonumber(ARGV[2])
local total = tonumber(redis.call('HGET', KEYS[1], 'total:' .. open) or '0') + count
while total > cap do
    redis.call('HSET', KEYS[1], 'total:' .. open, cap)
    total = total - cap
    open = open + 1
end
redis.call('HSET', KEYS[1], 'total:' .. open, total)
redis.call('HSET', KEYS[1], 'open', open)
return open
"#;

impl RedisJobCounter {
    pub fn new(client: redis::Client, batch_size: u64) -> Self {
        Self {
            client,
            batch_size,
            advance_script: redis::Script::new(ADVANCE_SCRIPT),
        }
    }

    fn key(customer_id: &str, date: NaiveDate) -> String {
        format!("{}:{}:{}", JOBS_PREFIX, customer_id, date)
    }
}

#[async_trait]
impl JobCounter for RedisJobCounter {
    async fn advance(
        &self,
        customer_id: &str,
        date: NaiveDate,
        count: u64,
    ) -> Result<String, JobError> {
        if count == 0 {
            return Err(JobError::EmptyAdvance);
        }

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let suffix: u64 = self
            .advance_script
            .key(Self::key(customer_id, date))
            .arg(count)
            .arg(self.batch_size)
            .invoke_async(&mut conn)
            .await?;

        let job_id = format_job_id(date, suffix);
        tracing::debug!(customer_id, %job_id, count, "job counter advanced");
        Ok(job_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job counter advanced by zero images")]
    EmptyAdvance,

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
