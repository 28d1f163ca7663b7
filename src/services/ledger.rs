use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;

use crate::models::usage::CustomerUsage;

const LEDGER_PREFIX: &str = "bib_batch:usage";

/// Per-customer contract accounting. Capacity is reserved *before* a page
/// is dispatched; the increment is atomic so concurrent runs can never
/// jointly overrun the contract limit.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn usage(&self, customer_id: &str) -> Result<CustomerUsage, LedgerError>;

    /// Atomically add `delta` to the customer's processed count, failing
    /// without any increment when the contract has ended or the limit would
    /// be exceeded. Returns the new total.
    async fn reserve(&self, customer_id: &str, delta: u64) -> Result<u64, LedgerError>;

    /// Return capacity reserved for work that was abandoned before any
    /// persistence (failed downloads, aborted batches).
    async fn release(&self, customer_id: &str, delta: u64) -> Result<(), LedgerError>;
}

/// Redis-backed ledger; one hash per customer with `contract_limit`,
/// `total_processed`, `contract_end`, and `modified_at` fields.
pub struct RedisUsageLedger {
    client: redis::Client,
    reserve_script: redis::Script,
}

const RESERVE_SCRIPT: &str = r#"
local limit = redis.call('HGET', KEYS[1], 'contract_limit')
if limit == false then
    return -2
end
local contract_end = redis.call('HGET', KEYS[1], 'contract_end')
if contract_end == false then
    return -4
end
if ARGV[3] > contract_end then
    return -3
end
local used = tonumber(redis.call('HGET', KEYS[1], 'total_processed') or '0')
local delta = tonumber(ARGV[1])
if used + delta > tonumber(limit) then
    return -1
end
redis.call('HSET', KEYS[1], 'modified_at', ARGV[2])
return redis.call('HINCRBY', KEYS[1], 'total_processed', delta)
"#;

impl RedisUsageLedger {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            reserve_script: redis::Script::new(RESERVE_SCRIPT),
        }
    }

    fn key(customer_id: &str) -> String {
        format!("{}:{}", LEDGER_PREFIX, customer_id)
    }
}

#[async_trait]
impl UsageLedger for RedisUsageLedger {
    async fn usage(&self, customer_id: &str) -> Result<CustomerUsage, LedgerError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (limit, used, end): (Option<u64>, Option<u64>, Option<String>) = redis::cmd("HMGET")
            .arg(Self::key(customer_id))
            .arg("contract_limit")
            .arg("total_processed")
            .arg("contract_end")
            .query_async(&mut conn)
            .await?;

        let contract_limit = limit.ok_or_else(|| LedgerError::UnknownCustomer {
            customer_id: customer_id.to_string(),
        })?;
        let contract_end = end
            .as_deref()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| LedgerError::Corrupt {
                customer_id: customer_id.to_string(),
            })?;

        Ok(CustomerUsage {
            contract_limit,
            total_processed: used.unwrap_or(0),
            contract_end,
        })
    }

    async fn reserve(&self, customer_id: &str, delta: u64) -> Result<u64, LedgerError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let now = Utc::now();
        // ISO dates compare correctly as strings, so the script checks
        // expiry lexicographically against the stored contract_end.
        let result: i64 = self
            .reserve_script
            .key(Self::key(customer_id))
            .arg(delta)
            .arg(now.to_rfc3339())
            .arg(now.date_naive().to_string())
            .invoke_async(&mut conn)
            .await?;

        match result {
            -4 => Err(LedgerError::Corrupt {
                customer_id: customer_id.to_string(),
            }),
            -3 => {
                let usage = self.usage(customer_id).await?;
                Err(LedgerError::ContractExpired {
                    customer_id: customer_id.to_string(),
                    contract_end: usage.contract_end,
                })
            }
            -2 => Err(LedgerError::UnknownCustomer {
                customer_id: customer_id.to_string(),
            }),
            -1 => Err(LedgerError::QuotaExceeded {
                customer_id: customer_id.to_string(),
                requested: delta,
            }),
            new_used => Ok(new_used as u64),
        }
    }

    async fn release(&self, customer_id: &str, delta: u64) -> Result<(), LedgerError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = conn
            .hincr(Self::key(customer_id), "total_processed", -(delta as i64))
            .await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("no contract found for customer {customer_id:?}")]
    UnknownCustomer { customer_id: String },

    #[error("ledger entry for customer {customer_id:?} is missing contract_end")]
    Corrupt { customer_id: String },

    #[error("contract limit reached for customer {customer_id:?} (requested {requested})")]
    QuotaExceeded { customer_id: String, requested: u64 },

    #[error("contract for customer {customer_id:?} expired on {contract_end}")]
    ContractExpired {
        customer_id: String,
        contract_end: chrono::NaiveDate,
    },

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
