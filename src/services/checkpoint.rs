use async_trait::async_trait;
use redis::AsyncCommands;

use crate::models::partition::Partition;

const CHECKPOINT_PREFIX: &str = "bib_batch:checkpoint";

/// Resume cursor per partition. A stale or missing checkpoint only costs
/// redundant re-listing; the processed-key tracker guarantees correctness.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, partition: &Partition) -> Result<Option<String>, CheckpointError>;

    /// Persist `cursor` unless an equal-or-later cursor is already stored.
    /// Returns whether the stored value moved.
    async fn advance(&self, partition: &Partition, cursor: &str) -> Result<bool, CheckpointError>;
}

/// Redis-backed checkpoint store. The advance is a server-side
/// compare-and-set, so concurrent writers cannot regress the cursor.
pub struct RedisCheckpointStore {
    client: redis::Client,
    advance_script: redis::Script,
}

const ADVANCE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false or ARGV[1] > current then
    redis.call('SET', KEYS[1], ARGV[1])
    return 1
end
return 0
"#;

impl RedisCheckpointStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            advance_script: redis::Script::new(ADVANCE_SCRIPT),
        }
    }

    fn key(partition: &Partition) -> String {
        format!("{}:{}", CHECKPOINT_PREFIX, partition.state_key())
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn get(&self, partition: &Partition) -> Result<Option<String>, CheckpointError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(CheckpointError::Redis)?;
        let cursor: Option<String> = conn
            .get(Self::key(partition))
            .await
            .map_err(CheckpointError::Redis)?;
        Ok(cursor)
    }

    async fn advance(&self, partition: &Partition, cursor: &str) -> Result<bool, CheckpointError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(CheckpointError::Redis)?;
        let moved: i64 = self
            .advance_script
            .key(Self::key(partition))
            .arg(cursor)
            .invoke_async(&mut conn)
            .await
            .map_err(CheckpointError::Redis)?;

        if moved == 1 {
            tracing::debug!(partition = %partition, cursor, "checkpoint advanced");
        }
        Ok(moved == 1)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
