use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Scope for checkpoint, dedup, and usage state. The race id is an optional
/// key component, never a separate code path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub cutoff_date: NaiveDate,
    pub env: String,
    pub race_id: Option<String>,
}

impl Partition {
    pub fn new(cutoff_date: NaiveDate, env: impl Into<String>, race_id: Option<String>) -> Self {
        Self {
            cutoff_date,
            env: env.into(),
            race_id,
        }
    }

    /// Stable key string used to scope checkpoint and ledger entries.
    pub fn state_key(&self) -> String {
        match &self.race_id {
            Some(race) => format!("{}/{}/{}", self.cutoff_date, self.env, race),
            None => format!("{}/{}", self.cutoff_date, self.env),
        }
    }

    /// S3 listing prefix under the configured root folder.
    pub fn listing_prefix(&self, root: &str) -> String {
        match &self.race_id {
            Some(race) => format!("{}/{}/{}", root, self.cutoff_date, race),
            None => format!("{}/{}", root, self.cutoff_date),
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.state_key())
    }
}
