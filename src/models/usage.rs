use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Per-customer contract state held in the usage ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerUsage {
    pub contract_limit: u64,
    pub total_processed: u64,
    pub contract_end: NaiveDate,
}

impl CustomerUsage {
    pub fn remaining(&self) -> u64 {
        self.contract_limit.saturating_sub(self.total_processed)
    }

    pub fn is_expired(&self, today: NaiveDate) -> bool {
        today > self.contract_end
    }
}
