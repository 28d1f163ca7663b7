use serde::{Deserialize, Serialize};

/// Stage an image had reached when it failed. An image that fails at any
/// stage is recorded and skipped; it never blocks siblings, batch
/// completion, or checkpoint advancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Listed,
    Downloaded,
    Detected,
    Cropped,
    Extracted,
    Persisted,
    MarkedProcessed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Listed => "listed",
            Stage::Downloaded => "downloaded",
            Stage::Detected => "detected",
            Stage::Cropped => "cropped",
            Stage::Extracted => "extracted",
            Stage::Persisted => "persisted",
            Stage::MarkedProcessed => "marked_processed",
        };
        f.write_str(s)
    }
}

/// Per-image failure, aggregated by the caller as ordinary data rather than
/// surfaced as an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFailure {
    /// Position of the image in the batch it was dispatched with.
    pub index: usize,
    pub stage: Stage,
    pub reason: String,
}
