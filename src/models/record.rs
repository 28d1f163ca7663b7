use serde::{Deserialize, Serialize};

use crate::models::image_key::NaturalKey;

/// One extracted tag for one source image, keyed by the natural key plus
/// partition columns. Re-inserting the same tuple only touches
/// `modified_at` in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub eid: i64,
    pub cid: i64,
    pub photonum: i64,
    pub tag: String,
}

impl ExtractionRecord {
    pub fn new(key: NaturalKey, tag: impl Into<String>) -> Self {
        Self {
            eid: key.eid,
            cid: key.cid,
            photonum: key.photonum,
            tag: tag.into(),
        }
    }
}

/// Row shape returned by the end-of-run report query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRow {
    pub eid: i64,
    pub cid: i64,
    pub photonum: i64,
    pub tag: String,
}
