use std::sync::Arc;

use crate::models::image_key::is_image_key;
use crate::models::partition::Partition;
use crate::services::storage::{ObjectStore, StorageError};

/// One page of discovered image keys. `next_cursor` is the last raw key of
/// the listed page (not the last image key), so pages full of non-image
/// objects still make progress.
#[derive(Debug, Clone)]
pub struct Page {
    pub keys: Vec<String>,
    pub next_cursor: Option<String>,
}

impl Page {
    pub fn is_exhausted(&self) -> bool {
        self.keys.is_empty() && self.next_cursor.is_none()
    }
}

/// Incremental, resumable enumeration of image keys in a partition.
pub struct IncrementalLister {
    store: Arc<dyn ObjectStore>,
    root_prefix: String,
}

impl IncrementalLister {
    pub fn new(store: Arc<dyn ObjectStore>, root_prefix: impl Into<String>) -> Self {
        Self {
            store,
            root_prefix: root_prefix.into(),
        }
    }

    /// List the page after `cursor`, filtered to recognized image
    /// extensions and ordered lexicographically by key.
    pub async fn list(
        &self,
        partition: &Partition,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page, StorageError> {
        let prefix = partition.listing_prefix(&self.root_prefix);
        let (raw_keys, next_cursor) = self.store.list_page(&prefix, cursor, page_size).await?;

        // S3 returns keys in lexicographic order already; sort anyway so the
        // cursor stays well defined against any store implementation.
        let mut keys: Vec<String> = raw_keys.into_iter().filter(|k| is_image_key(k)).collect();
        keys.sort_unstable();

        tracing::debug!(
            partition = %partition,
            page_len = keys.len(),
            next_cursor = ?next_cursor,
            "listed page"
        );

        Ok(Page { keys, next_cursor })
    }
}
