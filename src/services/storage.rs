use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};

/// Source of image objects. Listing is cursor-based so a run can resume
/// from a checkpoint; transport failures are retryable and never advance
/// any checkpoint.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// One page of raw object keys after `start_after`, in key order, and
    /// the cursor for the following page (`None` when exhausted).
    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        page_size: usize,
    ) -> Result<(Vec<String>, Option<String>), StorageError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

/// S3-compatible object storage client.
pub struct S3Client {
    bucket: Box<Bucket>,
}

impl S3Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        page_size: usize,
    ) -> Result<(Vec<String>, Option<String>), StorageError> {
        let (result, _status) = self
            .bucket
            .list_page(
                prefix.to_string(),
                None,
                None,
                start_after.map(str::to_string),
                Some(page_size),
            )
            .await
            .map_err(StorageError::S3)?;

        let keys: Vec<String> = result.contents.into_iter().map(|obj| obj.key).collect();
        let next_cursor = keys.last().cloned();
        Ok((keys, next_cursor))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await.map_err(StorageError::S3)?;
        Ok(response.to_vec())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("storage configuration error: {0}")]
    Config(String),
}
