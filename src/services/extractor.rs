use async_trait::async_trait;
use image::DynamicImage;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::services::detector::{encode_jpeg_base64, ModelError};

/// Text extraction model collaborator. Returns one string per crop, in the
/// order the crops were received.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        device: u32,
        crops: &[DynamicImage],
    ) -> Result<Vec<String>, ModelError>;
}

/// HTTP client for the extraction model service.
pub struct HttpExtractor {
    http: Client,
    base_url: String,
}

#[derive(Serialize)]
struct ExtractRequest {
    device: u32,
    crops: Vec<String>,
}

#[derive(Deserialize)]
struct ExtractResponse {
    texts: Vec<String>,
}

impl HttpExtractor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(
        &self,
        device: u32,
        crops: &[DynamicImage],
    ) -> Result<Vec<String>, ModelError> {
        let encoded = crops
            .iter()
            .map(encode_jpeg_base64)
            .collect::<Result<Vec<_>, _>>()?;

        let url = format!("{}/extract", self.base_url);
        let response: ExtractResponse = self
            .http
            .post(&url)
            .json(&ExtractRequest {
                device,
                crops: encoded,
            })
            .send()
            .await
            .map_err(ModelError::Http)?
            .error_for_status()
            .map_err(ModelError::Http)?
            .json()
            .await
            .map_err(ModelError::Http)?;

        if response.texts.len() != crops.len() {
            return Err(ModelError::Shape {
                expected: crops.len(),
                got: response.texts.len(),
            });
        }
        Ok(response.texts)
    }
}
