use std::io::Cursor;

use async_trait::async_trait;
use base64::Engine;
use image::{DynamicImage, ImageFormat};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::models::detection::DetectionResult;

/// Region detection model collaborator. `device` identifies the compute
/// device the calling worker is bound to for its lifetime.
#[async_trait]
pub trait Detector: Send + Sync {
    /// One detection list per input image, in input order. A list may be
    /// empty when nothing was found.
    async fn detect(
        &self,
        device: u32,
        images: &[DynamicImage],
    ) -> Result<Vec<DetectionResult>, ModelError>;
}

pub(crate) fn encode_jpeg_base64(image: &DynamicImage) -> Result<String, ModelError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Jpeg)
        .map_err(|e| ModelError::Encode(e.to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(buf.into_inner()))
}

/// HTTP client for the detection model service.
pub struct HttpDetector {
    http: Client,
    base_url: String,
}

#[derive(Serialize)]
struct DetectRequest {
    device: u32,
    images: Vec<String>,
}

#[derive(Deserialize)]
struct DetectResponse {
    detections: Vec<DetectionResult>,
}

impl HttpDetector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(
        &self,
        device: u32,
        images: &[DynamicImage],
    ) -> Result<Vec<DetectionResult>, ModelError> {
        let encoded = images
            .iter()
            .map(encode_jpeg_base64)
            .collect::<Result<Vec<_>, _>>()?;

        let url = format!("{}/detect", self.base_url);
        let response: DetectResponse = self
            .http
            .post(&url)
            .json(&DetectRequest {
                device,
                images: encoded,
            })
            .send()
            .await
            .map_err(ModelError::Http)?
            .error_for_status()
            .map_err(ModelError::Http)?
            .json()
            .await
            .map_err(ModelError::Http)?;

        if response.detections.len() != images.len() {
            return Err(ModelError::Shape {
                expected: images.len(),
                got: response.detections.len(),
            });
        }
        Ok(response.detections)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to encode image for transport: {0}")]
    Encode(String),

    #[error("model returned {got} results for {expected} inputs")]
    Shape { expected: usize, got: usize },
}
