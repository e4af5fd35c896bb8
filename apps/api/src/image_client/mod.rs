//! Image client: the single point of entry for image-generation API calls.
//!
//! Speaks the Imagen-style `predict` contract: one instance with a prompt in,
//! base64-encoded image bytes out. Retries 429 and 5xx with exponential backoff.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum ImageClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid image payload: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("image API returned no predictions")]
    EmptyResponse,

    #[error("Rate limited after {retries} retries")]
    RateLimited { retries: u32 },
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    instances: Vec<PredictInstance<'a>>,
    parameters: PredictParameters<'a>,
}

#[derive(Debug, Serialize)]
struct PredictInstance<'a> {
    prompt: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictParameters<'a> {
    sample_count: u32,
    aspect_ratio: &'a str,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: Option<String>,
    mime_type: Option<String>,
}

/// Decoded image returned by the API.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Bytes,
    pub mime_type: String,
}

#[derive(Clone)]
pub struct ImageClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl ImageClient {
    pub fn new(endpoint: String, api_key: String) -> Result<Self, ImageClientError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }

    /// Generates one image for `prompt` at the given aspect ratio ("16:9", "1:1", ...).
    pub async fn generate(
        &self,
        prompt: &str,
        aspect_ratio: &str,
    ) -> Result<GeneratedImage, ImageClientError> {
        let request_body = PredictRequest {
            instances: vec![PredictInstance { prompt }],
            parameters: PredictParameters {
                sample_count: 1,
                aspect_ratio,
            },
        };

        let mut last_error: Option<ImageClientError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s
                let delay = std::time::Duration::from_millis(1000 * (1 << (attempt - 1)));
                warn!(
                    "Image API attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&request_body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(ImageClientError::Http(e));
                    continue;
                }
            };

            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                warn!("Image API returned {}: {}", status, body);
                last_error = Some(ImageClientError::Api {
                    status: status.as_u16(),
                    message: body,
                });
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ImageClientError::Api {
                    status: status.as_u16(),
                    message: body,
                });
            }

            let parsed: PredictResponse = response.json().await?;
            let image = decode_first_prediction(parsed)?;
            debug!(
                "Image generated: {} bytes ({})",
                image.bytes.len(),
                image.mime_type
            );
            return Ok(image);
        }

        Err(last_error.unwrap_or(ImageClientError::RateLimited {
            retries: MAX_RETRIES,
        }))
    }
}

fn decode_first_prediction(response: PredictResponse) -> Result<GeneratedImage, ImageClientError> {
    let prediction = response
        .predictions
        .into_iter()
        .find(|p| p.bytes_base64_encoded.is_some())
        .ok_or(ImageClientError::EmptyResponse)?;
    let encoded = prediction
        .bytes_base64_encoded
        .ok_or(ImageClientError::EmptyResponse)?;
    let bytes = STANDARD.decode(encoded.trim())?;
    if bytes.is_empty() {
        return Err(ImageClientError::EmptyResponse);
    }
    Ok(GeneratedImage {
        bytes: Bytes::from(bytes),
        mime_type: prediction
            .mime_type
            .unwrap_or_else(|| "image/png".to_string()),
    })
}
