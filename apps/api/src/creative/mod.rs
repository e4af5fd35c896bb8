// Creative rendering: turn a segmentation/location pair into a stored image.
// The catalog only sees the `Renderer` trait; `ImageRenderer` is the
// production backend (image API + S3-compatible object storage).

pub mod prompts;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use thiserror::Error;
use tracing::info;

use crate::image_client::{ImageClient, ImageClientError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatio {
    /// Banner format used by the storefront ad slot.
    Wide,
}

impl AspectRatio {
    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Wide => "16:9",
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("image generation failed: {0}")]
    Generation(#[from] ImageClientError),

    #[error("object storage upload failed: {0}")]
    Storage(String),
}

/// Render an image for a prompt, store it under `target_path`, return its URL.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render_and_store(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        target_path: &str,
    ) -> Result<String, RenderError>;
}

pub struct ImageRenderer {
    client: ImageClient,
    s3: aws_sdk_s3::Client,
    bucket: String,
    public_base_url: String,
}

impl ImageRenderer {
    pub fn new(
        client: ImageClient,
        s3: aws_sdk_s3::Client,
        bucket: String,
        public_base_url: String,
    ) -> Self {
        Self {
            client,
            s3,
            bucket,
            public_base_url,
        }
    }
}

pub fn public_url(base: &str, target_path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        target_path.trim_start_matches('/')
    )
}

#[async_trait]
impl Renderer for ImageRenderer {
    async fn render_and_store(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        target_path: &str,
    ) -> Result<String, RenderError> {
        let image = self.client.generate(prompt, aspect_ratio.as_str()).await?;

        self.s3
            .put_object()
            .bucket(&self.bucket)
            .key(target_path)
            .body(ByteStream::from(image.bytes))
            .content_type(image.mime_type)
            .send()
            .await
            .map_err(|e| RenderError::Storage(e.to_string()))?;

        info!("Uploaded creative to s3://{}/{}", self.bucket, target_path);
        Ok(public_url(&self.public_base_url, target_path))
    }
}
