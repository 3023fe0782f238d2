//! Image transformation collaborator.

use async_trait::async_trait;
use bytes::Bytes;
use mediaflow_jobs::JobError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Unsupported input: {0}")]
    Unsupported(String),

    #[error("Transform failed: {0}")]
    Failed(String),
}

impl From<TransformError> for JobError {
    fn from(err: TransformError) -> Self {
        match err {
            // Same bytes, same outcome
            TransformError::Unsupported(_) => JobError::InvalidPayload(err.to_string()),
            TransformError::Failed(_) => JobError::WorkerError(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOptions {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub quality: Option<u8>,
}

/// Output of a transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
    pub bytes: Bytes,
    pub content_type: &'static str,
}

/// `transform(bytes, options) -> bytes`, deterministic for identical input.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, input: Bytes, options: &TransformOptions) -> Result<Transformed, TransformError>;
}

/// Content type from the leading magic bytes.
pub fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

fn content_type_for_format(format: &str) -> Option<&'static str> {
    match format.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Checks that the input is a recognised image and passes its bytes
/// through unchanged. Re-encoding to another format is refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTransformer;

#[async_trait]
impl Transformer for PassthroughTransformer {
    async fn transform(&self, input: Bytes, options: &TransformOptions) -> Result<Transformed, TransformError> {
        if input.is_empty() {
            return Err(TransformError::Unsupported("empty image".to_string()));
        }
        let content_type = sniff_content_type(&input)
            .ok_or_else(|| TransformError::Unsupported("unrecognised image format".to_string()))?;

        if let Some(format) = &options.format {
            let wanted = content_type_for_format(format)
                .ok_or_else(|| TransformError::Unsupported(format!("unknown output format '{format}'")))?;
            if wanted != content_type {
                return Err(TransformError::Unsupported(format!(
                    "cannot convert {content_type} to {wanted}"
                )));
            }
        }
        if let Some(quality) = options.quality {
            if quality == 0 || quality > 100 {
                return Err(TransformError::Unsupported(format!("quality {quality} out of range")));
            }
        }

        Ok(Transformed {
            bytes: input,
            content_type,
        })
    }
}
