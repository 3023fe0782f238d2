use super::{db_failure, Services};
use crate::transform::TransformOptions;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use mediaflow_db::NewMedia;
use mediaflow_jobs::{Job, JobContext, JobError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One image to ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadData {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Base64-encoded file contents.
    pub data: String,
    /// Storage backend name; the default backend when absent.
    #[serde(default)]
    pub storage: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub quality: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutput {
    pub id: i64,
    pub url: String,
    pub storage_key: String,
    pub storage_backend: String,
    pub content_type: String,
    pub size_bytes: i64,
}

/// Validate, transform, store, then record metadata.
pub struct UploadJob {
    services: Services,
}

impl UploadJob {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl Job for UploadJob {
    const NAME: &'static str = "upload";
    type Data = UploadData;
    type Output = UploadOutput;

    async fn execute(&self, ctx: JobContext, data: UploadData) -> Result<UploadOutput> {
        let filename = sanitize_filename(data.filename.trim());
        if filename.is_empty() || filename.chars().all(|c| c == '.') {
            return Err(JobError::invalid("filename is required"));
        }
        let raw = STANDARD
            .decode(data.data.as_bytes())
            .map_err(|e| JobError::invalid(format!("data is not valid base64: {e}")))?;
        let store = self
            .services
            .storage
            .resolve(data.storage.as_deref())
            .map_err(|e| JobError::invalid(e.to_string()))?;
        ctx.report_progress(10).await?;

        let options = TransformOptions {
            format: data.format.clone(),
            quality: data.quality,
        };
        let transformed = self
            .services
            .transformer
            .transform(Bytes::from(raw), &options)
            .await?;
        ctx.report_progress(40).await?;

        let content_type = data
            .content_type
            .clone()
            .unwrap_or_else(|| transformed.content_type.to_string());
        let size_bytes = transformed.bytes.len() as i64;
        let key = format!("uploads/{}-{}", uuid::Uuid::new_v4(), filename);
        let url = store.put(&key, transformed.bytes, &content_type).await?;
        ctx.report_progress(70).await?;

        let row = NewMedia {
            filename: filename.clone(),
            storage_key: key.clone(),
            storage_backend: store.name().to_string(),
            content_type: content_type.clone(),
            size_bytes,
            width: None,
            height: None,
            created_at: None,
        };
        let id = match self.services.db.batch_insert(std::slice::from_ref(&row)).await {
            Ok(ids) => ids
                .first()
                .copied()
                .ok_or_else(|| JobError::worker("insert returned no id"))?,
            Err(e) => {
                // Leave no orphaned object behind
                if let Err(cleanup) = store.delete(&key).await {
                    warn!(job_id = %ctx.job_id, key = %key, error = %cleanup, "Orphaned object left in storage");
                }
                return Err(db_failure(e));
            }
        };
        ctx.report_progress(100).await?;

        debug!(job_id = %ctx.job_id, media_id = id, key = %key, size_bytes, "Upload stored");
        Ok(UploadOutput {
            id,
            url,
            storage_key: key,
            storage_backend: store.name().to_string(),
            content_type,
            size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryObjectStore, ObjectStore, StorageRegistry};
    use crate::transform::PassthroughTransformer;
    use mediaflow_db::MediaStore;
    use std::sync::Arc;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    async fn services() -> (Services, Arc<MemoryObjectStore>) {
        let store = Arc::new(MemoryObjectStore::new("memory"));
        let services = Services::new(
            MediaStore::in_memory().await.unwrap(),
            StorageRegistry::new("memory").with_store(store.clone()),
            Arc::new(PassthroughTransformer),
        );
        (services, store)
    }

    fn upload(filename: &str, bytes: &[u8]) -> UploadData {
        UploadData {
            filename: filename.to_string(),
            content_type: None,
            data: STANDARD.encode(bytes),
            storage: None,
            format: None,
            quality: None,
        }
    }

    #[test]
    fn filenames_are_flattened() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("my photo (1).png"), "my_photo__1_.png");
        assert_eq!(sanitize_filename("C:\\pics\\cat.jpg"), "cat.jpg");
    }

    #[tokio::test]
    async fn stores_object_and_metadata() {
        let (services, store) = services().await;
        let job = UploadJob::new(services.clone());

        let out = job
            .execute(JobContext::standalone("j1", UploadJob::NAME), upload("cat.png", PNG))
            .await
            .unwrap();

        assert_eq!(out.content_type, "image/png");
        assert_eq!(out.size_bytes, PNG.len() as i64);
        assert!(out.storage_key.ends_with("-cat.png"));
        assert_eq!(store.get(&out.storage_key).await.unwrap().as_ref(), PNG);

        let row = services.db.get(out.id).await.unwrap().unwrap();
        assert_eq!(row.storage_backend, "memory");
        assert_eq!(row.filename, "cat.png");
    }

    #[tokio::test]
    async fn rejects_bad_input_without_side_effects() {
        let (services, store) = services().await;
        let job = UploadJob::new(services.clone());

        let mut bad_base64 = upload("a.png", PNG);
        bad_base64.data = "***".into();
        let err = job
            .execute(JobContext::standalone("j", UploadJob::NAME), bad_base64)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload(_)));

        let err = job
            .execute(JobContext::standalone("j", UploadJob::NAME), upload("a.png", b"text"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());

        let mut unknown = upload("a.png", PNG);
        unknown.storage = Some("s3".into());
        assert!(job
            .execute(JobContext::standalone("j", UploadJob::NAME), unknown)
            .await
            .is_err());

        assert!(store.is_empty());
        assert_eq!(services.db.count().await.unwrap(), 0);
    }
}
