use super::{db_failure, percent, Services};
use crate::storage::ObjectStore;
use async_trait::async_trait;
use mediaflow_db::{MediaField, MediaPatch, MediaRecord};
use mediaflow_jobs::{ConcurrencyLimiter, Job, JobContext, JobError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Object copies in flight per migration.
pub const DEFAULT_FAN_OUT: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateData {
    pub from: String,
    pub to: String,
    /// Only these rows; every row on `from` when absent.
    #[serde(default)]
    pub ids: Option<Vec<i64>>,
    #[serde(default)]
    pub delete_source: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateItemError {
    pub id: i64,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateOutput {
    pub total: usize,
    pub migrated: usize,
    pub failed: usize,
    pub errors: Vec<MigrateItemError>,
}

/// Copies objects between backends, then repoints their metadata in one
/// batch update.
///
/// Rows whose copy failed keep pointing at the source backend.
pub struct MigrateJob {
    services: Services,
    limiter: ConcurrencyLimiter,
}

impl MigrateJob {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            limiter: ConcurrencyLimiter::new(DEFAULT_FAN_OUT),
        }
    }

    async fn candidates(&self, data: &MigrateData) -> Result<(Vec<MediaRecord>, Vec<MigrateItemError>)> {
        let db = &self.services.db;
        let Some(ids) = &data.ids else {
            return Ok((db.list_by_backend(&data.from).await.map_err(db_failure)?, Vec::new()));
        };

        let found = db.get_by_ids(ids).await.map_err(db_failure)?;
        let mut errors: Vec<MigrateItemError> = ids
            .iter()
            .filter(|id| !found.iter().any(|r| r.id == **id))
            .map(|id| MigrateItemError {
                id: *id,
                error: "media not found".to_string(),
            })
            .collect();
        let mut records = Vec::new();
        for record in found {
            if record.storage_backend == data.from {
                records.push(record);
            } else {
                errors.push(MigrateItemError {
                    id: record.id,
                    error: format!("stored on {}, not {}", record.storage_backend, data.from),
                });
            }
        }
        Ok((records, errors))
    }
}

async fn copy_object(
    source: &dyn ObjectStore,
    target: &dyn ObjectStore,
    record: &MediaRecord,
) -> std::result::Result<(), String> {
    let bytes = source
        .get(&record.storage_key)
        .await
        .map_err(|e| e.to_string())?;
    target
        .put(&record.storage_key, bytes, &record.content_type)
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

#[async_trait]
impl Job for MigrateJob {
    const NAME: &'static str = "migrate";
    type Data = MigrateData;
    type Output = MigrateOutput;

    async fn execute(&self, ctx: JobContext, data: MigrateData) -> Result<MigrateOutput> {
        if data.from == data.to {
            return Err(JobError::invalid("source and target backends are the same"));
        }
        let invalid = |e: crate::storage::StorageError| JobError::invalid(e.to_string());
        let source: Arc<dyn ObjectStore> = self.services.storage.get(&data.from).map_err(invalid)?;
        let target: Arc<dyn ObjectStore> = self.services.storage.get(&data.to).map_err(invalid)?;

        let (records, mut errors) = self.candidates(&data).await?;
        let total = records.len() + errors.len();

        let settled = AtomicUsize::new(0);
        let (settled, ctx_ref) = (&settled, &ctx);
        let (source_ref, target_ref) = (source.as_ref(), target.as_ref());
        let copies = self
            .limiter
            .map(records, move |_, record| async move {
                let outcome = copy_object(source_ref, target_ref, &record).await;
                let done = settled.fetch_add(1, Ordering::SeqCst) + 1;
                if let Err(e) = ctx_ref.report_progress(percent(done, total).min(90)).await {
                    warn!(job_id = %ctx_ref.job_id, error = %e, "Progress update failed");
                }
                (record, outcome)
            })
            .await;

        let mut moved = Vec::new();
        for (record, outcome) in copies {
            match outcome {
                Ok(()) => moved.push(record),
                Err(error) => {
                    warn!(job_id = %ctx.job_id, media_id = record.id, error = %error, "Object copy failed");
                    errors.push(MigrateItemError {
                        id: record.id,
                        error,
                    });
                }
            }
        }

        let patches: Vec<MediaPatch> = moved
            .iter()
            .map(|r| MediaPatch::new(r.id).set(MediaField::StorageBackend(data.to.clone())))
            .collect();
        if !patches.is_empty() {
            // Copies already landed on the target; a failure here must not be retried blindly
            self.services
                .db
                .batch_update(&patches)
                .await
                .map_err(|e| JobError::Unrecoverable(format!("metadata update failed: {e}")))?;
        }

        if data.delete_source {
            for record in &moved {
                if let Err(e) = source.delete(&record.storage_key).await {
                    warn!(job_id = %ctx.job_id, media_id = record.id, error = %e, "Source object not deleted");
                }
            }
        }
        ctx.report_progress(100).await?;

        errors.sort_by_key(|e| e.id);
        info!(
            job_id = %ctx.job_id,
            from = %data.from,
            to = %data.to,
            migrated = moved.len(),
            failed = errors.len(),
            "Storage migration finished"
        );
        Ok(MigrateOutput {
            total,
            migrated: moved.len(),
            failed: errors.len(),
            errors,
        })
    }
}
