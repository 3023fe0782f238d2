use super::{db_failure, Services};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use mediaflow_db::MediaRecord;
use mediaflow_jobs::{Job, JobContext, JobError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Metadata snapshot written by `backup` and read back by `restore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub records: Vec<MediaRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupData {
    /// Target backend; the default backend when absent.
    #[serde(default)]
    pub storage: Option<String>,
    /// Snapshot name; the creation timestamp when absent.
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOutput {
    pub storage_key: String,
    pub storage_backend: String,
    pub url: String,
    pub records: usize,
    pub size_bytes: usize,
}

pub struct BackupJob {
    services: Services,
}

impl BackupJob {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !label.starts_with('.')
}

#[async_trait]
impl Job for BackupJob {
    const NAME: &'static str = "backup";
    type Data = BackupData;
    type Output = BackupOutput;

    async fn execute(&self, ctx: JobContext, data: BackupData) -> Result<BackupOutput> {
        let created_at = Utc::now();
        let label = match data.label {
            Some(label) if valid_label(&label) => label,
            Some(label) => return Err(JobError::invalid(format!("invalid backup label '{label}'"))),
            None => created_at.format("%Y%m%dT%H%M%S%.3fZ").to_string(),
        };
        let store = self
            .services
            .storage
            .resolve(data.storage.as_deref())
            .map_err(|e| JobError::invalid(e.to_string()))?;

        let records = self.services.db.export_all().await.map_err(db_failure)?;
        ctx.report_progress(30).await?;

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            created_at,
            records,
        };
        let body = serde_json::to_vec(&snapshot)?;
        let size_bytes = body.len();
        ctx.report_progress(60).await?;

        let key = format!("backups/{label}.json");
        let url = store.put(&key, Bytes::from(body), "application/json").await?;
        ctx.report_progress(100).await?;

        info!(
            job_id = %ctx.job_id,
            key = %key,
            records = snapshot.records.len(),
            size_bytes,
            "Backup written"
        );
        Ok(BackupOutput {
            storage_key: key,
            storage_backend: store.name().to_string(),
            url,
            records: snapshot.records.len(),
            size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_stay_inside_backups() {
        assert!(valid_label("nightly-2024_01.v2"));
        assert!(!valid_label("../escape"));
        assert!(!valid_label(".hidden"));
        assert!(!valid_label(""));
    }
}
