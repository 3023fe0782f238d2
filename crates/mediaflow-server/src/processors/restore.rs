use super::backup::{Snapshot, SNAPSHOT_VERSION};
use super::{db_failure, percent, Services};
use crate::storage::StorageError;
use async_trait::async_trait;
use futures_util::StreamExt;
use mediaflow_db::{ImportSummary, NewMedia};
use mediaflow_jobs::{Job, JobContext, JobError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreData {
    /// Key of a snapshot written by `backup`.
    pub storage_key: String,
    #[serde(default)]
    pub storage: Option<String>,
    /// Leave rows whose storage key already exists untouched.
    #[serde(default = "default_skip_existing")]
    pub skip_existing: bool,
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

fn default_skip_existing() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutput {
    pub total: usize,
    pub skipped: usize,
    #[serde(flatten)]
    pub import: ImportSummary,
}

/// Re-imports a snapshot chunk by chunk.
///
/// A failed chunk does not stop the restore; it shows up in `failures`.
pub struct RestoreJob {
    services: Services,
}

impl RestoreJob {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn existing(&self, rows: &[NewMedia]) -> Result<HashSet<String>> {
        let mut found = HashSet::new();
        for chunk in rows.chunks(DEFAULT_CHUNK_SIZE) {
            let keys: Vec<String> = chunk.iter().map(|r| r.storage_key.clone()).collect();
            found.extend(self.services.db.existing_keys(&keys).await.map_err(db_failure)?);
        }
        Ok(found)
    }
}

#[async_trait]
impl Job for RestoreJob {
    const NAME: &'static str = "restore";
    type Data = RestoreData;
    type Output = RestoreOutput;

    async fn execute(&self, ctx: JobContext, data: RestoreData) -> Result<RestoreOutput> {
        let store = self
            .services
            .storage
            .resolve(data.storage.as_deref())
            .map_err(|e| JobError::invalid(e.to_string()))?;

        let body = match store.get(&data.storage_key).await {
            Ok(body) => body,
            Err(StorageError::NotFound(key)) => {
                return Err(JobError::invalid(format!("snapshot {key} does not exist")))
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&body)
            .map_err(|e| JobError::invalid(format!("malformed snapshot: {e}")))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(JobError::invalid(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        ctx.report_progress(5).await?;

        let total = snapshot.records.len();
        let mut rows: Vec<NewMedia> = snapshot.records.into_iter().map(NewMedia::from).collect();
        let mut skipped = 0;
        if data.skip_existing {
            let existing = self.existing(&rows).await?;
            rows.retain(|row| !existing.contains(&row.storage_key));
            skipped = total - rows.len();
        }

        let to_import = rows.len();
        let mut import = ImportSummary::default();
        let mut done = 0;
        let mut outcomes = Box::pin(
            self.services
                .db
                .chunked_bulk_import(rows, data.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)),
        );
        while let Some(outcome) = outcomes.next().await {
            import.record(&outcome);
            done += outcome.len;
            ctx.report_progress(percent(done, to_import).max(5)).await?;
        }
        ctx.report_progress(100).await?;

        if import.failed_rows > 0 {
            warn!(
                job_id = %ctx.job_id,
                failed_rows = import.failed_rows,
                chunks = import.failures.len(),
                "Restore finished with failed chunks"
            );
        }
        info!(job_id = %ctx.job_id, total, skipped, inserted = import.inserted, "Restore finished");
        Ok(RestoreOutput {
            total,
            skipped,
            import,
        })
    }
}
