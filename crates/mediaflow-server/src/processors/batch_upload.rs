use super::upload::{UploadData, UploadJob};
use super::percent;
use async_trait::async_trait;
use mediaflow_jobs::{
    ConcurrencyLimiter, EnqueueOptions, Job, JobContext, JobError, JobQueue, JobState, Result,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Sub-uploads in flight per batch.
pub const DEFAULT_FAN_OUT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUploadData {
    pub items: Vec<UploadData>,
    /// Applied to items that leave these unset.
    #[serde(default)]
    pub storage: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub quality: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    pub index: usize,
    pub job_id: String,
    pub result: serde_json::Value,
}

/// A sub-item that did not complete. `index` is 0-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemError {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub job_id: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUploadOutput {
    pub total: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub results: Vec<BatchItemResult>,
    pub errors: Vec<BatchItemError>,
}

/// Fans a batch out as independent `upload` jobs and collects them.
///
/// Each child keeps its own retry policy. The parent never fails because
/// of a child: failed children are reported in `errors`.
pub struct BatchUploadJob {
    children: JobQueue,
    limiter: ConcurrencyLimiter,
    child_timeout: Option<Duration>,
}

impl BatchUploadJob {
    pub fn new(children: JobQueue) -> Self {
        Self {
            children,
            limiter: ConcurrencyLimiter::new(DEFAULT_FAN_OUT),
            child_timeout: Some(Duration::from_secs(600)),
        }
    }

    pub fn fan_out(mut self, limit: usize) -> Self {
        self.limiter = ConcurrencyLimiter::new(limit);
        self
    }

    /// How long to wait for one child; `None` waits indefinitely.
    pub fn child_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.child_timeout = timeout;
        self
    }

    async fn run_child(
        &self,
        parent: &str,
        index: usize,
        item: UploadData,
    ) -> std::result::Result<BatchItemResult, BatchItemError> {
        let fail = |job_id: Option<String>, error: String| BatchItemError { index, job_id, error };

        let payload = serde_json::to_value(&item).map_err(|e| fail(None, e.to_string()))?;
        let job_id = self
            .children
            .enqueue_raw(UploadJob::NAME, payload, &EnqueueOptions::new())
            .await
            .map_err(|e| fail(None, e.to_string()))?;

        let status = self
            .children
            .wait_for(&job_id, self.child_timeout)
            .await
            .map_err(|e| fail(Some(job_id.clone()), e.to_string()))?;

        match status.state {
            Some(JobState::Completed) => Ok(BatchItemResult {
                index,
                job_id,
                result: status.result.unwrap_or(serde_json::Value::Null),
            }),
            Some(JobState::Failed) => {
                let reason = status
                    .failure_reason
                    .unwrap_or_else(|| "child job failed".to_string());
                warn!(parent = parent, child = %job_id, index, error = %reason, "Batch item failed");
                Err(fail(Some(job_id), reason))
            }
            _ => Err(fail(Some(job_id), "child job is no longer available".to_string())),
        }
    }
}

#[async_trait]
impl Job for BatchUploadJob {
    const NAME: &'static str = "batch-upload";
    type Data = BatchUploadData;
    type Output = BatchUploadOutput;

    async fn execute(&self, ctx: JobContext, data: BatchUploadData) -> Result<BatchUploadOutput> {
        if data.items.is_empty() {
            return Err(JobError::invalid("batch contains no items"));
        }

        let total = data.items.len();
        let items: Vec<UploadData> = data
            .items
            .into_iter()
            .map(|mut item| {
                item.storage = item.storage.or_else(|| data.storage.clone());
                item.format = item.format.or_else(|| data.format.clone());
                item.quality = item.quality.or(data.quality);
                item
            })
            .collect();

        let settled = AtomicUsize::new(0);
        let (settled, ctx_ref) = (&settled, &ctx);
        let outcomes = self
            .limiter
            .map(items, move |index, item| async move {
                let outcome = self.run_child(&ctx_ref.job_id, index, item).await;
                let done = settled.fetch_add(1, Ordering::SeqCst) + 1;
                if let Err(e) = ctx_ref.report_progress(percent(done, total)).await {
                    warn!(job_id = %ctx_ref.job_id, error = %e, "Progress update failed");
                }
                outcome
            })
            .await;

        let mut results = Vec::new();
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(result) => results.push(result),
                Err(error) => errors.push(error),
            }
        }

        info!(
            job_id = %ctx.job_id,
            total,
            succeeded = results.len(),
            failed = errors.len(),
            "Batch upload finished"
        );
        Ok(BatchUploadOutput {
            total,
            success_count: results.len(),
            fail_count: errors.len(),
            results,
            errors,
        })
    }
}
