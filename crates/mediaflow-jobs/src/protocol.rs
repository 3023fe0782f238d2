//! JSON bodies exchanged between a submitting client and the server.

use crate::job::{JobState, JobStatus};
use crate::manager::Submission;
use serde::{Deserialize, Serialize};

/// Path under which a job's status is served.
pub fn status_path(queue: &str, job_id: &str) -> String {
    format!("/api/jobs/{queue}/{job_id}")
}

/// Body returned when a job is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    #[serde(rename = "async")]
    pub is_async: bool,
    pub job_id: String,
    pub queue: String,
    pub message: String,
    pub status_url: String,
}

impl SubmitResponse {
    /// `base_url` is prefixed to the status path (may be empty).
    pub fn accepted(submission: &Submission, base_url: &str) -> Self {
        Self {
            success: true,
            is_async: true,
            job_id: submission.job_id.clone(),
            queue: submission.queue.clone(),
            message: format!("Job queued on {}", submission.queue),
            status_url: format!(
                "{}{}",
                base_url.trim_end_matches('/'),
                status_path(&submission.queue, &submission.job_id)
            ),
        }
    }
}

/// Body returned by a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts_made: Option<u32>,
}

impl From<JobStatus> for StatusResponse {
    fn from(status: JobStatus) -> Self {
        Self {
            success: true,
            exists: status.exists,
            state: status.state,
            progress: status.progress,
            result: status.result,
            error: status.failure_reason,
            attempts_made: status.exists.then_some(status.attempts_made),
        }
    }
}
