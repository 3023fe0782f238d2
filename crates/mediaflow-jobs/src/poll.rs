//! Client side of the submit-then-poll protocol.
//!
//! After a submission the client reads the job's status URL once per
//! `interval` until the job is terminal. Transport errors slow the cadence
//! to `error_interval` but never end the loop; only the attempt budget
//! does. Giving up is client-side abandonment: the job keeps running.

use crate::job::JobState;
use crate::protocol::{StatusResponse, SubmitResponse};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("Job failed after {attempts_made} attempt(s): {reason}")]
    JobFailed { reason: String, attempts_made: u32 },

    #[error("Timed out waiting for job {job_id} after {polls} status checks")]
    TimedOut { job_id: String, polls: u32 },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected status response: {0}")]
    Protocol(String),
}

impl PollError {
    /// Errors that only slow polling down.
    pub fn is_transient(&self) -> bool {
        matches!(self, PollError::Transport(_))
    }
}

/// Where status bodies come from (HTTP in production).
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self, status_url: &str) -> Result<StatusResponse, PollError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub error_interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            error_interval: Duration::from_secs(2),
            max_attempts: 600,
        }
    }
}

pub struct StatusPoller<S> {
    source: S,
    config: PollConfig,
}

impl<S: StatusSource> StatusPoller<S> {
    pub fn new(source: S) -> Self {
        Self::with_config(source, PollConfig::default())
    }

    pub fn with_config(source: S, config: PollConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Follow a submission until its job completes (its result) or fails.
    pub async fn wait(&self, submission: &SubmitResponse) -> Result<serde_json::Value, PollError> {
        self.wait_with_progress(&submission.job_id, &submission.status_url, |_| {})
            .await
    }

    /// Like [`wait`](Self::wait), calling `on_progress` on every status
    /// read of a non-terminal job.
    pub async fn wait_with_progress<F>(
        &self,
        job_id: &str,
        status_url: &str,
        mut on_progress: F,
    ) -> Result<serde_json::Value, PollError>
    where
        F: FnMut(u8) + Send,
    {
        let mut delay = self.config.interval;

        for poll in 1..=self.config.max_attempts {
            tokio::time::sleep(delay).await;

            let status = match self.source.fetch(status_url).await {
                Ok(status) => status,
                Err(e) if e.is_transient() => {
                    warn!(job_id, poll, error = %e, "Status check failed, backing off");
                    delay = self.config.error_interval;
                    continue;
                }
                Err(e) => return Err(e),
            };
            delay = self.config.interval;

            if !status.exists {
                return Err(PollError::JobNotFound(job_id.to_string()));
            }

            match status.state {
                Some(JobState::Completed) => {
                    return Ok(status.result.unwrap_or(serde_json::Value::Null));
                }
                Some(JobState::Failed) => {
                    return Err(PollError::JobFailed {
                        reason: status.error.unwrap_or_else(|| "Job failed".to_string()),
                        attempts_made: status.attempts_made.unwrap_or(0),
                    });
                }
                state => {
                    debug!(job_id, poll, ?state, progress = status.progress, "Job in progress");
                    on_progress(status.progress);
                }
            }
        }

        Err(PollError::TimedOut {
            job_id: job_id.to_string(),
            polls: self.config.max_attempts,
        })
    }
}
