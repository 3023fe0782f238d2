//! Lifecycle events broadcast by every queue.

use serde::Serialize;

/// Something that happened to a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum QueueEvent {
    /// A worker claimed the job and started an attempt.
    Active {
        job_id: String,
        job_type: String,
        attempt: u32,
    },
    Progress {
        job_id: String,
        progress: u8,
    },
    Completed {
        job_id: String,
        result: serde_json::Value,
    },
    /// An attempt failed. `will_retry` is false once the job is terminal.
    Failed {
        job_id: String,
        reason: String,
        attempts_made: u32,
        will_retry: bool,
    },
    /// The job's lease expired while it was active.
    Stalled {
        job_id: String,
        requeued: bool,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> &str {
        match self {
            QueueEvent::Active { job_id, .. }
            | QueueEvent::Progress { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::Stalled { job_id, .. } => job_id,
        }
    }

    /// Whether the job cannot change state after this event.
    pub fn is_terminal(&self) -> bool {
        match self {
            QueueEvent::Completed { .. } => true,
            QueueEvent::Failed { will_retry, .. } => !will_retry,
            QueueEvent::Stalled { requeued, .. } => !requeued,
            _ => false,
        }
    }
}
