use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unrecoverable error: {0}")]
    Unrecoverable(String),

    #[error("Job timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Queue is shutting down")]
    ShuttingDown,

    /// The job was re-delivered after this worker's lease expired.
    #[error("Lease lost for job {0}")]
    LeaseLost(String),
}

impl JobError {
    /// Whether another attempt could change the outcome.
    ///
    /// Malformed input stays malformed, so validation failures go straight
    /// to `failed` regardless of the remaining attempt budget.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            JobError::InvalidPayload(_)
                | JobError::Unrecoverable(_)
                | JobError::UnknownJobType(_)
                | JobError::SerializationError(_)
                | JobError::LeaseLost(_)
        )
    }

    /// Shorthand for processors reporting a transient failure.
    pub fn worker(message: impl Into<String>) -> Self {
        JobError::WorkerError(message.into())
    }

    /// Shorthand for processors rejecting their input.
    pub fn invalid(message: impl Into<String>) -> Self {
        JobError::InvalidPayload(message.into())
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
