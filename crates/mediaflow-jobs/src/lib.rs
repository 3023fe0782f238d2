//! Background job orchestration for mediaflow
//!
//! Named queues with per-type worker pools, retries with backoff, lease
//! based stall recovery, progress reporting and the status-polling client.
//!
//! ```no_run
//! use mediaflow_jobs::{EnqueueOptions, QueueManager, QueueOptions};
//!
//! # async fn demo() -> mediaflow_jobs::Result<()> {
//! let manager = QueueManager::in_memory();
//! manager.add_queue("image-processing", QueueOptions::new().attempts(3)).await;
//! // manager.register("image-processing", UploadJob, 5).await?;
//! manager.start().await;
//! # let _ = EnqueueOptions::new();
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod events;
pub mod job;
pub mod limiter;
pub mod manager;
pub mod options;
pub mod poll;
pub mod protocol;
pub mod queue;

pub use backend::memory::InMemoryBackend;
pub use backend::{JobBackend, QueueCounts, StalledJob, STALLED_LIMIT_REASON};
pub use error::{JobError, Result};
pub use events::QueueEvent;
pub use job::{Job, JobContext, JobHandler, JobRecord, JobState, JobStatus, ProgressReporter};
pub use limiter::ConcurrencyLimiter;
pub use manager::{QueueManager, QueueStats, Submission};
pub use options::{Backoff, EnqueueOptions, JobOptions, QueueOptions};
pub use poll::{PollConfig, PollError, StatusPoller, StatusSource};
pub use protocol::{status_path, StatusResponse, SubmitResponse};
pub use queue::{JobQueue, MetricsSnapshot};

#[cfg(feature = "postgres")]
pub use backend::postgres::PostgresBackend;
