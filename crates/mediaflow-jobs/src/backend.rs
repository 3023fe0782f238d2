use crate::error::Result;
use crate::job::JobRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Job counts of one queue, by state.
///
/// `waiting` excludes delayed jobs, which are counted separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

/// Outcome of recovering one stalled job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledJob {
    pub job_id: String,
    /// False when the job exceeded its stall budget and was failed instead.
    pub requeued: bool,
}

/// Message recorded on jobs that stalled too often.
pub const STALLED_LIMIT_REASON: &str = "job stalled more than allowable limit";

/// Backend storage for jobs
///
/// A backend is shared by every queue of a process; each call is scoped by
/// queue name. Only the worker holding a job (or the backend's own stall
/// recovery) mutates an active job.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Check that the broker is reachable.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Durably record a new job in `waiting`.
    ///
    /// Pushing an id that already exists in the queue leaves the existing
    /// job untouched.
    async fn push(&self, job: JobRecord) -> Result<()>;

    /// Claim the next ready job of one of `job_types` (any type when empty).
    ///
    /// The job becomes `active` with a lease of `lock` and a fresh lease
    /// token in `JobRecord::lease`. Lower priority values win; ties go to
    /// the oldest job.
    async fn claim(
        &self,
        queue: &str,
        job_types: &[String],
        lock: Duration,
    ) -> Result<Option<JobRecord>>;

    // The writes below are accepted only while the job is `active` under
    // the given lease token. Anything else yields `JobError::LeaseLost`.

    /// Renew the lease of an active job.
    async fn extend_lock(&self, queue: &str, job_id: &str, lease: u64, lock: Duration) -> Result<()>;

    /// Raise the progress of an active job. Lower values are ignored.
    async fn update_progress(&self, queue: &str, job_id: &str, lease: u64, progress: u8) -> Result<()>;

    /// Mark an active job completed with its result.
    async fn complete(
        &self,
        queue: &str,
        job_id: &str,
        lease: u64,
        result: serde_json::Value,
    ) -> Result<()>;

    /// Record a failed attempt.
    ///
    /// With `retry_at` the job returns to `waiting` (progress reset) and is
    /// claimable again from that instant; without it the job is `failed`.
    /// Either way `attempts_made` grows by one.
    async fn fail(
        &self,
        queue: &str,
        job_id: &str,
        lease: u64,
        reason: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Fetch a job, `None` when unknown or evicted.
    async fn get(&self, queue: &str, job_id: &str) -> Result<Option<JobRecord>>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts>;

    /// Return active jobs whose lease expired to `waiting`, or fail them
    /// once they stalled more than `max_stalled_count` times. The attempt
    /// counter is left unchanged.
    async fn recover_stalled(&self, queue: &str, max_stalled_count: u32)
        -> Result<Vec<StalledJob>>;

    /// Evict the oldest terminal jobs beyond the retention counts.
    async fn prune(&self, queue: &str, keep_completed: usize, keep_failed: usize) -> Result<u64>;

    /// Wait for a job to become available or for the timeout to expire.
    ///
    /// Backends can implement event-driven notifications to wake workers quickly.
    async fn wait_for_job(&self, _queue: &str, timeout: Duration) -> Result<()> {
        tokio::time::sleep(timeout).await;
        Ok(())
    }

    /// Release broker connections.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
