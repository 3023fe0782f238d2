use crate::backend::JobBackend;
use crate::error::{JobError, Result};
use crate::events::QueueEvent;
use crate::options::JobOptions;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Lifecycle state of a job.
///
/// `waiting -> active -> completed | failed`. A failed attempt with budget
/// left goes back to `waiting`; terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as stored by the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub progress: u8,
    pub attempts_made: u32,
    pub stalled_count: u32,
    pub options: JobOptions,
    pub result: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Not claimable before this instant (delayed or backing off).
    pub run_at: Option<DateTime<Utc>>,
    /// Lease of the worker currently holding the job.
    pub locked_until: Option<DateTime<Utc>>,
    /// Bumped on every claim; writes carrying an older value are rejected.
    #[serde(default)]
    pub lease: u64,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(
        id: String,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
        run_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            queue: queue.to_string(),
            job_type: job_type.to_string(),
            payload,
            state: JobState::Waiting,
            progress: 0,
            attempts_made: 0,
            stalled_count: 0,
            options,
            result: None,
            failure_reason: None,
            created_at: Utc::now(),
            run_at,
            locked_until: None,
            lease: 0,
            finished_at: None,
        }
    }

    /// Waiting and not held back by a delay.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.run_at.map_or(true, |at| at <= now)
    }

    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.run_at.map_or(false, |at| at > now)
    }

    /// Active with an expired lease.
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.locked_until.map_or(true, |at| at < now)
    }
}

/// Point-in-time view of a job returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub exists: bool,
    pub state: Option<JobState>,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub attempts_made: u32,
}

impl JobStatus {
    /// Unknown or evicted job.
    pub fn missing() -> Self {
        Self {
            exists: false,
            state: None,
            progress: 0,
            result: None,
            failure_reason: None,
            attempts_made: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.map_or(false, |s| s.is_terminal())
    }
}

impl From<&JobRecord> for JobStatus {
    fn from(record: &JobRecord) -> Self {
        Self {
            exists: true,
            state: Some(record.state),
            progress: record.progress,
            result: match record.state {
                JobState::Completed => record.result.clone(),
                _ => None,
            },
            failure_reason: match record.state {
                JobState::Failed => record.failure_reason.clone(),
                _ => None,
            },
            attempts_made: record.attempts_made,
        }
    }
}

/// Writes progress for the attempt a worker is currently running.
///
/// Values only move forward: a report lower than the last accepted one is
/// dropped.
#[derive(Clone)]
pub struct ProgressReporter {
    current: Arc<AtomicU8>,
    sink: Option<ProgressSink>,
}

#[derive(Clone)]
struct ProgressSink {
    backend: Arc<dyn JobBackend>,
    events: broadcast::Sender<QueueEvent>,
    queue: String,
    job_id: String,
    lease: u64,
}

impl ProgressReporter {
    pub(crate) fn new(
        backend: Arc<dyn JobBackend>,
        events: broadcast::Sender<QueueEvent>,
        record: &JobRecord,
    ) -> Self {
        Self {
            current: Arc::new(AtomicU8::new(0)),
            sink: Some(ProgressSink {
                backend,
                events,
                queue: record.queue.clone(),
                job_id: record.id.clone(),
                lease: record.lease,
            }),
        }
    }

    /// A reporter that only tracks the value locally.
    pub fn detached() -> Self {
        Self {
            current: Arc::new(AtomicU8::new(0)),
            sink: None,
        }
    }

    pub fn current(&self) -> u8 {
        self.current.load(Ordering::SeqCst)
    }

    /// Report progress (clamped to 0..=100).
    pub async fn report(&self, progress: u8) -> Result<()> {
        let progress = progress.min(100);
        let previous = self.current.fetch_max(progress, Ordering::SeqCst);
        if progress <= previous {
            return Ok(());
        }

        if let Some(sink) = &self.sink {
            sink.backend
                .update_progress(&sink.queue, &sink.job_id, sink.lease, progress)
                .await?;
            let _ = sink.events.send(QueueEvent::Progress {
                job_id: sink.job_id.clone(),
                progress,
            });
        }
        Ok(())
    }
}

impl Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("current", &self.current())
            .field("attached", &self.sink.is_some())
            .finish()
    }
}

/// Context passed to job execution
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub queue: String,
    pub job_type: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub progress: ProgressReporter,
}

impl JobContext {
    pub(crate) fn for_record(record: &JobRecord, progress: ProgressReporter) -> Self {
        Self {
            job_id: record.id.clone(),
            queue: record.queue.clone(),
            job_type: record.job_type.clone(),
            attempt: record.attempts_made + 1,
            max_attempts: record.options.max_attempts,
            created_at: record.created_at,
            progress,
        }
    }

    /// Context for running a processor outside of any queue.
    pub fn standalone(job_id: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            queue: String::new(),
            job_type: job_type.into(),
            attempt: 1,
            max_attempts: 1,
            created_at: Utc::now(),
            progress: ProgressReporter::detached(),
        }
    }

    pub async fn report_progress(&self, progress: u8) -> Result<()> {
        self.progress.report(progress).await
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A job that can be executed
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// The job name/type
    const NAME: &'static str;

    /// The data required by the job
    type Data: Serialize + DeserializeOwned + Send + Sync + Debug;

    /// What a successful run reports back to the submitter
    type Output: Serialize + Send;

    /// Execute the job
    async fn execute(&self, ctx: JobContext, data: Self::Data) -> Result<Self::Output>;
}

/// A type-erased job handler
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, data: serde_json::Value) -> Result<serde_json::Value>;
}

#[async_trait]
impl<J: Job> JobHandler for J {
    async fn handle(&self, ctx: JobContext, data: serde_json::Value) -> Result<serde_json::Value> {
        let data: J::Data =
            serde_json::from_value(data).map_err(|e| JobError::InvalidPayload(e.to_string()))?;
        let output = self.execute(ctx, data).await?;
        Ok(serde_json::to_value(output)?)
    }
}
