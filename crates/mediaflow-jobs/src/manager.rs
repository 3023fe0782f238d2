//! Owner of every named queue of a process.
//!
//! A `QueueManager` is built once at startup and handed (usually as an
//! `Arc`) to whatever submits jobs or queries their status.

use crate::backend::memory::InMemoryBackend;
use crate::backend::{JobBackend, QueueCounts};
use crate::error::{JobError, Result};
use crate::events::QueueEvent;
use crate::job::{Job, JobHandler, JobStatus};
use crate::options::{EnqueueOptions, QueueOptions};
use crate::queue::{JobQueue, MetricsSnapshot};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

/// Handle returned by a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub job_id: String,
    pub queue: String,
}

/// Operational view of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: String,
    #[serde(flatten)]
    pub counts: QueueCounts,
    pub metrics: MetricsSnapshot,
}

pub struct QueueManager {
    backend: Arc<dyn JobBackend>,
    queues: RwLock<HashMap<String, JobQueue>>,
    closed: AtomicBool,
}

impl QueueManager {
    pub fn new(backend: Arc<dyn JobBackend>) -> Self {
        Self {
            backend,
            queues: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Manager backed by the in-process broker.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    pub fn backend(&self) -> Arc<dyn JobBackend> {
        self.backend.clone()
    }

    /// Fails when the broker cannot be reached.
    pub async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }

    /// Create a queue, or return the existing one of that name.
    ///
    /// Options only apply on first creation.
    pub async fn add_queue(&self, name: &str, options: QueueOptions) -> JobQueue {
        let mut queues = self.queues.write().await;
        queues
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(queue = name, "Queue created");
                JobQueue::named(name, self.backend.clone(), options)
            })
            .clone()
    }

    pub async fn queue(&self, name: &str) -> Result<JobQueue> {
        self.queues
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::QueueNotFound(name.to_string()))
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Register the processor of a `(queue, job type)` pair.
    pub async fn register<J: Job>(&self, queue: &str, job: J, concurrency: usize) -> Result<()> {
        self.register_handler(queue, J::NAME, Arc::new(job), concurrency)
            .await
    }

    pub async fn register_handler(
        &self,
        queue: &str,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Result<()> {
        let queue = self.queue(queue).await?;
        queue.register_handler(job_type, handler, concurrency).await;
        Ok(())
    }

    /// Start the workers of every queue.
    pub async fn start(&self) {
        let queues: Vec<JobQueue> = self.queues.read().await.values().cloned().collect();
        for queue in queues {
            queue.start().await;
        }
    }

    /// Enqueue a job and return as soon as the broker has recorded it.
    ///
    /// Unknown queues and job types without a processor are rejected here
    /// rather than failing later on a worker.
    pub async fn submit(
        &self,
        queue_name: &str,
        job_type: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<Submission> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(JobError::ShuttingDown);
        }

        let queue = self.queue(queue_name).await?;
        if !queue.has_job_type(job_type).await {
            return Err(JobError::UnknownJobType(format!(
                "{job_type} (queue {queue_name})"
            )));
        }

        let job_id = queue.enqueue_raw(job_type, payload, &opts).await?;
        Ok(Submission {
            job_id,
            queue: queue_name.to_string(),
        })
    }

    /// Pure read; `exists: false` for ids the broker does not know.
    pub async fn status(&self, queue: &str, job_id: &str) -> Result<JobStatus> {
        self.queue(queue).await?.status(job_id).await
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let q = self.queue(queue).await?;
        Ok(QueueStats {
            queue: queue.to_string(),
            counts: q.counts().await?,
            metrics: q.metrics(),
        })
    }

    pub async fn subscribe(&self, queue: &str) -> Result<broadcast::Receiver<QueueEvent>> {
        Ok(self.queue(queue).await?.subscribe())
    }

    /// Stop every queue, wait up to `grace` for in-flight jobs, then close
    /// the broker. Runs at most once.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(grace_secs = grace.as_secs(), "Shutting down queues");
        let queues: Vec<JobQueue> = self.queues.read().await.values().cloned().collect();
        futures_util::future::join_all(queues.iter().map(|q| q.shutdown(grace))).await;

        if let Err(e) = self.backend.close().await {
            warn!(error = %e, "Closing broker failed");
            return Err(e);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
