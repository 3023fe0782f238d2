use crate::backend::{JobBackend, QueueCounts, StalledJob};
use crate::error::{JobError, Result};
use crate::events::QueueEvent;
use crate::job::{Job, JobContext, JobHandler, JobRecord, JobStatus, ProgressReporter};
use crate::options::{EnqueueOptions, QueueOptions};
use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

/// How long `wait_for` trusts events before re-reading the backend.
const WAIT_RECHECK: Duration = Duration::from_millis(500);

/// A named queue: its processors, its worker pools and its event stream.
///
/// Cloning gives another handle to the same queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    options: QueueOptions,
    backend: Arc<dyn JobBackend>,
    handlers: RwLock<HashMap<String, Registration>>,
    events: broadcast::Sender<QueueEvent>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    metrics: QueueMetrics,
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
}

#[derive(Debug, Default)]
struct QueueMetrics {
    processed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    stalled: AtomicU64,
}

/// Counters since the queue was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub stalled: u64,
}

impl JobQueue {
    /// Create a queue named `default` with default options
    pub fn new<B: JobBackend + 'static>(backend: B) -> Self {
        Self::named("default", Arc::new(backend), QueueOptions::default())
    }

    /// Create a queue sharing `backend` with other queues
    pub fn named(name: impl Into<String>, backend: Arc<dyn JobBackend>, options: QueueOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                options,
                backend,
                handlers: RwLock::new(HashMap::new()),
                events,
                shutdown,
                started: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
                metrics: QueueMetrics::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    /// Register a job handler with a single worker
    pub async fn register_job<J: Job>(&self, job: J) {
        self.register_job_with_concurrency(job, 1).await;
    }

    /// Register a job handler served by `concurrency` parallel workers
    pub async fn register_job_with_concurrency<J: Job>(&self, job: J, concurrency: usize) {
        self.register_handler(J::NAME, Arc::new(job), concurrency)
            .await;
    }

    /// Register a type-erased handler
    pub async fn register_handler(
        &self,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) {
        let mut handlers = self.inner.handlers.write().await;
        handlers.insert(
            job_type.to_string(),
            Registration {
                handler,
                concurrency: concurrency.max(1),
            },
        );
    }

    /// Job types with a registered processor.
    pub async fn job_types(&self) -> Vec<String> {
        self.inner.handlers.read().await.keys().cloned().collect()
    }

    pub async fn has_job_type(&self, job_type: &str) -> bool {
        self.inner.handlers.read().await.contains_key(job_type)
    }

    /// Enqueue a job
    pub async fn enqueue<J: Job>(&self, data: J::Data) -> Result<String> {
        self.enqueue_opts::<J>(data, EnqueueOptions::default())
            .await
    }

    /// Enqueue a job with options
    pub async fn enqueue_opts<J: Job>(&self, data: J::Data, opts: EnqueueOptions) -> Result<String> {
        let payload = serde_json::to_value(data)?;
        self.enqueue_raw(J::NAME, payload, &opts).await
    }

    /// Enqueue an already-serialized payload.
    ///
    /// Returns once the backend has recorded the job; never waits for it
    /// to run.
    pub async fn enqueue_raw(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        opts: &EnqueueOptions,
    ) -> Result<String> {
        if *self.inner.shutdown.borrow() {
            return Err(JobError::ShuttingDown);
        }

        let id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let options = opts.resolve(&self.inner.options.default_job_options);
        let run_at = match opts.delay {
            Some(delay) => Some(
                Utc::now()
                    + chrono::Duration::from_std(delay)
                        .map_err(|e| JobError::ConfigError(e.to_string()))?,
            ),
            None => None,
        };

        let record = JobRecord::new(id.clone(), &self.inner.name, job_type, payload, options, run_at);
        self.inner.backend.push(record).await?;

        debug!(queue = %self.inner.name, job_id = %id, job_type, "Job enqueued");
        Ok(id)
    }

    /// Process a single job (for testing or manual control)
    ///
    /// Claims the next ready job of any registered type. Returns `false`
    /// when nothing was ready.
    pub async fn process_one(&self) -> Result<bool> {
        let job_types = self.job_types().await;
        if job_types.is_empty() {
            return Ok(false);
        }

        match self
            .inner
            .backend
            .claim(&self.inner.name, &job_types, self.inner.options.lock_duration)
            .await?
        {
            Some(record) => {
                self.inner.run_job(record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Spawn the worker pools and the stall monitor.
    ///
    /// Each registered job type gets as many workers as its concurrency.
    /// Calling this more than once has no effect.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let registrations: Vec<(String, usize)> = self
            .inner
            .handlers
            .read()
            .await
            .iter()
            .map(|(job_type, reg)| (job_type.clone(), reg.concurrency))
            .collect();

        let mut workers = self.inner.workers.lock().await;
        for (job_type, concurrency) in registrations {
            info!(queue = %self.inner.name, job_type = %job_type, concurrency, "Starting workers");
            for _ in 0..concurrency {
                let inner = self.inner.clone();
                let job_type = job_type.clone();
                workers.push(tokio::spawn(async move { inner.worker_loop(job_type).await }));
            }
        }

        let inner = self.inner.clone();
        workers.push(tokio::spawn(async move { inner.stall_monitor().await }));
    }

    /// Current status of a job; `exists: false` when unknown or evicted.
    pub async fn status(&self, job_id: &str) -> Result<JobStatus> {
        Ok(self
            .inner
            .backend
            .get(&self.inner.name, job_id)
            .await?
            .as_ref()
            .map(JobStatus::from)
            .unwrap_or_else(JobStatus::missing))
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        self.inner.backend.counts(&self.inner.name).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let m = &self.inner.metrics;
        MetricsSnapshot {
            processed: m.processed.load(Ordering::Relaxed),
            completed: m.completed.load(Ordering::Relaxed),
            failed: m.failed.load(Ordering::Relaxed),
            retried: m.retried.load(Ordering::Relaxed),
            stalled: m.stalled.load(Ordering::Relaxed),
        }
    }

    /// Lifecycle events of this queue.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Recover jobs whose worker stopped renewing its lease.
    pub async fn check_stalled(&self) -> Result<Vec<StalledJob>> {
        self.inner.check_stalled().await
    }

    /// Wait until a job is terminal (or no longer known).
    pub async fn wait_for(&self, job_id: &str, timeout: Option<Duration>) -> Result<JobStatus> {
        let wait = self.wait_terminal(job_id);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| JobError::Timeout(limit))?,
            None => wait.await,
        }
    }

    async fn wait_terminal(&self, job_id: &str) -> Result<JobStatus> {
        // Subscribe before the first read so a transition in between is not lost
        let mut events = self.subscribe();
        loop {
            let status = self.status(job_id).await?;
            if !status.exists || status.is_terminal() {
                return Ok(status);
            }

            let _ = tokio::time::timeout(WAIT_RECHECK, async {
                loop {
                    match events.recv().await {
                        Ok(event) if event.job_id() == job_id && event.is_terminal() => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(_)) => break,
                        Err(RecvError::Closed) => {
                            tokio::time::sleep(WAIT_RECHECK).await;
                            break;
                        }
                    }
                }
            })
            .await;
        }
    }

    /// Stop claiming jobs and wait up to `grace` for in-flight ones.
    ///
    /// Workers still busy after the grace period are aborted; their jobs
    /// stay `active` until stall recovery returns them to `waiting`.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.send_replace(true);

        let handles = std::mem::take(&mut *self.inner.workers.lock().await);
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        if tokio::time::timeout(grace, futures_util::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(
                queue = %self.inner.name,
                grace_secs = grace.as_secs(),
                "Workers still busy after grace period, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        // Processors may hold queue handles
        self.inner.handlers.write().await.clear();
        info!(queue = %self.inner.name, "Queue shut down");
    }
}

impl QueueInner {
    async fn worker_loop(self: Arc<Self>, job_type: String) {
        let mut shutdown = self.shutdown.subscribe();
        let job_types = vec![job_type];

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            match self
                .backend
                .claim(&self.name, &job_types, self.options.lock_duration)
                .await
            {
                Ok(Some(record)) => {
                    if let Err(e) = self.run_job(record).await {
                        error!(queue = %self.name, error = %e, "Worker error");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        res = self.backend.wait_for_job(&self.name, self.options.poll_interval) => {
                            if let Err(e) = res {
                                warn!(queue = %self.name, error = %e, "Waiting for jobs failed");
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(queue = %self.name, error = %e, "Worker error");
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        debug!(queue = %self.name, job_type = %job_types[0], "Worker stopped");
    }

    async fn stall_monitor(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.options.stalled_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_stalled().await {
                        warn!(queue = %self.name, error = %e, "Stalled job check failed");
                    }
                }
            }
        }
    }

    async fn check_stalled(&self) -> Result<Vec<StalledJob>> {
        let stalled = self
            .backend
            .recover_stalled(&self.name, self.options.max_stalled_count)
            .await?;

        for job in &stalled {
            self.metrics.stalled.fetch_add(1, Ordering::Relaxed);
            if !job.requeued {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
            }
            let _ = self.events.send(QueueEvent::Stalled {
                job_id: job.job_id.clone(),
                requeued: job.requeued,
            });
        }
        if stalled.iter().any(|job| !job.requeued) {
            self.prune().await;
        }
        Ok(stalled)
    }

    async fn run_job(&self, record: JobRecord) -> Result<()> {
        let attempt = record.attempts_made + 1;
        self.metrics.processed.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(QueueEvent::Active {
            job_id: record.id.clone(),
            job_type: record.job_type.clone(),
            attempt,
        });
        debug!(queue = %self.name, job_id = %record.id, job_type = %record.job_type, attempt, "Job active");

        let handler = self
            .handlers
            .read()
            .await
            .get(&record.job_type)
            .map(|reg| reg.handler.clone());

        let outcome = match handler {
            Some(handler) => self.execute(&record, handler).await,
            // Treated as permanent failure
            None => Err(JobError::UnknownJobType(format!(
                "No handler for job: {}",
                record.job_type
            ))),
        };

        match outcome {
            Ok(result) => {
                let stored = self
                    .backend
                    .complete(&self.name, &record.id, record.lease, result.clone())
                    .await;
                if let Err(JobError::LeaseLost(_)) = stored {
                    self.drop_stale_outcome(&record);
                    return Ok(());
                }
                stored?;
                self.metrics.completed.fetch_add(1, Ordering::Relaxed);
                let _ = self.events.send(QueueEvent::Completed {
                    job_id: record.id.clone(),
                    result,
                });
                info!(queue = %self.name, job_id = %record.id, job_type = %record.job_type, attempt, "Job completed");
            }
            Err(e) => self.record_failure(&record, e).await?,
        }

        self.prune().await;
        Ok(())
    }

    /// Run the processor under the job's timeout, renewing the lease
    /// while it runs.
    async fn execute(
        &self,
        record: &JobRecord,
        handler: Arc<dyn JobHandler>,
    ) -> Result<serde_json::Value> {
        let progress = ProgressReporter::new(self.backend.clone(), self.events.clone(), record);
        let ctx = JobContext::for_record(record, progress);

        let guarded = AssertUnwindSafe(handler.handle(ctx, record.payload.clone()))
            .catch_unwind()
            .map(|res| res.unwrap_or_else(|_| Err(JobError::worker("processor panicked"))));
        let limit = record.options.timeout();
        let run = async move {
            match limit {
                Some(limit) => tokio::time::timeout(limit, guarded)
                    .await
                    .unwrap_or(Err(JobError::Timeout(limit))),
                None => guarded.await,
            }
        };
        tokio::pin!(run);

        let renew_every = (self.options.lock_duration / 2).max(Duration::from_millis(10));
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);

        loop {
            tokio::select! {
                res = &mut run => return res,
                _ = heartbeat.tick() => {
                    if let Err(e) = self
                        .backend
                        .extend_lock(&self.name, &record.id, record.lease, self.options.lock_duration)
                        .await
                    {
                        warn!(queue = %self.name, job_id = %record.id, error = %e, "Lease renewal failed");
                    }
                }
            }
        }
    }

    async fn record_failure(&self, record: &JobRecord, err: JobError) -> Result<()> {
        let attempts_made = record.attempts_made + 1;
        let reason = err.to_string();
        let will_retry = err.is_retryable() && attempts_made < record.options.max_attempts;

        let retry_at = if will_retry {
            let delay = record.options.backoff.delay_for(attempts_made);
            let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
            Some(Utc::now() + delay)
        } else {
            None
        };

        let stored = self
            .backend
            .fail(&self.name, &record.id, record.lease, &reason, retry_at)
            .await;
        if let Err(JobError::LeaseLost(_)) = stored {
            self.drop_stale_outcome(record);
            return Ok(());
        }
        stored?;

        if will_retry {
            self.metrics.retried.fetch_add(1, Ordering::Relaxed);
            warn!(
                queue = %self.name,
                job_id = %record.id,
                job_type = %record.job_type,
                attempts_made,
                max_attempts = record.options.max_attempts,
                error = %reason,
                "Job attempt failed, retrying"
            );
        } else {
            self.metrics.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                queue = %self.name,
                job_id = %record.id,
                job_type = %record.job_type,
                attempts_made,
                error = %reason,
                "Job failed"
            );
        }

        let _ = self.events.send(QueueEvent::Failed {
            job_id: record.id.clone(),
            reason,
            attempts_made,
            will_retry,
        });
        Ok(())
    }

    /// The job was re-delivered while this attempt ran; its new holder
    /// owns the outcome.
    fn drop_stale_outcome(&self, record: &JobRecord) {
        warn!(
            queue = %self.name,
            job_id = %record.id,
            job_type = %record.job_type,
            lease = record.lease,
            "Lease lost, dropping attempt outcome"
        );
    }

    async fn prune(&self) {
        if let Err(e) = self
            .backend
            .prune(
                &self.name,
                self.options.remove_on_complete,
                self.options.remove_on_fail,
            )
            .await
        {
            warn!(queue = %self.name, error = %e, "Retention pruning failed");
        }
    }
}
