//! The media queues and everything they run.
//!
//! One [`AppContext`] is built at startup and shared by the HTTP layer and
//! the workers.

use crate::processors::{BackupJob, BatchUploadJob, MigrateJob, RestoreJob, Services, UploadJob};
use mediaflow_jobs::{
    Backoff, JobError, QueueEvent, QueueManager, QueueOptions, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const IMAGE_QUEUE: &str = "image-processing";
pub const BACKUP_QUEUE: &str = "database-backup";
pub const MIGRATION_QUEUE: &str = "storage-migration";

pub const UPLOAD_CONCURRENCY: usize = 5;
pub const BATCH_UPLOAD_CONCURRENCY: usize = 1;

/// Execution policy of each media queue.
#[derive(Debug, Clone)]
pub struct QueuePlan {
    pub image: QueueOptions,
    pub backup: QueueOptions,
    pub migration: QueueOptions,
}

impl Default for QueuePlan {
    fn default() -> Self {
        Self {
            image: QueueOptions::new()
                .attempts(3)
                .backoff(Backoff::exponential(Duration::from_secs(2))),
            backup: QueueOptions::new()
                .attempts(2)
                .timeout(Duration::from_secs(10 * 60)),
            // Partial migrations already changed durable state
            migration: QueueOptions::new()
                .attempts(1)
                .timeout(Duration::from_secs(30 * 60)),
        }
    }
}

pub struct AppContext {
    manager: Arc<QueueManager>,
    services: Services,
    plan: QueuePlan,
    initialized: OnceCell<()>,
    observers: Mutex<Vec<JoinHandle<()>>>,
}

impl AppContext {
    pub fn new(manager: Arc<QueueManager>, services: Services) -> Self {
        Self::with_plan(manager, services, QueuePlan::default())
    }

    pub fn with_plan(manager: Arc<QueueManager>, services: Services, plan: QueuePlan) -> Self {
        Self {
            manager,
            services,
            plan,
            initialized: OnceCell::new(),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Create the queues, register processors, attach observers and start
    /// the workers. Later calls return immediately.
    ///
    /// Fails when the broker cannot be reached.
    pub async fn initialize(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                self.manager.ping().await.map_err(|e| {
                    error!(error = %e, "Job broker unreachable");
                    e
                })?;

                let images = self.manager.add_queue(IMAGE_QUEUE, self.plan.image.clone()).await;
                self.manager.add_queue(BACKUP_QUEUE, self.plan.backup.clone()).await;
                self.manager
                    .add_queue(MIGRATION_QUEUE, self.plan.migration.clone())
                    .await;

                let services = self.services.clone();
                self.manager
                    .register(IMAGE_QUEUE, UploadJob::new(services.clone()), UPLOAD_CONCURRENCY)
                    .await?;
                self.manager
                    .register(IMAGE_QUEUE, BatchUploadJob::new(images), BATCH_UPLOAD_CONCURRENCY)
                    .await?;
                self.manager
                    .register(BACKUP_QUEUE, BackupJob::new(services.clone()), 1)
                    .await?;
                self.manager
                    .register(BACKUP_QUEUE, RestoreJob::new(services.clone()), 1)
                    .await?;
                self.manager
                    .register(MIGRATION_QUEUE, MigrateJob::new(services), 1)
                    .await?;

                self.attach_observers().await?;
                self.manager.start().await;
                info!(
                    queues = ?self.manager.queue_names().await,
                    "Queues initialized"
                );
                Ok::<(), JobError>(())
            })
            .await?;
        Ok(())
    }

    async fn attach_observers(&self) -> Result<()> {
        let mut observers = self.observers.lock().await;
        for name in self.manager.queue_names().await {
            let events = self.manager.subscribe(&name).await?;
            observers.push(tokio::spawn(observe(name, events)));
        }
        Ok(())
    }

    /// Drain the queues, then release the database.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        let result = self.manager.shutdown(grace).await;
        for observer in self.observers.lock().await.drain(..) {
            observer.abort();
        }
        self.services.db.close().await;
        result
    }
}

async fn observe(queue: String, mut events: tokio::sync::broadcast::Receiver<QueueEvent>) {
    loop {
        match events.recv().await {
            Ok(QueueEvent::Active {
                job_id,
                job_type,
                attempt,
            }) => debug!(queue = %queue, job_id = %job_id, job_type = %job_type, attempt, "Job active"),
            Ok(QueueEvent::Progress { job_id, progress }) => {
                debug!(queue = %queue, job_id = %job_id, progress, "Job progress")
            }
            Ok(QueueEvent::Completed { job_id, .. }) => {
                info!(queue = %queue, job_id = %job_id, "Job completed")
            }
            Ok(QueueEvent::Failed {
                job_id,
                reason,
                attempts_made,
                will_retry,
            }) => warn!(
                queue = %queue,
                job_id = %job_id,
                attempts_made,
                will_retry,
                reason = %reason,
                "Job failed"
            ),
            Ok(QueueEvent::Stalled { job_id, requeued }) => {
                warn!(queue = %queue, job_id = %job_id, requeued, "Job stalled")
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(queue = %queue, skipped, "Event observer lagged")
            }
            Err(RecvError::Closed) => break,
        }
    }
}
