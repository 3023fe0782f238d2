use super::{JobBackend, QueueCounts, StalledJob, STALLED_LIMIT_REASON};
use crate::error::{JobError, Result};
use crate::job::{JobRecord, JobState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// In-memory job backend (not persistent, for testing/dev)
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    queues: Arc<Mutex<HashMap<String, QueueStore>>>,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct QueueStore {
    jobs: HashMap<String, Entry>,
    next_seq: u64,
}

#[derive(Debug)]
struct Entry {
    record: JobRecord,
    seq: u64,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, QueueStore>>> {
        self.queues
            .lock()
            .map_err(|_| JobError::BackendError("Lock poisoned".to_string()))
    }

    /// Run `f` on a job still held under `lease`.
    fn with_lease<T>(
        &self,
        queue: &str,
        job_id: &str,
        lease: u64,
        f: impl FnOnce(&mut JobRecord) -> T,
    ) -> Result<T> {
        let mut queues = self.lock()?;
        let entry = queues
            .get_mut(queue)
            .and_then(|store| store.jobs.get_mut(job_id))
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        let job = &mut entry.record;
        if job.state != JobState::Active || job.lease != lease {
            return Err(JobError::LeaseLost(job_id.to_string()));
        }
        Ok(f(job))
    }

    /// Total jobs held for a queue, terminal ones included.
    pub fn len(&self, queue: &str) -> usize {
        self.lock()
            .map(|q| q.get(queue).map_or(0, |s| s.jobs.len()))
            .unwrap_or(0)
    }
}

fn lease(lock: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(lock).unwrap_or_else(|_| chrono::Duration::seconds(30))
}

#[async_trait]
impl JobBackend for InMemoryBackend {
    async fn push(&self, job: JobRecord) -> Result<()> {
        {
            let mut queues = self.lock()?;
            let store = queues.entry(job.queue.clone()).or_default();
            if !store.jobs.contains_key(&job.id) {
                let seq = store.next_seq;
                store.next_seq += 1;
                store.jobs.insert(job.id.clone(), Entry { record: job, seq });
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn claim(
        &self,
        queue: &str,
        job_types: &[String],
        lock: Duration,
    ) -> Result<Option<JobRecord>> {
        let mut queues = self.lock()?;
        let Some(store) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let now = Utc::now();
        let next = store
            .jobs
            .values_mut()
            .filter(|e| e.record.is_ready(now))
            .filter(|e| job_types.is_empty() || job_types.contains(&e.record.job_type))
            .min_by_key(|e| (e.record.options.priority, e.seq));

        Ok(next.map(|entry| {
            entry.record.state = JobState::Active;
            entry.record.lease += 1;
            entry.record.locked_until = Some(lease(lock));
            entry.record.run_at = None;
            entry.record.clone()
        }))
    }

    async fn extend_lock(&self, queue: &str, job_id: &str, token: u64, lock: Duration) -> Result<()> {
        self.with_lease(queue, job_id, token, |job| {
            job.locked_until = Some(lease(lock));
        })
    }

    async fn update_progress(&self, queue: &str, job_id: &str, lease: u64, progress: u8) -> Result<()> {
        self.with_lease(queue, job_id, lease, |job| {
            job.progress = job.progress.max(progress.min(100));
        })
    }

    async fn complete(
        &self,
        queue: &str,
        job_id: &str,
        lease: u64,
        result: serde_json::Value,
    ) -> Result<()> {
        self.with_lease(queue, job_id, lease, |job| {
            job.state = JobState::Completed;
            job.progress = 100;
            job.result = Some(result);
            job.locked_until = None;
            job.finished_at = Some(Utc::now());
        })
    }

    async fn fail(
        &self,
        queue: &str,
        job_id: &str,
        lease: u64,
        reason: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let requeued = self.with_lease(queue, job_id, lease, |job| {
            job.attempts_made += 1;
            job.failure_reason = Some(reason.to_string());
            job.locked_until = None;
            match retry_at {
                Some(at) => {
                    job.state = JobState::Waiting;
                    job.progress = 0;
                    job.run_at = Some(at);
                    true
                }
                None => {
                    job.state = JobState::Failed;
                    job.finished_at = Some(Utc::now());
                    false
                }
            }
        })?;

        if requeued {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn get(&self, queue: &str, job_id: &str) -> Result<Option<JobRecord>> {
        let queues = self.lock()?;
        Ok(queues
            .get(queue)
            .and_then(|store| store.jobs.get(job_id))
            .map(|entry| entry.record.clone()))
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let queues = self.lock()?;
        let mut counts = QueueCounts::default();
        let now = Utc::now();

        if let Some(store) = queues.get(queue) {
            for entry in store.jobs.values() {
                let job = &entry.record;
                match job.state {
                    JobState::Waiting if job.is_delayed(now) => counts.delayed += 1,
                    JobState::Waiting => counts.waiting += 1,
                    JobState::Active => counts.active += 1,
                    JobState::Completed => counts.completed += 1,
                    JobState::Failed => counts.failed += 1,
                }
            }
        }
        Ok(counts)
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
    ) -> Result<Vec<StalledJob>> {
        let mut recovered = Vec::new();
        {
            let mut queues = self.lock()?;
            let Some(store) = queues.get_mut(queue) else {
                return Ok(recovered);
            };

            let now = Utc::now();
            for entry in store.jobs.values_mut() {
                let job = &mut entry.record;
                if !job.is_stalled(now) {
                    continue;
                }

                job.stalled_count += 1;
                job.locked_until = None;
                let requeued = job.stalled_count <= max_stalled_count;
                if requeued {
                    job.state = JobState::Waiting;
                    job.progress = 0;
                } else {
                    job.state = JobState::Failed;
                    job.failure_reason = Some(STALLED_LIMIT_REASON.to_string());
                    job.finished_at = Some(now);
                }
                recovered.push(StalledJob {
                    job_id: job.id.clone(),
                    requeued,
                });
            }
        }

        if recovered.iter().any(|s| s.requeued) {
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    async fn prune(&self, queue: &str, keep_completed: usize, keep_failed: usize) -> Result<u64> {
        let mut queues = self.lock()?;
        let Some(store) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let mut evict = Vec::new();
        for (state, keep) in [
            (JobState::Completed, keep_completed),
            (JobState::Failed, keep_failed),
        ] {
            let mut finished: Vec<(&String, Option<DateTime<Utc>>, u64)> = store
                .jobs
                .iter()
                .filter(|(_, e)| e.record.state == state)
                .map(|(id, e)| (id, e.record.finished_at, e.seq))
                .collect();
            if finished.len() <= keep {
                continue;
            }
            // newest first
            finished.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));
            evict.extend(finished.into_iter().skip(keep).map(|(id, _, _)| id.clone()));
        }

        for id in &evict {
            store.jobs.remove(id);
        }
        Ok(evict.len() as u64)
    }

    async fn wait_for_job(&self, _queue: &str, timeout: Duration) -> Result<()> {
        // Timing out just means the caller polls again
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        Ok(())
    }
}
