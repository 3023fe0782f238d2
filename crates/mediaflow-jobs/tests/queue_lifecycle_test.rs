use async_trait::async_trait;
use mediaflow_jobs::{
    Backoff, EnqueueOptions, InMemoryBackend, Job, JobBackend, JobContext, JobError, JobQueue,
    JobState, QueueEvent, QueueManager, QueueOptions, Result, STALLED_LIMIT_REASON,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ThumbnailData {
    name: String,
}

#[derive(Clone, Default)]
struct ThumbnailJob {
    processed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Job for ThumbnailJob {
    const NAME: &'static str = "thumbnail";
    type Data = ThumbnailData;
    type Output = String;

    async fn execute(&self, _ctx: JobContext, data: Self::Data) -> Result<String> {
        self.processed.lock().unwrap().push(data.name.clone());
        Ok(format!("thumb-{}", data.name))
    }
}

#[derive(Clone, Default)]
struct BrokenJob {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Job for BrokenJob {
    const NAME: &'static str = "broken";
    type Data = serde_json::Value;
    type Output = ();

    async fn execute(&self, ctx: JobContext, _data: Self::Data) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(JobError::worker(format!("storage unreachable on attempt {}", ctx.attempt)))
    }
}

struct SlowJob {
    millis: u64,
}

#[async_trait]
impl Job for SlowJob {
    const NAME: &'static str = "slow";
    type Data = serde_json::Value;
    type Output = &'static str;

    async fn execute(&self, ctx: JobContext, _data: Self::Data) -> Result<&'static str> {
        for step in [10u8, 40, 30, 70] {
            ctx.report_progress(step).await?;
        }
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok("done")
    }
}

/// First delivery hangs its worker thread; later ones finish normally.
#[derive(Clone, Default)]
struct HangingJob {
    runs: Arc<AtomicU32>,
}

#[async_trait]
impl Job for HangingJob {
    const NAME: &'static str = "hanging";
    type Data = serde_json::Value;
    type Output = u32;

    async fn execute(&self, _ctx: JobContext, _data: Self::Data) -> Result<u32> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if run == 1 {
            // No await points, so the lease is never renewed
            tokio::task::block_in_place(|| std::thread::sleep(Duration::from_millis(400)));
        } else {
            tokio::time::sleep(Duration::from_millis(1500)).await;
        }
        Ok(run)
    }
}

fn fast_options() -> QueueOptions {
    QueueOptions::new()
        .backoff(Backoff::fixed(Duration::ZERO))
        .poll_interval(Duration::from_millis(10))
}

fn drain(rx: &mut broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn enqueued_job_is_processed_once() {
    let queue = JobQueue::new(InMemoryBackend::new());
    let job = ThumbnailJob::default();
    queue.register_job(job.clone()).await;

    let job_id = queue
        .enqueue::<ThumbnailJob>(ThumbnailData {
            name: "cat.png".into(),
        })
        .await
        .expect("Enqueue failed");

    assert!(queue.process_one().await.unwrap());
    assert!(!queue.process_one().await.unwrap());

    assert_eq!(*job.processed.lock().unwrap(), vec!["cat.png".to_string()]);
    let status = queue.status(&job_id).await.unwrap();
    assert_eq!(status.state, Some(JobState::Completed));
    assert_eq!(status.result, Some(json!("thumb-cat.png")));
}

#[tokio::test]
async fn always_failing_job_uses_its_whole_attempt_budget() {
    let queue = JobQueue::named("media", Arc::new(InMemoryBackend::new()), fast_options());
    let job = BrokenJob::default();
    queue.register_job(job.clone()).await;
    let mut events = queue.subscribe();

    let job_id = queue
        .enqueue_opts::<BrokenJob>(json!({}), EnqueueOptions::new().max_attempts(3))
        .await
        .unwrap();

    queue.start().await;
    let status = queue
        .wait_for(&job_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    queue.shutdown(Duration::from_secs(1)).await;

    assert_eq!(status.state, Some(JobState::Failed));
    assert_eq!(status.attempts_made, 3);
    assert_eq!(
        status.failure_reason.as_deref(),
        Some("Worker error: storage unreachable on attempt 3")
    );
    assert_eq!(job.calls.load(Ordering::SeqCst), 3);

    let events = drain(&mut events);
    let active = events
        .iter()
        .filter(|e| matches!(e, QueueEvent::Active { .. }))
        .count();
    let retries: Vec<bool> = events
        .iter()
        .filter_map(|e| match e {
            QueueEvent::Failed { will_retry, .. } => Some(*will_retry),
            _ => None,
        })
        .collect();
    assert_eq!(active, 3);
    assert_eq!(retries, vec![true, true, false]);

    let metrics = queue.metrics();
    assert_eq!(metrics.processed, 3);
    assert_eq!(metrics.retried, 2);
    assert_eq!(metrics.failed, 1);
}

#[tokio::test]
async fn every_submission_reaches_a_terminal_state() {
    let manager = QueueManager::in_memory();
    manager.add_queue("media", fast_options()).await;
    manager
        .register("media", ThumbnailJob::default(), 3)
        .await
        .unwrap();
    manager
        .register("media", BrokenJob::default(), 1)
        .await
        .unwrap();
    manager.start().await;

    let mut ids = Vec::new();
    for i in 0..20 {
        let job_type = if i % 5 == 0 { "broken" } else { "thumbnail" };
        let sub = manager
            .submit(
                "media",
                job_type,
                json!({"name": format!("{i}.png")}),
                EnqueueOptions::new().max_attempts(2),
            )
            .await
            .unwrap();
        ids.push((job_type, sub.job_id));
    }

    let queue = manager.queue("media").await.unwrap();
    for (job_type, id) in &ids {
        let status = queue
            .wait_for(id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let expected = if *job_type == "broken" {
            JobState::Failed
        } else {
            JobState::Completed
        };
        assert_eq!(status.state, Some(expected));

        // terminal reads never change
        assert_eq!(manager.status("media", id).await.unwrap(), status);
    }

    let stats = manager.stats("media").await.unwrap();
    assert_eq!(stats.counts.completed, 16);
    assert_eq!(stats.counts.failed, 4);
    manager.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn progress_events_never_go_backwards() {
    let queue = JobQueue::named("media", Arc::new(InMemoryBackend::new()), fast_options());
    queue.register_job(SlowJob { millis: 1 }).await;
    let mut events = queue.subscribe();

    let id = queue
        .enqueue::<SlowJob>(json!(null))
        .await
        .unwrap();
    assert!(queue.process_one().await.unwrap());

    let progress: Vec<u8> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            QueueEvent::Progress { progress, .. } => Some(progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![10, 40, 70]);
    assert_eq!(queue.status(&id).await.unwrap().progress, 100);
}

#[tokio::test]
async fn timed_out_attempt_counts_as_failure() {
    let queue = JobQueue::named("media", Arc::new(InMemoryBackend::new()), fast_options());
    queue.register_job(SlowJob { millis: 10_000 }).await;

    let opts = EnqueueOptions::new()
        .timeout(Duration::from_millis(50))
        .max_attempts(1);
    let id = queue.enqueue_opts::<SlowJob>(json!(null), opts).await.unwrap();
    assert!(queue.process_one().await.unwrap());

    let status = queue.status(&id).await.unwrap();
    assert_eq!(status.state, Some(JobState::Failed));
    assert_eq!(status.attempts_made, 1);
    assert!(status
        .failure_reason
        .unwrap()
        .starts_with("Job timed out"));
}

#[tokio::test]
async fn lower_priority_value_runs_first() {
    let queue = JobQueue::new(InMemoryBackend::new());
    let job = ThumbnailJob::default();
    queue.register_job(job.clone()).await;

    for (name, priority) in [("late", 10), ("early", 1), ("middle", 5)] {
        queue
            .enqueue_opts::<ThumbnailJob>(
                ThumbnailData { name: name.into() },
                EnqueueOptions::new().priority(priority),
            )
            .await
            .unwrap();
    }
    while queue.process_one().await.unwrap() {}

    assert_eq!(
        *job.processed.lock().unwrap(),
        vec!["early".to_string(), "middle".to_string(), "late".to_string()]
    );
}

#[tokio::test]
async fn custom_ids_deduplicate_submissions() {
    let queue = JobQueue::new(InMemoryBackend::new());
    let job = ThumbnailJob::default();
    queue.register_job(job.clone()).await;

    for _ in 0..3 {
        let id = queue
            .enqueue_opts::<ThumbnailJob>(
                ThumbnailData { name: "once".into() },
                EnqueueOptions::new().job_id("nightly"),
            )
            .await
            .unwrap();
        assert_eq!(id, "nightly");
    }
    while queue.process_one().await.unwrap() {}

    assert_eq!(job.processed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn crashed_worker_job_is_requeued_then_failed() {
    let backend = Arc::new(InMemoryBackend::new());
    let options = fast_options().max_stalled_count(1);
    let queue = JobQueue::named("media", backend.clone(), options);
    queue.register_job(ThumbnailJob::default()).await;
    let mut events = queue.subscribe();

    let id = queue
        .enqueue::<ThumbnailJob>(ThumbnailData { name: "x".into() })
        .await
        .unwrap();

    // A worker claims the job and dies without renewing its lease
    let types = vec!["thumbnail".to_string()];
    let claimed = backend
        .claim("media", &types, Duration::from_millis(5))
        .await
        .unwrap();
    assert!(claimed.is_some());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stalled = queue.check_stalled().await.unwrap();
    assert_eq!(stalled.len(), 1);
    assert!(stalled[0].requeued);
    let status = queue.status(&id).await.unwrap();
    assert_eq!(status.state, Some(JobState::Waiting));
    assert_eq!(status.attempts_made, 0);

    // Second crash exceeds the stall budget
    backend
        .claim("media", &types, Duration::from_millis(5))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stalled = queue.check_stalled().await.unwrap();
    assert!(!stalled[0].requeued);

    let status = queue.status(&id).await.unwrap();
    assert_eq!(status.state, Some(JobState::Failed));
    assert_eq!(status.failure_reason.as_deref(), Some(STALLED_LIMIT_REASON));

    let kinds: Vec<bool> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            QueueEvent::Stalled { requeued, .. } => Some(requeued),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec![true, false]);
}

#[tokio::test]
async fn heartbeat_keeps_long_jobs_from_stalling() {
    let backend = Arc::new(InMemoryBackend::new());
    let options = fast_options().lock_duration(Duration::from_millis(40));
    let queue = JobQueue::named("media", backend, options);
    queue.register_job(SlowJob { millis: 200 }).await;

    let id = queue.enqueue::<SlowJob>(json!(null)).await.unwrap();
    let worker = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.process_one().await })
    };

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(queue.check_stalled().await.unwrap().is_empty());
    }

    assert!(worker.await.unwrap().unwrap());
    assert_eq!(queue.status(&id).await.unwrap().state, Some(JobState::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redelivered_job_keeps_the_outcome_of_its_current_holder() {
    let options = fast_options()
        .lock_duration(Duration::from_millis(60))
        .stalled_interval(Duration::from_millis(20));
    let queue = JobQueue::named("media", Arc::new(InMemoryBackend::new()), options);
    let job = HangingJob::default();
    queue.register_job_with_concurrency(job.clone(), 2).await;
    queue.start().await;

    let id = queue.enqueue::<HangingJob>(json!(null)).await.unwrap();

    // First holder has finished by now, second delivery is still running
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    let status = queue.status(&id).await.unwrap();
    assert_eq!(status.state, Some(JobState::Active));
    assert_eq!(status.result, None);

    let status = queue
        .wait_for(&id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(status.state, Some(JobState::Completed));
    assert_eq!(status.result, Some(json!(2)));
    assert_eq!(job.runs.load(Ordering::SeqCst), 2);

    queue.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_jobs() {
    let queue = JobQueue::named("media", Arc::new(InMemoryBackend::new()), fast_options());
    queue.register_job(SlowJob { millis: 100 }).await;
    let mut events = queue.subscribe();

    let id = queue.enqueue::<SlowJob>(json!(null)).await.unwrap();
    queue.start().await;

    // wait until a worker holds the job
    loop {
        if let Ok(QueueEvent::Active { .. }) = events.recv().await {
            break;
        }
    }
    queue.shutdown(Duration::from_secs(2)).await;

    assert_eq!(queue.status(&id).await.unwrap().state, Some(JobState::Completed));
}

#[tokio::test]
async fn shutdown_grace_period_is_bounded() {
    let queue = JobQueue::named("media", Arc::new(InMemoryBackend::new()), fast_options());
    queue.register_job(SlowJob { millis: 60_000 }).await;
    let mut events = queue.subscribe();

    let id = queue.enqueue::<SlowJob>(json!(null)).await.unwrap();
    queue.start().await;
    loop {
        if let Ok(QueueEvent::Active { .. }) = events.recv().await {
            break;
        }
    }

    let started = std::time::Instant::now();
    queue.shutdown(Duration::from_millis(100)).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    // left for stall recovery
    assert_eq!(queue.status(&id).await.unwrap().state, Some(JobState::Active));
}

#[tokio::test]
async fn retention_evicts_oldest_terminal_jobs() {
    let options = QueueOptions::new().retention(2, 2);
    let queue = JobQueue::named("media", Arc::new(InMemoryBackend::new()), options);
    queue.register_job(ThumbnailJob::default()).await;

    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(
            queue
                .enqueue::<ThumbnailJob>(ThumbnailData {
                    name: i.to_string(),
                })
                .await
                .unwrap(),
        );
        assert!(queue.process_one().await.unwrap());
    }

    assert!(!queue.status(&ids[0]).await.unwrap().exists);
    assert!(!queue.status(&ids[1]).await.unwrap().exists);
    assert!(queue.status(&ids[3]).await.unwrap().exists);
    assert_eq!(queue.counts().await.unwrap().completed, 2);
}

#[tokio::test]
async fn wait_for_times_out_on_unclaimed_job() {
    let queue = JobQueue::new(InMemoryBackend::new());
    queue.register_job(ThumbnailJob::default()).await;
    let id = queue
        .enqueue::<ThumbnailJob>(ThumbnailData { name: "x".into() })
        .await
        .unwrap();

    let err = queue
        .wait_for(&id, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Timeout(_)));
}
