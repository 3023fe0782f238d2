//! Per-queue execution policy and per-job overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest retry delay ever scheduled (24 hours).
pub const MAX_BACKOFF_MS: u64 = 86_400_000;

/// Delay policy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },
    /// `delay_ms * 2^(attempts_made - 1)`, capped at `max_delay_ms`.
    Exponential { delay_ms: u64, max_delay_ms: u64 },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential {
            delay_ms: base.as_millis() as u64,
            max_delay_ms: MAX_BACKOFF_MS,
        }
    }

    /// Cap the exponential growth.
    pub fn capped_at(self, cap: Duration) -> Self {
        match self {
            Backoff::Exponential { delay_ms, .. } => Backoff::Exponential {
                delay_ms,
                max_delay_ms: cap.as_millis() as u64,
            },
            fixed => fixed,
        }
    }

    /// Delay to wait before the next attempt, given how many attempts have
    /// already failed (starting at 1).
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential {
                delay_ms,
                max_delay_ms,
            } => {
                let exponent = attempts_made.saturating_sub(1);
                let factor = 2u64.saturating_pow(exponent);
                Duration::from_millis(delay_ms.saturating_mul(factor).min(max_delay_ms))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::exponential(Duration::from_secs(1))
    }
}

/// Effective options stored with every job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Hard limit on a single attempt.
    pub timeout_ms: Option<u64>,
    /// Lower runs first.
    pub priority: i32,
}

impl JobOptions {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::default(),
            timeout_ms: None,
            priority: 0,
        }
    }
}

/// Options for enqueueing a job
///
/// Unset fields fall back to the queue's defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub max_attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub timeout: Option<Duration>,
    pub priority: Option<i32>,
    pub delay: Option<Duration>,
    pub job_id: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn delay(mut self, duration: Duration) -> Self {
        self.delay = Some(duration);
        self
    }

    /// Use a caller-chosen id instead of a generated one.
    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// Merge onto queue defaults.
    pub fn resolve(&self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            backoff: self.backoff.unwrap_or(defaults.backoff),
            timeout_ms: self
                .timeout
                .map(|t| t.as_millis() as u64)
                .or(defaults.timeout_ms),
            priority: self.priority.unwrap_or(defaults.priority),
        }
    }
}

/// Execution policy of one named queue.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub default_job_options: JobOptions,
    /// Completed jobs kept for status queries; older ones are evicted.
    pub remove_on_complete: usize,
    /// Failed jobs kept for status queries.
    pub remove_on_fail: usize,
    /// Visibility window of an active job; renewed by heartbeats.
    pub lock_duration: Duration,
    /// How often to look for stalled jobs.
    pub stalled_interval: Duration,
    /// Re-deliveries allowed before a stalled job is failed.
    pub max_stalled_count: u32,
    /// Idle wait between claim attempts when the queue is empty.
    pub poll_interval: Duration,
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(mut self, n: u32) -> Self {
        self.default_job_options.max_attempts = n.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.default_job_options.backoff = backoff;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.default_job_options.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn retention(mut self, completed: usize, failed: usize) -> Self {
        self.remove_on_complete = completed;
        self.remove_on_fail = failed;
        self
    }

    pub fn lock_duration(mut self, lock: Duration) -> Self {
        self.lock_duration = lock;
        self
    }

    pub fn stalled_interval(mut self, interval: Duration) -> Self {
        self.stalled_interval = interval;
        self
    }

    pub fn max_stalled_count(mut self, n: u32) -> Self {
        self.max_stalled_count = n;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            default_job_options: JobOptions::default(),
            remove_on_complete: 100,
            remove_on_fail: 500,
            lock_duration: Duration::from_secs(30),
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 1,
            poll_interval: Duration::from_millis(100),
        }
    }
}
