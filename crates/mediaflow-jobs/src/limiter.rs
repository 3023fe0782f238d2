//! Caps the number of in-flight futures inside a single job.
//!
//! This is independent of a queue's worker concurrency: a batch job running
//! on one worker slot fans its sub-items out through a limiter. The limiter
//! never cancels anything; a failing task simply settles and frees its slot.

use futures_util::stream::{self, StreamExt};
use std::future::Future;

/// Bounded concurrency governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyLimiter {
    limit: usize,
}

impl ConcurrencyLimiter {
    /// A limit of zero is treated as one.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Drive every task to completion with at most `limit` running at once.
    ///
    /// A new task starts as soon as a running one settles. Outputs are
    /// returned in the order the tasks were given, whatever order they
    /// settled in.
    pub async fn run<I, Fut>(&self, tasks: I) -> Vec<Fut::Output>
    where
        I: IntoIterator<Item = Fut>,
        Fut: Future,
    {
        let mut settled: Vec<(usize, Fut::Output)> = stream::iter(tasks.into_iter().enumerate())
            .map(|(index, task)| async move { (index, task.await) })
            .buffer_unordered(self.limit)
            .collect()
            .await;

        settled.sort_by_key(|(index, _)| *index);
        settled.into_iter().map(|(_, output)| output).collect()
    }

    /// Apply `f` to every item under the limit.
    pub async fn map<T, F, Fut>(&self, items: Vec<T>, mut f: F) -> Vec<Fut::Output>
    where
        F: FnMut(usize, T) -> Fut,
        Fut: Future,
    {
        let tasks: Vec<Fut> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| f(index, item))
            .collect();
        self.run(tasks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        started: AtomicUsize,
    }

    impl Gauge {
        async fn track<T>(&self, delay_ms: u64, out: T) -> T {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    #[tokio::test]
    async fn never_exceeds_the_limit() {
        let gauge = Arc::new(Gauge::default());
        let limiter = ConcurrencyLimiter::new(3);

        let out = limiter
            .map((0..12u64).collect::<Vec<_>>(), |i, n| {
                let gauge = gauge.clone();
                async move { gauge.track(5 + (n % 4) * 3, i).await }
            })
            .await;

        assert_eq!(out, (0..12usize).collect::<Vec<_>>());
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_rest() {
        let gauge = Arc::new(Gauge::default());
        let limiter = ConcurrencyLimiter::new(2);

        let out: Vec<Result<usize, String>> = limiter
            .map(vec![(); 6], |i, _| {
                let gauge = gauge.clone();
                async move {
                    gauge
                        .track(2, if i == 1 { Err(format!("item {i} failed")) } else { Ok(i) })
                        .await
                }
            })
            .await;

        assert_eq!(gauge.started.load(Ordering::SeqCst), 6);
        assert_eq!(out.iter().filter(|r| r.is_err()).count(), 1);
        assert_eq!(out[1], Err("item 1 failed".to_string()));
    }

    #[tokio::test]
    async fn empty_input_settles_immediately() {
        let limiter = ConcurrencyLimiter::new(5);
        let out: Vec<()> = limiter.run(Vec::<std::future::Ready<()>>::new()).await;
        assert!(out.is_empty());
    }

    #[test]
    fn zero_limit_still_makes_progress() {
        assert_eq!(ConcurrencyLimiter::new(0).limit(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(30))]

        #[test]
        fn prop_peak_never_exceeds_limit(limit in 1usize..6, delays in prop::collection::vec(0u64..4, 0..20)) {
            tokio::runtime::Runtime::new().unwrap().block_on(async {
                let gauge = Arc::new(Gauge::default());
                let total = delays.len();
                let out = ConcurrencyLimiter::new(limit)
                    .map(delays, |i, d| {
                        let gauge = gauge.clone();
                        async move { gauge.track(d, i).await }
                    })
                    .await;

                prop_assert_eq!(out.len(), total);
                prop_assert!(gauge.peak.load(Ordering::SeqCst) <= limit);
                prop_assert_eq!(gauge.current.load(Ordering::SeqCst), 0);
                Ok(())
            })?;
        }
    }
}
