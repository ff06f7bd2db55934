//! Cumulative execution-time accounting shared by all scripts of one request

use crate::BudgetExceeded;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

const NANOS_PER_MILLI: u64 = 1_000_000;

/// Point-in-time view of a tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub limit_ms: u64,
    pub elapsed_ms: u64,
}

impl BudgetSnapshot {
    /// Milliseconds left before `check_limit()` starts failing
    pub fn remaining_ms(&self) -> u64 {
        self.limit_ms.saturating_sub(self.elapsed_ms)
    }

    pub fn is_exhausted(&self) -> bool {
        self.elapsed_ms >= self.limit_ms
    }
}

/// Accumulates wall-clock time spent in tracked operations against a fixed ceiling
///
/// The elapsed counter only ever grows. It is kept in nanoseconds so runs
/// shorter than a millisecond still add up; the millisecond views truncate
/// the running total, never the individual runs. Accumulation is atomic so the
/// tracker can be shared behind an `Arc` by overlapping invocations of one request.
#[derive(Debug)]
pub struct ExecutionTimeTracker {
    limit_ms: u64,
    elapsed_ns: AtomicU64,
}

impl ExecutionTimeTracker {
    /// Create a tracker with nothing spent yet
    pub fn with_limit(limit_ms: NonZeroU64) -> Self {
        Self {
            limit_ms: limit_ms.get(),
            elapsed_ns: AtomicU64::new(0),
        }
    }

    pub fn limit_ms(&self) -> u64 {
        self.limit_ms
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ns() / NANOS_PER_MILLI
    }

    /// Exact time charged so far
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns())
    }

    fn elapsed_ns(&self) -> u64 {
        self.elapsed_ns.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            limit_ms: self.limit_ms,
            elapsed_ms: self.elapsed_ms(),
        }
    }

    /// Fail if the budget is already spent
    pub fn check_limit(&self) -> Result<(), BudgetExceeded> {
        let elapsed_ns = self.elapsed_ns();
        if elapsed_ns >= self.limit_ms.saturating_mul(NANOS_PER_MILLI) {
            return Err(BudgetExceeded {
                limit_ms: self.limit_ms,
                elapsed_ms: elapsed_ns / NANOS_PER_MILLI,
            });
        }
        Ok(())
    }

    /// Run `fut` to completion and charge its wall-clock duration
    ///
    /// The output is returned untouched, errors included. Time is charged even
    /// if the future is dropped before completing.
    pub async fn track<F: Future>(&self, fut: F) -> F::Output {
        let _measurement = Measurement::start(self);
        fut.await
    }

    /// Blocking counterpart of [`track`](Self::track)
    pub fn track_sync<T>(&self, f: impl FnOnce() -> T) -> T {
        let _measurement = Measurement::start(self);
        f()
    }
}

/// Charges the time since `start` to the tracker when dropped (including on unwind)
struct Measurement<'a> {
    tracker: &'a ExecutionTimeTracker,
    start: Instant,
}

impl<'a> Measurement<'a> {
    fn start(tracker: &'a ExecutionTimeTracker) -> Self {
        Self {
            tracker,
            start: Instant::now(),
        }
    }
}

impl Drop for Measurement<'_> {
    fn drop(&mut self) {
        let spent = u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.tracker.elapsed_ns.fetch_add(spent, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(limit_ms: u64) -> ExecutionTimeTracker {
        ExecutionTimeTracker::with_limit(NonZeroU64::new(limit_ms).unwrap())
    }

    #[test]
    fn test_new_tracker_is_empty() {
        let t = tracker(100);
        assert_eq!(t.limit_ms(), 100);
        assert_eq!(t.elapsed_ms(), 0);
        assert!(t.check_limit().is_ok());
        assert_eq!(t.snapshot().remaining_ms(), 100);
        assert!(!t.snapshot().is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_accumulates() {
        let t = tracker(100);

        t.track(tokio::time::sleep(Duration::from_millis(40))).await;
        assert_eq!(t.elapsed_ms(), 40);

        t.track(tokio::time::sleep(Duration::from_millis(40))).await;
        assert_eq!(t.elapsed_ms(), 80);
        assert!(t.check_limit().is_ok());

        t.track(tokio::time::sleep(Duration::from_millis(20))).await;
        assert_eq!(t.elapsed_ms(), 100);
        assert_eq!(
            t.check_limit(),
            Err(BudgetExceeded {
                limit_ms: 100,
                elapsed_ms: 100
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_charges_failures() {
        let t = tracker(1000);

        let result: Result<(), &str> = t
            .track(async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Err("boom")
            })
            .await;

        assert_eq!(result, Err("boom"));
        assert_eq!(t.elapsed_ms(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_charges_cancelled_future() {
        let t = tracker(1000);

        let tracked = t.track(std::future::pending::<()>());
        let timed_out = tokio::time::timeout(Duration::from_millis(50), tracked).await;

        assert!(timed_out.is_err());
        assert_eq!(t.elapsed_ms(), 50);
    }

    #[test]
    fn test_check_limit_does_not_mutate() {
        let t = tracker(10);
        for _ in 0..3 {
            assert!(t.check_limit().is_ok());
        }
        assert_eq!(t.elapsed_ms(), 0);
    }

    #[test]
    fn test_track_sync_returns_value_and_charges_on_panic() {
        let t = tracker(1000);
        assert_eq!(t.track_sync(|| 7), 7);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: u32 = t.track_sync(|| {
                std::thread::sleep(Duration::from_millis(5));
                panic!("script host crashed")
            });
        }));

        assert!(result.is_err());
        assert!(t.elapsed_ms() >= 5);
    }

    fn spin_for(duration: Duration) {
        let start = std::time::Instant::now();
        while start.elapsed() < duration {
            std::hint::spin_loop();
        }
    }

    #[test]
    fn test_sub_millisecond_runs_add_up() {
        let t = tracker(100);

        let mut runs = 0;
        while t.check_limit().is_ok() {
            t.track_sync(|| spin_for(Duration::from_micros(800)));
            runs += 1;
            assert!(runs <= 200, "Budget never tripped, charged {:?}", t.elapsed());
        }

        // 125 runs of 800us cover 100ms; timing overhead only adds
        assert!(runs <= 125, "Needed {runs} runs to spend 100ms");
        assert!(t.elapsed() >= Duration::from_millis(100));
        assert_eq!(t.elapsed_ms(), t.elapsed().as_millis() as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_milliseconds_are_kept() {
        let t = tracker(10);

        for _ in 0..4 {
            t.track(tokio::time::sleep(Duration::from_micros(2500))).await;
        }

        assert!(t.elapsed() >= Duration::from_millis(10));
        assert!(t.check_limit().is_err());
    }
}
