//! One-shot and periodic timers backed by tokio tasks.
//!
//! Timers are cancelled when their [`TimeoutHandle`] is dropped. Arming a
//! timer outside a tokio runtime is not an error: the timer is skipped and
//! `None` is returned.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle to an armed timer. Dropping it cancels the timer.
#[derive(Debug)]
pub struct TimeoutHandle {
    token: CancellationToken,
}

impl TimeoutHandle {
    /// Cancels the timer. Equivalent to dropping the handle.
    pub fn cancel(self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Spawns `fut` on the current runtime, if there is one.
pub(crate) fn spawn<F>(fut: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
            true
        }
        Err(_) => {
            debug!("no tokio runtime, background task skipped");
            false
        }
    }
}

/// Runs `f` once after `delay`.
///
/// `Duration::MAX` never fires and returns `None`.
pub fn set_timeout<F>(delay: Duration, f: F) -> Option<TimeoutHandle>
where
    F: FnOnce() + Send + 'static,
{
    if delay == Duration::MAX {
        return None;
    }
    let token = CancellationToken::new();
    let child = token.clone();
    let spawned = spawn(async move {
        tokio::select! {
            biased;
            () = child.cancelled() => {}
            () = sleep(delay) => f(),
        }
    });
    spawned.then_some(TimeoutHandle { token })
}

/// Runs `f` every `period`, starting one period from now.
pub fn set_interval<F>(period: Duration, f: F) -> Option<TimeoutHandle>
where
    F: Fn() + Send + 'static,
{
    if period.is_zero() || period == Duration::MAX {
        return None;
    }
    let token = CancellationToken::new();
    let child = token.clone();
    let spawned = spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticks = interval_at(start, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                () = child.cancelled() => break,
                _ = ticks.tick() => f(),
            }
        }
    });
    spawned.then_some(TimeoutHandle { token })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        (Arc::clone(&hits), hits)
    }

    #[test]
    fn test_set_timeout_without_runtime_is_skipped() {
        assert!(set_timeout(Duration::from_millis(10), || {}).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_timeout_fires_once() {
        let (hits, seen) = counter();
        let _handle = set_timeout(Duration::from_millis(50), move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
        .expect("timer should be armed inside a runtime");

        tokio::time::sleep(Duration::from_millis(49)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_cancels_timeout() {
        let (hits, seen) = counter();
        let handle = set_timeout(Duration::from_millis(50), move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        drop(handle);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_timeout() {
        assert!(set_timeout(Duration::MAX, || {}).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_interval_ticks_until_cancelled() {
        let (hits, seen) = counter();
        let handle = set_interval(Duration::from_millis(10), move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
        .expect("interval should be armed inside a runtime");

        // No immediate tick.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
