//! Bounded-concurrency fan-out over the runtime's worker pool.
//!
//! Every item becomes its own spawned task, but no more than `concurrency`
//! tasks are alive at once; the rest wait in the source iterator until a
//! slot frees. The first failure ends the whole fan-out and aborts the
//! tasks still in flight, as does dropping the returned future.

use futures::stream::{self, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::{JoinError, JoinHandle};

/// Outcome of a fan-out where every item succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutSummary {
    pub completed: u64,
}

/// Errors that end a fan-out early.
#[derive(Debug)]
pub enum FanOutError<E> {
    /// An item's future returned an error.
    Task(E),
    /// An item's task panicked or was cancelled.
    Join(JoinError),
}

impl<E: std::fmt::Display> std::fmt::Display for FanOutError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FanOutError::Task(e) => write!(f, "fan-out item failed: {}", e),
            FanOutError::Join(e) => write!(f, "fan-out task did not complete: {}", e),
        }
    }
}

impl<E> std::error::Error for FanOutError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FanOutError::Task(e) => Some(e),
            FanOutError::Join(e) => Some(e),
        }
    }
}

/// Task handle that aborts the task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `f` for every item with at most `concurrency` in flight.
///
/// A `concurrency` of 0 is treated as 1. Completion order is unspecified;
/// the future resolves once all items have finished or on the first error.
pub async fn fan_out<I, F, Fut, T, E>(
    items: I,
    concurrency: usize,
    mut f: F,
) -> Result<FanOutSummary, FanOutError<E>>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let mut results = stream::iter(items)
        .map(|item| AbortOnDrop(tokio::spawn(f(item))))
        .buffer_unordered(concurrency.max(1));

    let mut completed = 0;
    while let Some(result) = results.next().await {
        match result {
            Ok(Ok(_)) => completed += 1,
            Ok(Err(e)) => return Err(FanOutError::Task(e)),
            Err(e) => return Err(FanOutError::Join(e)),
        }
    }

    Ok(FanOutSummary { completed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    impl Gauge {
        async fn hold(&self, duration: Duration) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(duration).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_all_items_complete() {
        let gauge = Arc::new(Gauge::default());
        let g = Arc::clone(&gauge);

        let summary = fan_out(0..100u32, 10, move |_| {
            let g = Arc::clone(&g);
            async move {
                g.hold(Duration::from_millis(1)).await;
                Ok::<_, String>(())
            }
        })
        .await
        .unwrap();

        assert_eq!(summary.completed, 100);
        assert_eq!(gauge.finished.load(Ordering::SeqCst), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let gauge = Arc::new(Gauge::default());
        let g = Arc::clone(&gauge);

        let summary = fan_out(0..50u32, 5, move |_| {
            let g = Arc::clone(&g);
            async move {
                g.hold(Duration::from_millis(10)).await;
                Ok::<_, String>(())
            }
        })
        .await
        .unwrap();

        assert_eq!(summary.completed, 50);
        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!(peak <= 5, "peak in flight was {peak}");
        assert!(peak >= 2, "items never overlapped (peak {peak})");
    }

    #[tokio::test]
    async fn test_items_run_concurrently() {
        let start = Instant::now();
        fan_out(0..20u32, 20, |_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, String>(())
        })
        .await
        .unwrap();
        // Sequential would take a full second.
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_first_error_fails_fast() {
        let start = Instant::now();
        let err = fan_out(0..10u32, 10, |id| async move {
            if id == 3 {
                return Err(format!("item {id} failed"));
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, FanOutError::Task(ref msg) if msg == "item 3 failed"));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(err.to_string(), "fan-out item failed: item 3 failed");
    }

    #[tokio::test]
    async fn test_panicking_item_is_join_error() {
        let err = fan_out(0..3u32, 3, |id| async move {
            if id == 1 {
                panic!("boom");
            }
            Ok::<_, String>(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, FanOutError::Join(ref e) if e.is_panic()));
    }

    #[tokio::test]
    async fn test_dropping_fan_out_cancels_in_flight_items() {
        let gauge = Arc::new(Gauge::default());
        let g = Arc::clone(&gauge);

        let fan = fan_out(0..10u32, 10, move |_| {
            let g = Arc::clone(&g);
            async move {
                g.hold(Duration::from_millis(100)).await;
                Ok::<_, String>(())
            }
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(20), fan).await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(gauge.finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_concurrency_still_progresses() {
        let summary = fan_out(0..3u32, 0, |_| async { Ok::<_, String>(()) })
            .await
            .unwrap();
        assert_eq!(summary.completed, 3);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let summary = fan_out(Vec::<u32>::new(), 4, |_| async { Ok::<_, String>(()) })
            .await
            .unwrap();
        assert_eq!(summary.completed, 0);
    }
}
