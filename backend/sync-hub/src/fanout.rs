/// Bounded-concurrency dispatch
///
/// Spawns one task per target but never lets more than the limiter's permit
/// count run at the same time. A permit is acquired before the task is
/// spawned, so a large target list queues up here instead of becoming an
/// unbounded pile of in-flight network operations.
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

/// Outcome counts of one dispatch round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: usize,
    pub failed: usize,
}

impl DispatchSummary {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Run `send` once per target and wait for all of them.
///
/// `send` resolves to `true` on success. Its failures are counted, never
/// propagated, and never stop the remaining targets.
pub async fn dispatch_bounded<T, F, Fut>(
    targets: Vec<T>,
    limiter: Arc<Semaphore>,
    send: F,
) -> DispatchSummary
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = bool> + Send + 'static,
{
    let mut tasks = JoinSet::new();
    let mut summary = DispatchSummary::default();

    for target in targets {
        let permit = match limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("dispatch limiter closed; skipping remaining targets");
                summary.failed += 1;
                continue;
            }
        };

        let fut = send(target);
        tasks.spawn(async move {
            let ok = fut.await;
            drop(permit);
            ok
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(true) => summary.delivered += 1,
            Ok(false) => summary.failed += 1,
            Err(e) => {
                warn!(error = %e, "dispatch task aborted");
                summary.failed += 1;
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let limiter = Arc::new(Semaphore::new(3));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let summary = dispatch_bounded((0..40).collect::<Vec<u32>>(), limiter, |_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                true
            }
        })
        .await;

        assert_eq!(summary.delivered, 40);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let limiter = Arc::new(Semaphore::new(2));

        let summary = dispatch_bounded(vec![1, 2, 3, 4, 5], limiter, |n| async move {
            n % 2 == 0
        })
        .await;

        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.attempted(), 5);
    }

    #[tokio::test]
    async fn test_empty_target_list() {
        let limiter = Arc::new(Semaphore::new(1));
        let summary = dispatch_bounded(Vec::<u8>::new(), limiter, |_| async { true }).await;
        assert_eq!(summary, DispatchSummary::default());
    }

    #[tokio::test]
    async fn test_closed_limiter_counts_as_failures() {
        let limiter = Arc::new(Semaphore::new(1));
        limiter.close();
        let summary = dispatch_bounded(vec![1, 2], limiter, |_| async { true }).await;
        assert_eq!(summary.failed, 2);
    }
}
