//! Bounded polling and cancellation helpers
//!
//! Every wait in the worker (backend readiness, waiting for an instance,
//! waiting for a container name to free up) goes through these helpers so it
//! can be cut short by a [`CancellationToken`].

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use worker_core::{Error, PoolConfig, Result};

/// How often and how many times to probe before giving up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl ReadinessPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// First readiness phase of a freshly started backend
    pub fn fast(config: &PoolConfig) -> Self {
        Self::new(config.ready_fast_interval(), config.ready_fast_attempts)
    }

    /// Retry phase used after the fast phase ran out
    pub fn slow(config: &PoolConfig) -> Self {
        Self::new(config.ready_slow_interval(), config.ready_slow_attempts)
    }

    /// Waiting for another task to finish loading an instance
    pub fn instance_wait(config: &PoolConfig) -> Self {
        Self::new(config.wait_interval(), config.wait_max_attempts)
    }
}

/// Run `fut` unless `cancel` fires first
pub async fn cancellable<T, F>(cancel: &CancellationToken, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(what.to_string())),
        result = fut => result,
    }
}

/// Sleep for `duration` unless `cancel` fires first
pub async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration, what: &str) -> Result<()> {
    cancellable(cancel, what, async {
        tokio::time::sleep(duration).await;
        Ok(())
    })
    .await
}

/// Call `probe` until it reports true.
///
/// Returns the attempt number that succeeded, `Timeout` once the policy is
/// exhausted, or the first error the probe returns.
pub async fn poll_until<F, Fut>(
    policy: ReadinessPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut probe: F,
) -> Result<u32>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    for attempt in 1..=policy.max_attempts {
        if cancellable(cancel, what, probe()).await? {
            debug!(what, attempt, "Poll condition satisfied");
            return Ok(attempt);
        }
        if attempt < policy.max_attempts {
            sleep_or_cancel(cancel, policy.interval, what).await?;
        }
    }
    Err(Error::timeout(format!(
        "{} after {} attempts every {:?}",
        what, policy.max_attempts, policy.interval
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_poll_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let cancel = CancellationToken::new();
        let policy = ReadinessPolicy::new(Duration::from_millis(100), 10);
        let started = tokio::time::Instant::now();

        let attempt = poll_until(policy, &cancel, "backend", move || async move {
            Ok(calls.fetch_add(1, Ordering::SeqCst) + 1 >= 3)
        })
        .await
        .unwrap();

        assert_eq!(attempt, 3);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out() {
        let cancel = CancellationToken::new();
        let policy = ReadinessPolicy::new(Duration::from_millis(500), 4);
        let err = poll_until(policy, &cancel, "instance resnet50_4", || async { Ok(false) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.to_string().contains("instance resnet50_4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_propagates_probe_error() {
        let cancel = CancellationToken::new();
        let policy = ReadinessPolicy::new(Duration::from_millis(10), 5);
        let err = poll_until(policy, &cancel, "probe", || async {
            Err::<bool, _>(Error::upstream("metadata store down"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = ReadinessPolicy::new(Duration::from_secs(1), 1000);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let counter = calls.clone();
        let err = poll_until(policy, &cancel, "backend", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
