use std::future::Future;
use std::time::Duration;

use tracing::debug;

use super::DeviceResult;

/// Bounded retry policy for device reads.
///
/// Attempts are limited and backoff doubles between them; a meter that keeps
/// failing costs at most attempts * max_backoff per cycle.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_backoff,
            max_backoff: initial_backoff * 4,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retriable error, or the
/// attempt budget is exhausted.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> DeviceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DeviceResult<T>>,
{
    let mut backoff = policy.initial_backoff;

    for attempt in 1..=policy.attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt < policy.attempts => {
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %err, "retrying device call");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            Err(err) => return Err(err),
        }
    }

    // attempts >= 1, every iteration returns
    unreachable!("retry loop exited without result")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let res = retry(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(DeviceError::Device("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(res.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempt_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let res: DeviceResult<()> = retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DeviceError::Timeout) }
        })
        .await;

        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn config_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let res: DeviceResult<()> = retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DeviceError::Config("bad".into())) }
        })
        .await;

        assert!(matches!(res, Err(DeviceError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
