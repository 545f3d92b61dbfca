//! Fixed-interval retry for calls rejected by eventual consistency.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{ControlError, ControlResult, ErrorClass};

/// Bounded fixed-interval retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub attempts: u32,
    /// Pause between attempts.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Build a policy from configuration.
    #[must_use]
    pub const fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.attempts, config.interval())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt cap is reached.
///
/// Only errors that `classify` marks [`ErrorClass::Retryable`] are retried.
/// Anything else is returned unchanged on first sight. When the cap is
/// reached the last error is returned. Cancellation during the pause
/// returns [`ControlError::Aborted`].
pub async fn retry_fixed<T, F, Fut, C>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    classify: C,
    mut op: F,
) -> ControlResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlResult<T>>,
    C: Fn(&ControlError) -> ErrorClass,
{
    let attempts = policy.attempts.max(1);
    let started = Instant::now();
    let mut attempt = 1;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let class = classify(&err);
        if class != ErrorClass::Retryable {
            debug!(label, attempt, class = %class, error = %err, "not retrying");
            return Err(err);
        }

        if attempt >= attempts {
            warn!(label, attempts, error = %err, "retry attempts exhausted");
            return Err(err);
        }

        debug!(label, attempt, error = %err, "retryable rejection, waiting");
        tokio::select! {
            () = tokio::time::sleep(policy.interval) => {}
            () = cancel.cancelled() => {
                return Err(ControlError::Aborted {
                    target: label.to_owned(),
                    last_status: err.to_string(),
                    elapsed: started.elapsed(),
                });
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::default_classification;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(30, Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn always_retryable_hits_the_cap() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: ControlResult<()> = retry_fixed(
            &policy(),
            &CancellationToken::new(),
            "create service",
            default_classification,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(ControlError::retryable(format!("role not visible ({n})"))) }
            },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 30);
        let err = result.unwrap_err();
        assert_eq!(
            err.to_string(),
            "remote rejected request, retry later: role not visible (30)"
        );
        assert_eq!(started.elapsed(), Duration::from_secs(58));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_is_returned_immediately() {
        let calls = AtomicU32::new(0);

        let result: ControlResult<()> = retry_fixed(
            &policy(),
            &CancellationToken::new(),
            "create service",
            default_classification,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ControlError::fatal("access denied")) }
            },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ControlError::Fatal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_is_not_retried() {
        let calls = AtomicU32::new(0);

        let result: ControlResult<()> = retry_fixed(
            &policy(),
            &CancellationToken::new(),
            "create service",
            default_classification,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ControlError::internal("unexpected")) }
            },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_rejections() {
        let calls = AtomicU32::new(0);

        let value = retry_fixed(
            &policy(),
            &CancellationToken::new(),
            "create service",
            default_classification,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(ControlError::retryable("not yet"))
                    } else {
                        Ok("svc-1")
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, "svc-1");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_the_pause() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: ControlResult<()> = retry_fixed(
            &policy(),
            &cancel,
            "delete security group",
            default_classification,
            || async { Err(ControlError::retryable("dependency violation")) },
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.is_aborted());
    }
}
