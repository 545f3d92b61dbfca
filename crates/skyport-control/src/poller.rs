//! Waiting on asynchronous remote operations.
//!
//! Every mutating backend call may return an operation handle. The poller
//! turns that handle into a blocking, cancellable wait: query once straight
//! away, then once per tick, until the remote reports a terminal state, the
//! deadline passes, or the caller cancels.
//!
//! The same loop backs every other readiness wait (target health, service
//! gone, mount target detached, endpoint answering) through [`OperationPoller::wait_until`].

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::OperationSource;
use crate::config::PollConfig;
use crate::error::{ControlError, ControlResult, ErrorClass};
use crate::types::{OperationHandle, OperationState};

/// Tick interval and overall deadline for a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Time between queries.
    pub interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

impl PollSettings {
    /// Create settings.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Build settings from configuration.
    #[must_use]
    pub const fn from_config(config: &PollConfig) -> Self {
        Self::new(config.interval(), config.timeout())
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from_config(&PollConfig::default())
    }
}

/// Outcome of a single readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// The condition holds.
    Done,
    /// Not yet; carries the status observed.
    Pending(String),
    /// The condition can never hold; carries the status observed.
    Failed(String),
}

/// Polls until something reaches a terminal state.
#[derive(Debug, Clone)]
pub struct OperationPoller {
    settings: PollSettings,
    cancel: CancellationToken,
}

impl OperationPoller {
    /// Create a poller.
    #[must_use]
    pub const fn new(settings: PollSettings, cancel: CancellationToken) -> Self {
        Self { settings, cancel }
    }

    /// Same cancellation, different timing.
    #[must_use]
    pub fn with_settings(&self, settings: PollSettings) -> Self {
        Self::new(settings, self.cancel.clone())
    }

    /// Current timing.
    #[must_use]
    pub const fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Cancellation token the waits select on.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for an operation to finish.
    ///
    /// An empty handle succeeds immediately without querying the source.
    /// A failed operation returns [`ControlError::OperationFailed`] carrying
    /// the remote status. Unrecognised states are logged and polled again.
    pub async fn await_operation<S>(&self, source: &S, handle: &OperationHandle) -> ControlResult<()>
    where
        S: OperationSource + ?Sized,
    {
        if handle.is_empty() {
            debug!("no operation to wait for");
            return Ok(());
        }

        let label = format!("operation {handle}");
        self.wait_until(&label, move || async move {
            match source.poll_operation(handle).await {
                Ok(status) => match status.state {
                    OperationState::Succeeded => Ok(Probe::Done),
                    OperationState::InProgress => Ok(Probe::Pending(status.message)),
                    OperationState::Failed => Err(ControlError::OperationFailed {
                        handle: handle.to_string(),
                        status: status.message,
                    }),
                    OperationState::Unknown => {
                        warn!(handle = %handle, status = %status.message, "unrecognised operation status");
                        Ok(Probe::Pending(status.message))
                    }
                },
                Err(err) if source.classify_error(&err) == ErrorClass::Retryable => {
                    debug!(handle = %handle, error = %err, "transient poll failure");
                    Ok(Probe::Pending(err.to_string()))
                }
                Err(err) => Err(err),
            }
        })
        .await
    }

    /// Query `probe` immediately and then once per tick until it reports
    /// [`Probe::Done`].
    ///
    /// [`Probe::Failed`] becomes [`ControlError::OperationFailed`] and probe
    /// errors are returned as-is. On deadline or cancellation the error is
    /// [`ControlError::Aborted`] naming the last status seen.
    pub async fn wait_until<F, Fut>(&self, label: &str, mut probe: F) -> ControlResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ControlResult<Probe>>,
    {
        let started = Instant::now();
        let deadline = started + self.settings.timeout;
        let mut last_status = String::from("not queried");

        loop {
            let probed = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                () = tokio::time::sleep_until(deadline) => None,
                result = probe() => Some(result?),
            };

            match probed {
                Some(Probe::Done) => {
                    debug!(label, elapsed = ?started.elapsed(), "wait finished");
                    return Ok(());
                }
                Some(Probe::Failed(status)) => {
                    return Err(ControlError::OperationFailed {
                        handle: label.to_owned(),
                        status,
                    });
                }
                Some(Probe::Pending(status)) => {
                    debug!(label, status = %status, "still waiting");
                    last_status = status;
                }
                None => return Err(self.aborted(label, last_status, started)),
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return Err(self.aborted(label, last_status, started));
                }
                () = tokio::time::sleep_until(deadline) => {
                    return Err(self.aborted(label, last_status, started));
                }
                () = tokio::time::sleep(self.settings.interval) => {}
            }
        }
    }

    fn aborted(&self, label: &str, last_status: String, started: Instant) -> ControlError {
        let elapsed = started.elapsed();
        if self.cancel.is_cancelled() {
            warn!(label, elapsed = ?elapsed, "wait cancelled");
        } else {
            warn!(label, elapsed = ?elapsed, timeout = ?self.settings.timeout, "wait timed out");
        }
        ControlError::Aborted {
            target: label.to_owned(),
            last_status,
            elapsed,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::types::OperationStatus;

    /// Replays a scripted sequence of answers, repeating the last one.
    struct Scripted {
        answers: Mutex<VecDeque<OperationStatus>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(answers: Vec<OperationStatus>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OperationSource for Scripted {
        async fn poll_operation(&self, _: &OperationHandle) -> ControlResult<OperationStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                Ok(answers.pop_front().unwrap())
            } else {
                Ok(answers.front().cloned().unwrap())
            }
        }
    }

    fn poller(interval_secs: u64, timeout_secs: u64) -> OperationPoller {
        OperationPoller::new(
            PollSettings::new(
                Duration::from_secs(interval_secs),
                Duration::from_secs(timeout_secs),
            ),
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_three_ticks() {
        let source = Scripted::new(vec![
            OperationStatus::in_progress("PENDING"),
            OperationStatus::in_progress("PENDING"),
            OperationStatus::in_progress("RUNNING"),
            OperationStatus::succeeded("COMPLETE"),
        ]);
        let started = Instant::now();

        poller(5, 600)
            .await_operation(&source, &OperationHandle::new("op-1"))
            .await
            .unwrap();

        assert_eq!(source.calls(), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_shorter_than_tick_aborts() {
        let source = Scripted::new(vec![OperationStatus::in_progress("PENDING")]);
        let started = Instant::now();

        let err = poller(5, 1)
            .await_operation(&source, &OperationHandle::new("op-1"))
            .await
            .unwrap_err();

        assert_eq!(source.calls(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        match err {
            ControlError::Aborted {
                last_status,
                elapsed,
                ..
            } => {
                assert_eq!(last_status, "PENDING");
                assert_eq!(elapsed, Duration::from_secs(1));
            }
            other => panic!("expected Aborted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_handle_makes_no_calls() {
        let source = Scripted::new(vec![OperationStatus::failed("should not be seen")]);

        poller(5, 600)
            .await_operation(&source, &OperationHandle::none())
            .await
            .unwrap();

        assert_eq!(source.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_carries_status() {
        let source = Scripted::new(vec![
            OperationStatus::in_progress("UPDATE_IN_PROGRESS"),
            OperationStatus::failed("ROLLBACK_COMPLETE"),
        ]);

        let err = poller(5, 600)
            .await_operation(&source, &OperationHandle::new("op-9"))
            .await
            .unwrap_err();

        match err {
            ControlError::OperationFailed { handle, status } => {
                assert_eq!(handle, "op-9");
                assert_eq!(status, "ROLLBACK_COMPLETE");
            }
            other => panic!("expected OperationFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_status_keeps_polling() {
        let source = Scripted::new(vec![
            OperationStatus::unknown("REVIEW_IN_PROGRESS"),
            OperationStatus::succeeded("COMPLETE"),
        ]);

        poller(5, 600)
            .await_operation(&source, &OperationHandle::new("op-2"))
            .await
            .unwrap();

        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_wait() {
        let source = Scripted::new(vec![OperationStatus::in_progress("PENDING")]);
        let poller = poller(5, 600);
        let cancel = poller.cancel_token().clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            cancel.cancel();
        });

        let err = poller
            .await_operation(&source, &OperationHandle::new("op-3"))
            .await
            .unwrap_err();

        assert!(err.is_aborted());
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_reports_failed_probe() {
        let err = poller(1, 60)
            .wait_until("mount target mt-1", || async {
                Ok(Probe::Failed("error".to_owned()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ControlError::OperationFailed { .. }));
    }
}
