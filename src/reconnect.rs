use crate::config::ReconnectConfig;
use crate::handler::ErrorReporter;
use crate::metrics::Metrics;
use crate::transport::Dial;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a reconnect sequence ended.
#[derive(Debug)]
pub(crate) enum ReconnectOutcome<T> {
    /// A new transport is live
    Restored { transport: T, attempts: u32 },
    /// Every attempt failed; the connection must close
    Exhausted { attempts: u32, last_error: String },
    /// Another sequence holds the guard; this signal is a no-op
    AlreadyInProgress,
    /// The close signal fired mid-sequence
    Cancelled,
}

/// Re-establishes a transport with linear backoff.
///
/// Retry `k` waits `interval * k` after the `k`-th failure. There is no
/// wait after the last permitted attempt. Only one sequence runs at a time;
/// overlapping failure signals collapse into the one already running.
/// Every failed attempt is reported to the handler as a dial error.
pub(crate) struct ReconnectSupervisor<D> {
    dialer: D,
    config: ReconnectConfig,
    guard: Mutex<()>,
    errors: ErrorReporter,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    label: String,
}

impl<D: Dial> ReconnectSupervisor<D> {
    pub(crate) fn new(
        dialer: D,
        config: ReconnectConfig,
        errors: ErrorReporter,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
        label: String,
    ) -> Self {
        Self {
            dialer,
            config,
            guard: Mutex::new(()),
            errors,
            metrics,
            cancel,
            label,
        }
    }

    /// Run one reconnect sequence. The caller tears down the stale transport first.
    pub(crate) async fn reconnect(&self) -> ReconnectOutcome<D::Transport> {
        let Ok(_guard) = self.guard.try_lock() else {
            debug!("[{}] Reconnect already in progress, ignoring signal", self.label);
            return ReconnectOutcome::AlreadyInProgress;
        };

        let max_attempts = self.config.max_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return ReconnectOutcome::Cancelled;
            }

            self.metrics.record_reconnect_attempt();
            info!(
                "[{}] Reconnect attempt {}/{}",
                self.label, attempt, max_attempts
            );

            let dialed = tokio::select! {
                _ = self.cancel.cancelled() => return ReconnectOutcome::Cancelled,
                result = self.dialer.dial() => result,
            };

            match dialed {
                Ok(transport) => {
                    self.metrics.record_reconnection();
                    info!(
                        "[{}] Reconnected after {} attempt(s)",
                        self.label, attempt
                    );
                    return ReconnectOutcome::Restored {
                        transport,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    self.metrics.record_dial_failure();
                    last_error = e.to_string();
                    self.errors.report(e);

                    if attempt == max_attempts {
                        break;
                    }

                    let delay = self.config.delay_for_attempt(attempt);
                    warn!(
                        "[{}] Reconnect attempt {} failed: {}. Retrying in {:?}",
                        self.label, attempt, last_error, delay
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return ReconnectOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        error!(
            "[{}] Giving up after {} reconnect attempts, last error: {}",
            self.label, max_attempts, last_error
        );
        ReconnectOutcome::Exhausted {
            attempts: max_attempts,
            last_error,
        }
    }
}
