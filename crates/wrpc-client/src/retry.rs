// ABOUTME: Bounded polling until a probe reports the backend has converged.
// ABOUTME: Fixed interval, wall-clock deadline, explicit state machine, optional cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ConvergenceError;

/// Default pause between probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default deadline for "does it exist / is it ready yet" checks.
pub const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Default deadline for asynchronous deletion checks.
pub const DELETION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// How often to probe and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::availability()
    }
}

impl RetryPolicy {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }

    /// Waiting for a record or derived field to appear.
    pub fn availability() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, AVAILABILITY_TIMEOUT)
    }

    /// Waiting for a record to be fully removed.
    pub fn deletion() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DELETION_TIMEOUT)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// What one probe invocation observed.
#[derive(Debug)]
pub enum ProbeOutcome<T, E> {
    /// The desired state was observed.
    Converged(T),
    /// Not there yet; poll again.
    Retryable(String),
    /// Polling can never succeed.
    Fatal(E),
}

/// Where a polling loop stands.
#[derive(Debug)]
enum RetryState<T, E> {
    Probing,
    Converged(T),
    TimedOut,
    Aborted(E),
    Cancelled,
}

/// Poll `probe` every `policy.interval` until it converges, fails fatally, or
/// `policy.deadline` has passed since the first call.
///
/// The loop never reports a timeout before the deadline; the last sleep is
/// shortened so one final probe lands on it.
pub async fn retry_until<T, E, F, Fut>(
    policy: &RetryPolicy,
    probe: F,
) -> Result<T, ConvergenceError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProbeOutcome<T, E>>,
{
    run(policy, None, probe).await
}

/// [`retry_until`], also stopping with `Cancelled` as soon as `cancel` fires.
pub async fn retry_until_cancelled<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    probe: F,
) -> Result<T, ConvergenceError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProbeOutcome<T, E>>,
{
    run(policy, Some(cancel), probe).await
}

async fn run<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    mut probe: F,
) -> Result<T, ConvergenceError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProbeOutcome<T, E>>,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;
    let mut last_reason = String::new();
    let mut state = RetryState::Probing;

    loop {
        state = match state {
            RetryState::Probing => {
                attempts += 1;
                let outcome = match cancel {
                    Some(token) => tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        outcome = probe() => Some(outcome),
                    },
                    None => Some(probe().await),
                };

                match outcome {
                    None => RetryState::Cancelled,
                    Some(ProbeOutcome::Converged(value)) => RetryState::Converged(value),
                    Some(ProbeOutcome::Fatal(error)) => RetryState::Aborted(error),
                    Some(ProbeOutcome::Retryable(reason)) => {
                        let elapsed = start.elapsed();
                        tracing::debug!(
                            attempt = attempts,
                            elapsed_ms = elapsed.as_millis() as u64,
                            reason = %reason,
                            "not converged yet"
                        );
                        last_reason = reason;

                        if elapsed >= policy.deadline {
                            RetryState::TimedOut
                        } else {
                            let pause = policy.interval.min(policy.deadline - elapsed);
                            let slept = match cancel {
                                Some(token) => tokio::select! {
                                    biased;
                                    _ = token.cancelled() => false,
                                    _ = tokio::time::sleep(pause) => true,
                                },
                                None => {
                                    tokio::time::sleep(pause).await;
                                    true
                                }
                            };
                            if slept {
                                RetryState::Probing
                            } else {
                                RetryState::Cancelled
                            }
                        }
                    }
                }
            }
            RetryState::Converged(value) => {
                tracing::debug!(attempts, "converged");
                return Ok(value);
            }
            RetryState::Aborted(error) => {
                tracing::debug!(attempts, "convergence aborted by fatal probe outcome");
                return Err(ConvergenceError::Aborted(error));
            }
            RetryState::Cancelled => {
                tracing::debug!(attempts, "convergence cancelled");
                return Err(ConvergenceError::Cancelled { attempts });
            }
            RetryState::TimedOut => {
                let elapsed = start.elapsed();
                tracing::warn!(
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    reason = %last_reason,
                    "convergence deadline elapsed"
                );
                return Err(ConvergenceError::TimedOut {
                    attempts,
                    elapsed,
                    last_reason,
                });
            }
        };
    }
}

/// [`retry_until`], running `compensate` if the deadline passes.
///
/// A successful compensation still reports `TimedOut`; a failed one reports
/// `CompensationFailed` carrying the cleanup error.
pub async fn converge_or_compensate<T, E, F, Fut, C, CFut>(
    policy: &RetryPolicy,
    probe: F,
    compensate: C,
) -> Result<T, ConvergenceError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProbeOutcome<T, E>>,
    C: FnOnce() -> CFut,
    CFut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    match retry_until(policy, probe).await {
        Err(ConvergenceError::TimedOut {
            attempts,
            elapsed,
            last_reason,
        }) => match compensate().await {
            Ok(()) => {
                tracing::info!(attempts, "compensating action completed after timeout");
                Err(ConvergenceError::TimedOut {
                    attempts,
                    elapsed,
                    last_reason,
                })
            }
            Err(cleanup) => {
                tracing::error!(attempts, error = %cleanup, "compensating action failed");
                Err(ConvergenceError::CompensationFailed {
                    attempts,
                    last_reason,
                    cleanup,
                })
            }
        },
        other => other,
    }
}
