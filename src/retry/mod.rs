//! Retry policies and remote-call helpers
//!
//! Two independent policies cover the two transient backend signals. An
//! execution timeout gets a bounded number of fixed-delay retries, used by
//! every read and by transaction begin. Begin-call overload gets unbounded
//! attempts under a jittered exponential backoff whose cumulative sleep is
//! capped; once the cap would be exceeded the caller drops the throttling
//! flag instead of failing. Policy state is local to one in-flight call,
//! never shared.

use std::future::Future;
use std::time::Duration;

#[cfg(feature = "metrics")]
use metrics::counter;
use rand::Rng;
use tokio::time::timeout;
use tracing::debug;

use crate::cancel::CancellationSignal;
use crate::config::{OverloadBackoffConfig, TimeoutRetryConfig};
use crate::error::{MergelineError, Result};

/// Outcome of consulting a retry policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Bounded fixed-delay retry for backend execution timeouts.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutRetryPolicy {
    max_retries: u32,
    delay: Duration,
}

impl TimeoutRetryPolicy {
    pub fn from_config(config: &TimeoutRetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: config.retry_delay(),
        }
    }

    /// Decide whether another attempt is allowed. `attempts_so_far` counts
    /// retries already made, not the initial attempt. Only execution
    /// timeouts are ever retried by this policy.
    pub fn evaluate(&self, attempts_so_far: u32, error: &MergelineError) -> RetryDecision {
        if error.is_execution_timeout() && attempts_so_far < self.max_retries {
            RetryDecision::RetryAfter(self.delay)
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Per-call jittered exponential backoff for transaction-begin overload.
///
/// Delays grow by a uniform random factor in `[multiplier_min,
/// multiplier_max)` per step, so with a minimum multiplier above 1 each delay
/// is strictly greater than the previous one. [`next_delay`] returns `None`
/// once the cumulative sleep would exceed the cap, at which point the begin
/// path proceeds unthrottled.
///
/// [`next_delay`]: OverloadBackoff::next_delay
#[derive(Debug)]
pub struct OverloadBackoff {
    next: Duration,
    slept: Duration,
    cap: Duration,
    multiplier_min: f64,
    multiplier_max: f64,
}

impl OverloadBackoff {
    pub fn new(config: &OverloadBackoffConfig) -> Self {
        Self {
            next: config.base_delay(),
            slept: Duration::ZERO,
            cap: config.cumulative_cap(),
            multiplier_min: config.multiplier_min,
            multiplier_max: config.multiplier_max,
        }
    }

    /// The delay to sleep before the next attempt, or `None` once the
    /// cumulative cap is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.next;
        if self.slept + delay > self.cap {
            return None;
        }
        self.slept += delay;
        let factor = if self.multiplier_max > self.multiplier_min {
            rand::thread_rng().gen_range(self.multiplier_min..self.multiplier_max)
        } else {
            self.multiplier_min
        };
        self.next = delay.mul_f64(factor);
        Some(delay)
    }

    /// Total time handed out so far.
    pub fn cumulative_slept(&self) -> Duration {
        self.slept
    }
}

/// Run one remote backend call under an execution budget, racing it against
/// the cancellation signal. An elapsed budget maps to the execution-timeout
/// error; observed cancellation drops the in-flight future.
pub async fn run_remote<T, F>(
    operation: &'static str,
    budget: Duration,
    cancel: &CancellationSignal,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MergelineError::Cancelled(operation)),
        outcome = timeout(budget, call) => match outcome {
            Ok(result) => result,
            Err(_) => {
                #[cfg(feature = "metrics")]
                counter!("mergeline_execution_timeouts_total").increment(1);
                debug!(operation, budget_ms = budget.as_millis() as u64, "Call budget elapsed");
                Err(MergelineError::execution_timeout(
                    operation,
                    format!("budget of {}ms exceeded", budget.as_millis()),
                ))
            }
        },
    }
}

/// Sleep between retries, unwinding promptly when cancellation is observed.
/// No retry loop re-attempts after this returns an error.
pub async fn sleep_cancellable(
    delay: Duration,
    cancel: &CancellationSignal,
    operation: &'static str,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MergelineError::Cancelled(operation)),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationSource;
    use crate::config::OverloadBackoffConfig;

    fn timeout_policy() -> TimeoutRetryPolicy {
        TimeoutRetryPolicy::from_config(&TimeoutRetryConfig::default())
    }

    #[test]
    fn timeout_policy_allows_three_retries() {
        let policy = timeout_policy();
        let err = MergelineError::execution_timeout("get_by_keys", "simulated");
        assert_eq!(
            policy.evaluate(0, &err),
            RetryDecision::RetryAfter(Duration::from_secs(5))
        );
        assert_eq!(
            policy.evaluate(2, &err),
            RetryDecision::RetryAfter(Duration::from_secs(5))
        );
        assert_eq!(policy.evaluate(3, &err), RetryDecision::GiveUp);
    }

    #[test]
    fn timeout_policy_only_retries_execution_timeouts() {
        let policy = timeout_policy();
        assert_eq!(
            policy.evaluate(0, &MergelineError::overload("busy")),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.evaluate(0, &MergelineError::storage_msg("constraint violation")),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.evaluate(0, &MergelineError::Cancelled("get_by_keys")),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn backoff_delays_strictly_increase_up_to_the_cap() {
        let mut backoff = OverloadBackoff::new(&OverloadBackoffConfig::default());
        let mut previous = Duration::ZERO;
        let mut total = Duration::ZERO;
        let mut steps = 0;
        while let Some(delay) = backoff.next_delay() {
            assert!(delay > previous, "delay {delay:?} did not grow past {previous:?}");
            previous = delay;
            total += delay;
            steps += 1;
            assert!(steps < 64, "backoff never reached its cap");
        }
        assert!(steps >= 1);
        assert!(total <= Duration::from_secs(60));
        assert_eq!(backoff.cumulative_slept(), total);
        // Exhausted stays exhausted.
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn backoff_first_delay_is_the_base() {
        let mut backoff = OverloadBackoff::new(&OverloadBackoffConfig::default());
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn run_remote_maps_an_elapsed_budget() {
        let cancel = CancellationSignal::none();
        let err = run_remote("slow_call", Duration::from_millis(10), &cancel, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_execution_timeout());
    }

    #[tokio::test]
    async fn run_remote_passes_results_and_errors_through() {
        let cancel = CancellationSignal::none();
        let value = run_remote("fast_call", Duration::from_secs(1), &cancel, async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let err = run_remote("failing_call", Duration::from_secs(1), &cancel, async {
            Err::<(), _>(MergelineError::storage_msg("boom"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, MergelineError::Storage(_)));
    }

    #[tokio::test]
    async fn run_remote_observes_pre_cancellation() {
        let source = CancellationSource::new();
        source.cancel();
        let err = run_remote("call", Duration::from_secs(1), &source.signal(), async {
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn sleep_cancellable_unwinds_on_cancel() {
        let source = CancellationSource::new();
        let signal = source.signal();
        let sleeper = tokio::spawn(async move {
            sleep_cancellable(Duration::from_secs(60), &signal, "begin_transaction").await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .expect("sleep did not unwind")
            .expect("sleeper panicked");
        assert!(matches!(outcome, Err(MergelineError::Cancelled(_))));
    }
}
