//! Configuration for the merge store client
//!
//! Retry counts, backoff shape and per-call execution budgets. The budget
//! constants are empirically tuned knobs, not contracts: recalibrate them
//! against the target backend's real latency profile.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MergelineError, Result};

/// Default number of retries after a backend execution timeout
pub const DEFAULT_TIMEOUT_RETRIES: u32 = 3;
/// Default fixed delay between execution-timeout retries
pub const DEFAULT_TIMEOUT_RETRY_DELAY_MS: u64 = 5_000;

/// Default first delay when transaction begin is throttled
pub const DEFAULT_OVERLOAD_BASE_DELAY_MS: u64 = 100;
/// Default lower bound of the random backoff multiplier (inclusive)
pub const DEFAULT_OVERLOAD_MULTIPLIER_MIN: f64 = 2.0;
/// Default upper bound of the random backoff multiplier (exclusive)
pub const DEFAULT_OVERLOAD_MULTIPLIER_MAX: f64 = 3.0;
/// Default cap on cumulative backoff sleep before begin proceeds unthrottled
pub const DEFAULT_OVERLOAD_CUMULATIVE_CAP_MS: u64 = 60_000;

/// Default base execution budget for batched reads
pub const DEFAULT_READ_BASE_TIMEOUT_SECS: u64 = 30;
/// Default linear budget term added per requested key
pub const DEFAULT_READ_PER_KEY_TIMEOUT_MS: u64 = 10;
/// Default budget for whole-transaction enumeration (long scans, never retried)
pub const DEFAULT_TRANSACTION_SCAN_TIMEOUT_SECS: u64 = 600;
/// Default budget for transaction-control calls (begin, commit, advance, ...)
pub const DEFAULT_CONTROL_CALL_TIMEOUT_SECS: u64 = 30;
/// Default pad added to the heartbeat budget so it never collides with the
/// backend's own default execution timeout
pub const DEFAULT_HEARTBEAT_TIMEOUT_PAD_SECS: u64 = 2;

/// Default interval between watchdog reconciliation cycles
pub const DEFAULT_WATCHDOG_CHECK_INTERVAL_MS: u64 = 15_000;
/// Default heartbeat age after which a started transaction is considered
/// abandoned
pub const DEFAULT_WATCHDOG_TRANSACTION_TIMEOUT_SECS: u64 = 600;

/// Bounded retry for backend execution timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutRetryConfig {
    /// Retries after the initial attempt; the next timeout propagates
    pub max_retries: u32,
    /// Fixed delay between retries in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for TimeoutRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_TIMEOUT_RETRIES,
            retry_delay_ms: DEFAULT_TIMEOUT_RETRY_DELAY_MS,
        }
    }
}

impl TimeoutRetryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Jittered exponential backoff for transaction-begin overload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverloadBackoffConfig {
    /// First delay in milliseconds
    pub base_delay_ms: u64,
    /// Lower bound of the per-step random multiplier (inclusive)
    pub multiplier_min: f64,
    /// Upper bound of the per-step random multiplier (exclusive)
    pub multiplier_max: f64,
    /// Cumulative sleep cap in milliseconds; once exceeded, begin drops the
    /// throttling flag and proceeds
    pub cumulative_cap_ms: u64,
}

impl Default for OverloadBackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_OVERLOAD_BASE_DELAY_MS,
            multiplier_min: DEFAULT_OVERLOAD_MULTIPLIER_MIN,
            multiplier_max: DEFAULT_OVERLOAD_MULTIPLIER_MAX,
            cumulative_cap_ms: DEFAULT_OVERLOAD_CUMULATIVE_CAP_MS,
        }
    }
}

impl OverloadBackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn cumulative_cap(&self) -> Duration {
        Duration::from_millis(self.cumulative_cap_ms)
    }
}

/// Per-call execution budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallBudgetConfig {
    pub read_base_timeout_secs: u64,
    pub read_per_key_timeout_ms: u64,
    pub transaction_scan_timeout_secs: u64,
    pub control_call_timeout_secs: u64,
    pub heartbeat_timeout_pad_secs: u64,
}

impl Default for CallBudgetConfig {
    fn default() -> Self {
        Self {
            read_base_timeout_secs: DEFAULT_READ_BASE_TIMEOUT_SECS,
            read_per_key_timeout_ms: DEFAULT_READ_PER_KEY_TIMEOUT_MS,
            transaction_scan_timeout_secs: DEFAULT_TRANSACTION_SCAN_TIMEOUT_SECS,
            control_call_timeout_secs: DEFAULT_CONTROL_CALL_TIMEOUT_SECS,
            heartbeat_timeout_pad_secs: DEFAULT_HEARTBEAT_TIMEOUT_PAD_SECS,
        }
    }
}

impl CallBudgetConfig {
    /// Budget for a batched read: base plus a linear term per key, so one
    /// large batch is never held to the budget of a point lookup.
    pub fn read_budget(&self, key_count: usize) -> Duration {
        Duration::from_secs(self.read_base_timeout_secs)
            + Duration::from_millis(self.read_per_key_timeout_ms) * key_count as u32
    }

    /// Budget for whole-transaction enumeration.
    pub fn transaction_scan_budget(&self) -> Duration {
        Duration::from_secs(self.transaction_scan_timeout_secs)
    }

    /// Budget for transaction-control calls.
    pub fn control_budget(&self) -> Duration {
        Duration::from_secs(self.control_call_timeout_secs)
    }

    /// Budget for a heartbeat call: a third of the heartbeat period plus a
    /// small pad. The fraction keeps a slow heartbeat from overlapping the
    /// next one; the pad keeps the budget away from the backend's default.
    pub fn heartbeat_budget(&self, heartbeat_period: Duration) -> Duration {
        heartbeat_period / 3 + Duration::from_secs(self.heartbeat_timeout_pad_secs)
    }
}

/// Watchdog reconciliation cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub check_interval_ms: u64,
    pub transaction_timeout_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: DEFAULT_WATCHDOG_CHECK_INTERVAL_MS,
            transaction_timeout_secs: DEFAULT_WATCHDOG_TRANSACTION_TIMEOUT_SECS,
        }
    }
}

impl WatchdogConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeStoreConfig {
    pub retry: TimeoutRetryConfig,
    pub backoff: OverloadBackoffConfig,
    pub budgets: CallBudgetConfig,
    pub watchdog: WatchdogConfig,
}

impl MergeStoreConfig {
    /// Validate cross-field constraints before handing the configuration to
    /// the client components.
    pub fn validate(&self) -> Result<()> {
        if self.backoff.base_delay_ms == 0 {
            return Err(MergelineError::invalid_input(
                "backoff.base_delay_ms must be greater than zero",
            ));
        }
        if self.backoff.multiplier_min <= 1.0 {
            return Err(MergelineError::invalid_input(format!(
                "backoff.multiplier_min must exceed 1.0 so delays grow, got {}",
                self.backoff.multiplier_min
            )));
        }
        if self.backoff.multiplier_max < self.backoff.multiplier_min {
            return Err(MergelineError::invalid_input(format!(
                "backoff.multiplier_max {} is below multiplier_min {}",
                self.backoff.multiplier_max, self.backoff.multiplier_min
            )));
        }
        if self.backoff.cumulative_cap_ms < self.backoff.base_delay_ms {
            return Err(MergelineError::invalid_input(
                "backoff.cumulative_cap_ms must cover at least the base delay",
            ));
        }
        if self.budgets.read_base_timeout_secs == 0 {
            return Err(MergelineError::invalid_input(
                "budgets.read_base_timeout_secs must be greater than zero",
            ));
        }
        if self.budgets.control_call_timeout_secs == 0 {
            return Err(MergelineError::invalid_input(
                "budgets.control_call_timeout_secs must be greater than zero",
            ));
        }
        if self.budgets.transaction_scan_timeout_secs == 0 {
            return Err(MergelineError::invalid_input(
                "budgets.transaction_scan_timeout_secs must be greater than zero",
            ));
        }
        if self.watchdog.check_interval_ms == 0 {
            return Err(MergelineError::invalid_input(
                "watchdog.check_interval_ms must be greater than zero",
            ));
        }
        if self.watchdog.transaction_timeout_secs == 0 {
            return Err(MergelineError::invalid_input(
                "watchdog.transaction_timeout_secs must be greater than zero",
            ));
        }
        Ok(())
    }
}
