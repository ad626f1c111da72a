//! Merge-transaction coordinator
//!
//! The write-side protocol client: begin a transaction (reserving a
//! contiguous surrogate-id range), keep it alive with heartbeats, record its
//! commit outcome, and drive the reconciliation primitives (timeout scan,
//! tombstoning, visibility advance). The coordinator holds no cross-call
//! state; retry and backoff counters live inside each call, and all
//! cross-writer ordering is the backend's row locking.
//!
//! Failure posture is deliberately asymmetric: structural calls (begin,
//! commit, advance, tombstone) raise, while heartbeats are best-effort and
//! never fail the caller's write path.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
#[cfg(feature = "metrics")]
use metrics::counter;
use tracing::{debug, info, warn};

use crate::audit::{AuditStatus, EventAuditor};
use crate::backend::{MergeStoreBackend, NewMergeTransaction};
use crate::cancel::CancellationSignal;
use crate::config::MergeStoreConfig;
use crate::error::Result;
use crate::model::TransactionId;
use crate::retry::{run_remote, sleep_cancellable, OverloadBackoff, RetryDecision, TimeoutRetryPolicy};

/// Schema/version gate consumed from the embedding system: whether the
/// backend's begin procedure understands the throttling parameter.
pub trait SchemaCapabilities: Send + Sync + Debug {
    fn supports_begin_throttling(&self) -> bool;
}

/// Capability gate with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedSchema(pub bool);

impl SchemaCapabilities for FixedSchema {
    fn supports_begin_throttling(&self) -> bool {
        self.0
    }
}

/// Client for the merge-transaction protocol.
#[derive(Debug, Clone)]
pub struct MergeTransactionCoordinator {
    backend: Arc<dyn MergeStoreBackend>,
    auditor: Arc<dyn EventAuditor>,
    schema: Arc<dyn SchemaCapabilities>,
    config: MergeStoreConfig,
}

impl MergeTransactionCoordinator {
    pub fn new(
        backend: Arc<dyn MergeStoreBackend>,
        auditor: Arc<dyn EventAuditor>,
        schema: Arc<dyn SchemaCapabilities>,
        config: MergeStoreConfig,
    ) -> Self {
        Self {
            backend,
            auditor,
            schema,
            config,
        }
    }

    pub fn config(&self) -> &MergeStoreConfig {
        &self.config
    }

    /// Begin a merge transaction, reserving a contiguous surrogate-id range
    /// sized for `resource_version_count` planned writes.
    ///
    /// On the backend's overload signal the call backs off with jittered,
    /// strictly growing delays; once the cumulative cap is reached it drops
    /// the throttling flag and makes one final unthrottled attempt rather
    /// than failing the writer. Execution timeouts get the bounded
    /// fixed-delay retry shared with the read path.
    pub async fn begin_transaction(
        &self,
        resource_version_count: u32,
        heartbeat_date: Option<DateTime<Utc>>,
        cancel: &CancellationSignal,
    ) -> Result<NewMergeTransaction> {
        const OP: &str = "begin_transaction";

        let budget = self.config.budgets.control_budget();
        let policy = TimeoutRetryPolicy::from_config(&self.config.retry);
        let mut backoff = OverloadBackoff::new(&self.config.backoff);
        let mut throttled = self.schema.supports_begin_throttling();
        let mut timeout_retries = 0u32;

        loop {
            cancel.check(OP)?;
            let started = Utc::now();
            let call =
                self.backend
                    .begin_merge_transaction(resource_version_count, heartbeat_date, throttled);
            let error = match run_remote(OP, budget, cancel, call).await {
                Ok(new_transaction) => {
                    debug!(
                        transaction_id = new_transaction.transaction_id,
                        range_start = new_transaction.sequence_range_start,
                        resource_version_count,
                        throttled,
                        "Merge transaction begun"
                    );
                    return Ok(new_transaction);
                }
                Err(e) => e,
            };

            if error.is_overload() && throttled {
                match backoff.next_delay() {
                    Some(delay) => {
                        debug!(
                            delay_ms = delay.as_millis() as u64,
                            slept_ms = backoff.cumulative_slept().as_millis() as u64,
                            "Transaction begin throttled; backing off"
                        );
                        #[cfg(feature = "metrics")]
                        counter!("mergeline_begin_backoffs_total").increment(1);
                        sleep_cancellable(delay, cancel, OP).await?;
                    }
                    None => {
                        warn!(
                            slept_ms = backoff.cumulative_slept().as_millis() as u64,
                            "Backoff cap reached; proceeding with throttling disabled"
                        );
                        throttled = false;
                    }
                }
            } else if error.is_execution_timeout() {
                match policy.evaluate(timeout_retries, &error) {
                    RetryDecision::RetryAfter(delay) => {
                        timeout_retries += 1;
                        warn!(attempt = timeout_retries, error = %error, "Transaction begin timed out; retrying");
                        self.auditor
                            .try_log_event(
                                OP,
                                AuditStatus::Warn,
                                &format!("retry {timeout_retries} after execution timeout: {error}"),
                                Some(started),
                            )
                            .await;
                        sleep_cancellable(delay, cancel, OP).await?;
                    }
                    RetryDecision::GiveUp => return Err(error),
                }
            } else {
                return Err(error);
            }
        }
    }

    /// Refresh a transaction's liveness timestamp. Best-effort by contract:
    /// every failure, including cancellation, is logged and swallowed so the
    /// caller's write path is never disturbed by a liveness ping.
    ///
    /// The call budget is a third of the heartbeat period plus a small pad,
    /// keeping it clear of the backend's own default timeout.
    pub async fn put_transaction_heartbeat(
        &self,
        transaction_id: TransactionId,
        heartbeat_period: Duration,
        cancel: &CancellationSignal,
    ) -> Result<()> {
        const OP: &str = "put_transaction_heartbeat";

        let budget = self.config.budgets.heartbeat_budget(heartbeat_period);
        let call = self.backend.put_transaction_heartbeat(transaction_id);
        match run_remote(OP, budget, cancel, call).await {
            Ok(()) => debug!(transaction_id, "Transaction heartbeat recorded"),
            Err(e) => {
                warn!(transaction_id, error = %e, "Transaction heartbeat failed; continuing");
                #[cfg(feature = "metrics")]
                counter!("mergeline_heartbeat_failures_total").increment(1);
            }
        }
        Ok(())
    }

    /// Current visibility watermark transaction id.
    pub async fn get_transaction_visibility(
        &self,
        cancel: &CancellationSignal,
    ) -> Result<TransactionId> {
        const OP: &str = "get_transaction_visibility";
        cancel.check(OP)?;
        let budget = self.config.budgets.control_budget();
        run_remote(OP, budget, cancel, self.backend.get_transaction_visibility()).await
    }

    /// Raise the watermark to the highest contiguous terminal transaction
    /// id. A stateless trigger, safe under concurrent schedulers; nothing to
    /// advance returns 0.
    pub async fn advance_transaction_visibility(
        &self,
        cancel: &CancellationSignal,
    ) -> Result<u64> {
        const OP: &str = "advance_transaction_visibility";
        cancel.check(OP)?;
        let budget = self.config.budgets.control_budget();
        let affected =
            run_remote(OP, budget, cancel, self.backend.advance_transaction_visibility()).await?;
        if affected > 0 {
            info!(affected, "Advanced transaction visibility");
            #[cfg(feature = "metrics")]
            counter!("mergeline_transactions_published_total").increment(affected);
        }
        Ok(affected)
    }

    /// Started transactions whose heartbeat is older than `timeout` --
    /// candidates for forced rollback.
    pub async fn get_timeout_transactions(
        &self,
        timeout: Duration,
        cancel: &CancellationSignal,
    ) -> Result<Vec<TransactionId>> {
        const OP: &str = "get_timeout_transactions";
        cancel.check(OP)?;
        let budget = self.config.budgets.control_budget();
        run_remote(OP, budget, cancel, self.backend.get_timeout_transactions(timeout)).await
    }

    /// Record a transaction's commit outcome. A failure reason marks it
    /// Failed and its range becomes eligible for tombstoning; none marks it
    /// Committed and eligible for visibility advancement.
    pub async fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        failure_reason: Option<&str>,
        cancel: &CancellationSignal,
    ) -> Result<()> {
        const OP: &str = "commit_transaction";
        cancel.check(OP)?;
        let budget = self.config.budgets.control_budget();
        run_remote(
            OP,
            budget,
            cancel,
            self.backend
                .commit_merge_transaction(transaction_id, failure_reason),
        )
        .await?;
        match failure_reason {
            Some(reason) => info!(transaction_id, reason, "Merge transaction marked failed"),
            None => debug!(transaction_id, "Merge transaction committed"),
        }
        Ok(())
    }

    /// Overwrite a failed transaction's rows with the tombstone sentinel and
    /// record the cleanup. Rows are never deleted, preserving surrogate-id
    /// contiguity for downstream consumers. Idempotent: an already-reaped
    /// transaction returns 0.
    pub async fn delete_invisible_history(
        &self,
        transaction_id: TransactionId,
        cancel: &CancellationSignal,
    ) -> Result<u64> {
        const OP: &str = "delete_invisible_history";
        cancel.check(OP)?;
        let budget = self.config.budgets.control_budget();
        let affected = run_remote(
            OP,
            budget,
            cancel,
            self.backend.delete_invisible_history(transaction_id),
        )
        .await?;
        if affected > 0 {
            info!(transaction_id, affected, "Tombstoned invisible history");
            #[cfg(feature = "metrics")]
            counter!("mergeline_rows_tombstoned_total").increment(affected);
        }
        Ok(affected)
    }
}
