//! Transaction history reader
//!
//! Range queries over committed transaction metadata, consumed by change
//! feeds to learn which surrogate-id ranges are now safely readable. Pure
//! read path: the shared timeout-retry policy and nothing more.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::audit::{AuditStatus, EventAuditor};
use crate::backend::MergeStoreBackend;
use crate::cancel::CancellationSignal;
use crate::config::MergeStoreConfig;
use crate::error::{MergelineError, Result};
use crate::model::{TransactionId, TransactionMetadata};
use crate::retry::{run_remote, sleep_cancellable, RetryDecision, TimeoutRetryPolicy};

/// Reader over transaction metadata rows.
#[derive(Debug, Clone)]
pub struct TransactionHistoryReader {
    backend: Arc<dyn MergeStoreBackend>,
    auditor: Arc<dyn EventAuditor>,
    config: MergeStoreConfig,
}

impl TransactionHistoryReader {
    pub fn new(
        backend: Arc<dyn MergeStoreBackend>,
        auditor: Arc<dyn EventAuditor>,
        config: MergeStoreConfig,
    ) -> Self {
        Self {
            backend,
            auditor,
            config,
        }
    }

    /// Transaction metadata for ids in `(start_exclusive, end_inclusive]`.
    /// `end_date`, when present, keeps only transactions whose terminal
    /// timestamp (visible date, or invisible-history-removed date for
    /// tombstoned ones) is at or before it.
    pub async fn get_transactions(
        &self,
        start_exclusive: TransactionId,
        end_inclusive: TransactionId,
        end_date: Option<DateTime<Utc>>,
        cancel: &CancellationSignal,
    ) -> Result<Vec<TransactionMetadata>> {
        const OP: &str = "get_transactions";

        if end_inclusive < start_exclusive {
            return Err(MergelineError::invalid_input(format!(
                "transaction range end {end_inclusive} is below start {start_exclusive}"
            )));
        }

        let budget = self.config.budgets.read_budget(0);
        let policy = TimeoutRetryPolicy::from_config(&self.config.retry);
        let mut retries = 0u32;
        loop {
            cancel.check(OP)?;
            let started = Utc::now();
            let call = self
                .backend
                .get_transaction_range(start_exclusive, end_inclusive, end_date);
            match run_remote(OP, budget, cancel, call).await {
                Ok(rows) => return Ok(rows),
                Err(e) => match policy.evaluate(retries, &e) {
                    RetryDecision::RetryAfter(delay) => {
                        retries += 1;
                        warn!(attempt = retries, error = %e, "Transaction range query timed out; retrying");
                        self.auditor
                            .try_log_event(
                                OP,
                                AuditStatus::Warn,
                                &format!("retry {retries} after execution timeout: {e}"),
                                Some(started),
                            )
                            .await;
                        sleep_cancellable(delay, cancel, OP).await?;
                    }
                    RetryDecision::GiveUp => return Err(e),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditor;
    use crate::backend::{MemoryMergeStore, MergeStoreBackend};

    fn reader(backend: Arc<MemoryMergeStore>) -> TransactionHistoryReader {
        TransactionHistoryReader::new(
            backend,
            Arc::new(MemoryAuditor::new()),
            MergeStoreConfig::default(),
        )
    }

    #[tokio::test]
    async fn range_bounds_are_exclusive_inclusive() {
        let backend = Arc::new(MemoryMergeStore::new());
        let t1 = backend.begin_merge_transaction(1, None, false).await.unwrap();
        let t2 = backend.begin_merge_transaction(1, None, false).await.unwrap();
        let reader = reader(Arc::clone(&backend));
        let cancel = CancellationSignal::none();

        let rows = reader
            .get_transactions(t1.transaction_id, t2.transaction_id, None, &cancel)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].transaction_id, t2.transaction_id);

        let rows = reader
            .get_transactions(0, t2.transaction_id, None, &cancel)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let backend = Arc::new(MemoryMergeStore::new());
        let reader = reader(backend);
        let err = reader
            .get_transactions(10, 5, None, &CancellationSignal::none())
            .await
            .unwrap_err();
        assert!(matches!(err, MergelineError::InvalidInput(_)));
    }
}
