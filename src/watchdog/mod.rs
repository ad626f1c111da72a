//! Transaction watchdog
//!
//! Periodic reconciliation of abandoned writers: scan for Started
//! transactions with a stale heartbeat, drive each one Failed and tombstone
//! its range, then advance the visibility watermark. Every step is
//! idempotent, so the watchdog is safe to run concurrently with writers and
//! with another watchdog; per-transaction failures are logged and counted,
//! never aborting the cycle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[cfg(feature = "metrics")]
use metrics::counter;
use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::cancel::CancellationSignal;
use crate::config::WatchdogConfig;
use crate::coordinator::MergeTransactionCoordinator;

/// Reason recorded against transactions the watchdog rolls back.
const TIMEOUT_FAILURE_REASON: &str = "transaction heartbeat expired";

/// Counters of reconciliation activity.
#[derive(Debug, Default)]
pub struct WatchdogStats {
    /// Completed reconciliation cycles
    pub scans_total: AtomicU64,
    /// Stale transactions driven to Failed
    pub transactions_reaped: AtomicU64,
    /// Rows overwritten with the tombstone sentinel
    pub rows_tombstoned: AtomicU64,
    /// Transactions newly covered by the watermark
    pub transactions_published: AtomicU64,
    /// Per-step failures that were logged and skipped
    pub errors_total: AtomicU64,
}

impl WatchdogStats {
    /// (scans, reaped, rows tombstoned, published, errors)
    pub fn get_stats(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.scans_total.load(Ordering::Relaxed),
            self.transactions_reaped.load(Ordering::Relaxed),
            self.rows_tombstoned.load(Ordering::Relaxed),
            self.transactions_published.load(Ordering::Relaxed),
            self.errors_total.load(Ordering::Relaxed),
        )
    }
}

/// Background reconciliation task over a [`MergeTransactionCoordinator`].
#[derive(Debug)]
pub struct TransactionWatchdog {
    coordinator: MergeTransactionCoordinator,
    config: WatchdogConfig,
    stats: WatchdogStats,
    shutdown: AtomicBool,
    check_notify: Notify,
}

impl TransactionWatchdog {
    pub fn new(coordinator: MergeTransactionCoordinator, config: WatchdogConfig) -> Self {
        Self {
            coordinator,
            config,
            stats: WatchdogStats::default(),
            shutdown: AtomicBool::new(false),
            check_notify: Notify::new(),
        }
    }

    /// Spawn the periodic reconciliation loop.
    pub fn start(self: &Arc<Self>) {
        let watchdog = Arc::clone(self);
        let check_interval_ms = watchdog.config.check_interval_ms;

        tokio::spawn(async move {
            let mut check_interval = interval(watchdog.config.check_interval());
            check_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(interval_ms = check_interval_ms, "Transaction watchdog started");

            loop {
                tokio::select! {
                    _ = check_interval.tick() => {
                        if watchdog.shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        watchdog.run_cycle().await;
                    }
                    _ = watchdog.check_notify.notified() => {
                        if watchdog.shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        watchdog.run_cycle().await;
                    }
                }
            }

            info!("Transaction watchdog stopped");
        });
    }

    /// One reconciliation cycle: scan, reap, tombstone, advance. Public so
    /// embedders and tests can reconcile synchronously.
    pub async fn run_cycle(&self) {
        let cancel = CancellationSignal::none();
        self.stats.scans_total.fetch_add(1, Ordering::Relaxed);

        let stale = match self
            .coordinator
            .get_timeout_transactions(self.config.transaction_timeout(), &cancel)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Timeout scan failed");
                self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if !stale.is_empty() {
            info!(count = stale.len(), "Reaping stale merge transactions");
        }

        for transaction_id in stale {
            match self
                .coordinator
                .commit_transaction(transaction_id, Some(TIMEOUT_FAILURE_REASON), &cancel)
                .await
            {
                Ok(()) => {
                    self.stats.transactions_reaped.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "metrics")]
                    counter!("mergeline_transactions_reaped_total").increment(1);
                }
                Err(e) => {
                    // Likely lost a race with the writer or another watchdog.
                    debug!(transaction_id, error = %e, "Could not mark stale transaction failed");
                    self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            match self
                .coordinator
                .delete_invisible_history(transaction_id, &cancel)
                .await
            {
                Ok(rows) => {
                    self.stats.rows_tombstoned.fetch_add(rows, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(transaction_id, error = %e, "Tombstoning failed; will retry next cycle");
                    self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        match self.coordinator.advance_transaction_visibility(&cancel).await {
            Ok(affected) => {
                self.stats
                    .transactions_published
                    .fetch_add(affected, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(error = %e, "Visibility advance failed");
                self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Force an immediate reconciliation cycle on the background task.
    pub fn trigger_check(&self) {
        self.check_notify.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.check_notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &WatchdogStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditor;
    use crate::backend::{MemoryMergeStore, MergeStoreBackend};
    use crate::config::MergeStoreConfig;
    use crate::coordinator::FixedSchema;
    use chrono::Utc;

    fn watchdog(backend: Arc<MemoryMergeStore>) -> TransactionWatchdog {
        let config = MergeStoreConfig::default();
        let coordinator = MergeTransactionCoordinator::new(
            backend,
            Arc::new(MemoryAuditor::new()),
            Arc::new(FixedSchema(true)),
            config.clone(),
        );
        TransactionWatchdog::new(coordinator, config.watchdog)
    }

    #[tokio::test]
    async fn cycle_reaps_stale_and_advances() {
        let backend = Arc::new(MemoryMergeStore::new());
        let stale_heartbeat = Utc::now() - chrono::Duration::hours(1);
        let txn = backend
            .begin_merge_transaction(1, Some(stale_heartbeat), false)
            .await
            .unwrap();

        let watchdog = watchdog(Arc::clone(&backend));
        watchdog.run_cycle().await;

        let (scans, reaped, _, published, errors) = watchdog.stats().get_stats();
        assert_eq!(scans, 1);
        assert_eq!(reaped, 1);
        assert_eq!(published, 1);
        assert_eq!(errors, 0);
        assert_eq!(
            backend.get_transaction_visibility().await.unwrap(),
            txn.transaction_id
        );

        // A second cycle finds nothing to do.
        watchdog.run_cycle().await;
        let (_, reaped, _, published, errors) = watchdog.stats().get_stats();
        assert_eq!(reaped, 1);
        assert_eq!(published, 1);
        assert_eq!(errors, 0);
    }

    #[tokio::test]
    async fn live_transactions_are_left_alone() {
        let backend = Arc::new(MemoryMergeStore::new());
        let txn = backend.begin_merge_transaction(1, None, false).await.unwrap();

        let watchdog = watchdog(Arc::clone(&backend));
        watchdog.run_cycle().await;

        let (_, reaped, _, _, _) = watchdog.stats().get_stats();
        assert_eq!(reaped, 0);
        // Still able to commit normally afterwards.
        backend
            .commit_merge_transaction(txn.transaction_id, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_flag_round_trips() {
        let backend = Arc::new(MemoryMergeStore::new());
        let watchdog = Arc::new(watchdog(backend));
        assert!(!watchdog.is_shutdown());
        watchdog.shutdown();
        assert!(watchdog.is_shutdown());
    }
}
