//! Shared fixtures for mergeline integration tests
//!
//! In your test file, add:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```
//!
//! Provides:
//! - `InstrumentedBackend`: wraps the in-memory store with call counters and
//!   scripted transient failures (execution timeouts, begin overload)
//! - `fast_config()`: tight retry/backoff timings so tests stay quick
//! - Row builders and a `seed_visible` helper that stages, commits and
//!   advances a batch in one step

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use mergeline::backend::{
    HardDeleteOptions, MemoryMergeStore, MergeStoreBackend, NewMergeTransaction, ResourceRow,
    VersionRow,
};
use mergeline::codec::{GzipPayloadCodec, PayloadCodec};
use mergeline::config::MergeStoreConfig;
use mergeline::model::{
    ResourceDateKey, ResourceFormat, ResourceKey, ResourceTypeId, SurrogateId, TransactionId,
    TransactionMetadata,
};
use mergeline::{MergelineError, Result};

// ============================================================================
// Configuration
// ============================================================================

/// Default configuration with timings tightened for tests: 10 ms timeout
/// retries, a 5 ms backoff base delay and a 60 ms cumulative cap.
pub fn fast_config() -> MergeStoreConfig {
    let mut config = MergeStoreConfig::default();
    config.retry.retry_delay_ms = 10;
    config.backoff.base_delay_ms = 5;
    config.backoff.cumulative_cap_ms = 60;
    config.watchdog.check_interval_ms = 50;
    config
}

// ============================================================================
// Row builders
// ============================================================================

pub fn compress(text: &str) -> Bytes {
    GzipPayloadCodec.compress(text).expect("gzip compress")
}

pub fn make_row(
    type_id: ResourceTypeId,
    id: &str,
    version: &str,
    surrogate_id: SurrogateId,
    text: &str,
) -> ResourceRow {
    ResourceRow {
        resource_type_id: type_id,
        resource_id: id.to_string(),
        version: version.to_string(),
        surrogate_id,
        is_deleted: false,
        is_history: false,
        raw_payload: compress(text),
        format: ResourceFormat::Json,
        meta_set: true,
        search_param_hash: None,
        request_method: None,
    }
}

/// Stage rows under a fresh transaction, commit it and advance visibility.
/// Row surrogate ids are assigned sequentially from the reserved range
/// start. Returns the transaction id.
pub async fn seed_visible(
    store: &MemoryMergeStore,
    rows: Vec<(ResourceTypeId, &str, &str, &str)>,
) -> TransactionId {
    let txn = store
        .begin_merge_transaction(rows.len() as u32, None, false)
        .await
        .expect("begin");
    let staged = rows
        .iter()
        .enumerate()
        .map(|(offset, (type_id, id, version, text))| {
            make_row(
                *type_id,
                id,
                version,
                txn.sequence_range_start + offset as i64,
                text,
            )
        })
        .collect();
    store
        .stage_resources(txn.transaction_id, staged)
        .expect("stage");
    store
        .commit_merge_transaction(txn.transaction_id, None)
        .await
        .expect("commit");
    store
        .advance_transaction_visibility()
        .await
        .expect("advance");
    txn.transaction_id
}

// ============================================================================
// Instrumented backend
// ============================================================================

/// Wraps the in-memory store, counting calls and injecting scripted
/// transient failures so retry behavior can be asserted without a real
/// overloaded backend.
#[derive(Debug)]
pub struct InstrumentedBackend {
    pub inner: Arc<MemoryMergeStore>,

    pub begin_calls: AtomicU32,
    pub fetch_calls: AtomicU32,
    pub version_calls: AtomicU32,
    pub heartbeat_calls: AtomicU32,
    pub hard_delete_calls: AtomicU32,

    /// Next N `fetch_resources` calls fail with an execution timeout.
    pub fail_fetches: AtomicU32,
    /// Next N throttled begin calls fail with the overload signal.
    pub fail_begin_overloads: AtomicU32,
    /// Every throttled begin call fails with the overload signal.
    pub overload_while_throttled: AtomicBool,
    /// Every heartbeat call fails.
    pub fail_heartbeats: AtomicBool,
    /// Every hard delete call fails with an execution timeout.
    pub fail_hard_deletes: AtomicBool,

    /// Throttling flag of the most recent begin call.
    pub last_begin_throttled: Mutex<Option<bool>>,
}

impl InstrumentedBackend {
    pub fn new() -> Self {
        Self::wrapping(Arc::new(MemoryMergeStore::new()))
    }

    pub fn wrapping(inner: Arc<MemoryMergeStore>) -> Self {
        Self {
            inner,
            begin_calls: AtomicU32::new(0),
            fetch_calls: AtomicU32::new(0),
            version_calls: AtomicU32::new(0),
            heartbeat_calls: AtomicU32::new(0),
            hard_delete_calls: AtomicU32::new(0),
            fail_fetches: AtomicU32::new(0),
            fail_begin_overloads: AtomicU32::new(0),
            overload_while_throttled: AtomicBool::new(false),
            fail_heartbeats: AtomicBool::new(false),
            fail_hard_deletes: AtomicBool::new(false),
            last_begin_throttled: Mutex::new(None),
        }
    }

    /// Decrement a scripted-failure counter, reporting whether this call
    /// should fail.
    fn consume(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MergeStoreBackend for InstrumentedBackend {
    async fn begin_merge_transaction(
        &self,
        resource_version_count: u32,
        heartbeat_date: Option<DateTime<Utc>>,
        throttled: bool,
    ) -> Result<NewMergeTransaction> {
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_begin_throttled.lock() = Some(throttled);
        if throttled
            && (self.overload_while_throttled.load(Ordering::SeqCst)
                || Self::consume(&self.fail_begin_overloads))
        {
            return Err(MergelineError::overload("simulated begin overload"));
        }
        self.inner
            .begin_merge_transaction(resource_version_count, heartbeat_date, throttled)
            .await
    }

    async fn put_transaction_heartbeat(&self, transaction_id: TransactionId) -> Result<()> {
        self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_heartbeats.load(Ordering::SeqCst) {
            return Err(MergelineError::storage_msg("simulated heartbeat failure"));
        }
        self.inner.put_transaction_heartbeat(transaction_id).await
    }

    async fn get_transaction_visibility(&self) -> Result<TransactionId> {
        self.inner.get_transaction_visibility().await
    }

    async fn advance_transaction_visibility(&self) -> Result<u64> {
        self.inner.advance_transaction_visibility().await
    }

    async fn get_timeout_transactions(&self, timeout: Duration) -> Result<Vec<TransactionId>> {
        self.inner.get_timeout_transactions(timeout).await
    }

    async fn commit_merge_transaction(
        &self,
        transaction_id: TransactionId,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        self.inner
            .commit_merge_transaction(transaction_id, failure_reason)
            .await
    }

    async fn delete_invisible_history(&self, transaction_id: TransactionId) -> Result<u64> {
        self.inner.delete_invisible_history(transaction_id).await
    }

    async fn fetch_resources(
        &self,
        keys: &[ResourceKey],
        include_invisible: bool,
    ) -> Result<Vec<ResourceRow>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if Self::consume(&self.fail_fetches) {
            return Err(MergelineError::execution_timeout(
                "fetch_resources",
                "simulated backend execution timeout",
            ));
        }
        self.inner.fetch_resources(keys, include_invisible).await
    }

    async fn fetch_resource_versions(&self, keys: &[ResourceDateKey]) -> Result<Vec<VersionRow>> {
        self.version_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_resource_versions(keys).await
    }

    async fn fetch_by_transaction(
        &self,
        transaction_id: TransactionId,
        include_history: bool,
    ) -> Result<Vec<ResourceRow>> {
        self.inner
            .fetch_by_transaction(transaction_id, include_history)
            .await
    }

    async fn fetch_keys_by_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<ResourceDateKey>> {
        self.inner.fetch_keys_by_transaction(transaction_id).await
    }

    async fn hard_delete_resource(
        &self,
        resource_type_id: ResourceTypeId,
        resource_id: &str,
        options: HardDeleteOptions,
    ) -> Result<u64> {
        self.hard_delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_hard_deletes.load(Ordering::SeqCst) {
            return Err(MergelineError::execution_timeout(
                "hard_delete_resource",
                "simulated backend execution timeout",
            ));
        }
        self.inner
            .hard_delete_resource(resource_type_id, resource_id, options)
            .await
    }

    async fn get_transaction_range(
        &self,
        start_exclusive: TransactionId,
        end_inclusive: TransactionId,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<Vec<TransactionMetadata>> {
        self.inner
            .get_transaction_range(start_exclusive, end_inclusive, end_date)
            .await
    }
}
