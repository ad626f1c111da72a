//! Backing-store procedure seam
//!
//! The backing store exposes its merge-transaction and record procedures as
//! atomic single-call operations with row-level locking underneath. This
//! module defines the trait those calls go through, plus the row types the
//! procedures exchange. Everything above this seam treats the procedures as
//! opaque: retry, budgets and visibility filtering live in the callers, while
//! all cross-writer coordination (range allocation, watermark ordering) is
//! the backend's job.
//!
//! One in-process implementation ships with the crate:
//!
//! - [`MemoryMergeStore`]: full protocol semantics over a single mutex, used
//!   by tests and embedders

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    ResourceDateKey, ResourceFormat, ResourceKey, ResourceTypeId, SurrogateId, TransactionId,
    TransactionMetadata, WriteMethod,
};

mod memory;

pub use memory::{MemoryMergeStore, MemoryStoreOptions};

/// One stored record version as the backend returns it. Payload bytes are
/// carried raw; sentinel detection and decompression happen in the caller.
#[derive(Debug, Clone)]
pub struct ResourceRow {
    pub resource_type_id: ResourceTypeId,
    pub resource_id: String,
    pub version: String,
    pub surrogate_id: SurrogateId,
    pub is_deleted: bool,
    pub is_history: bool,
    pub raw_payload: Bytes,
    pub format: ResourceFormat,
    pub meta_set: bool,
    pub search_param_hash: Option<String>,
    pub request_method: Option<WriteMethod>,
}

/// Reply row of a current-version lookup: the key the caller asked about plus
/// the version and payload of the resource's current visible row, when one
/// exists.
#[derive(Debug, Clone)]
pub struct VersionRow {
    pub key: ResourceDateKey,
    pub matched_version: Option<String>,
    pub matched_payload: Option<Bytes>,
    pub matched_format: ResourceFormat,
}

/// Reply of a successful transaction begin. The backend's output parameters
/// (transaction id, first reserved sequence value) modeled as one struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewMergeTransaction {
    pub transaction_id: TransactionId,
    /// First surrogate id of the contiguous range reserved for this
    /// transaction's writes.
    pub sequence_range_start: SurrogateId,
}

/// Flags of a hard delete.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardDeleteOptions {
    /// Delete only history rows, leaving the current version in place.
    pub keep_current_version: bool,
    /// Preserve row skeletons as tombstones so change-feed consumers observe
    /// the deletion; without it, rows are removed outright.
    pub change_capture_enabled: bool,
}

/// The opaque stored-procedure seam.
///
/// Every method maps to one atomic backend call. Implementations signal
/// execution-budget overruns with [`MergelineError::ExecutionTimeout`] and
/// begin-call overload with [`MergelineError::TooManyConcurrentTransactions`];
/// those are the only two errors the callers retry.
///
/// [`MergelineError::ExecutionTimeout`]: crate::error::MergelineError::ExecutionTimeout
/// [`MergelineError::TooManyConcurrentTransactions`]: crate::error::MergelineError::TooManyConcurrentTransactions
#[async_trait]
pub trait MergeStoreBackend: Send + Sync + Debug {
    /// Create a Started transaction and reserve a contiguous surrogate-id
    /// range sized for `resource_version_count` planned writes.
    ///
    /// `heartbeat_date` seeds the liveness timestamp (defaults to now);
    /// `throttled` asks the backend to enforce its concurrent-begin limit.
    async fn begin_merge_transaction(
        &self,
        resource_version_count: u32,
        heartbeat_date: Option<DateTime<Utc>>,
        throttled: bool,
    ) -> Result<NewMergeTransaction>;

    /// Refresh the liveness timestamp of a Started transaction.
    async fn put_transaction_heartbeat(&self, transaction_id: TransactionId) -> Result<()>;

    /// Current visibility watermark: the highest transaction id such that
    /// every transaction at or below it is terminal.
    async fn get_transaction_visibility(&self) -> Result<TransactionId>;

    /// Raise the watermark to the highest contiguous terminal transaction id.
    ///
    /// Returns how many transactions were newly published. Safe under
    /// concurrent callers; nothing to advance returns 0.
    async fn advance_transaction_visibility(&self) -> Result<u64>;

    /// Started transactions whose heartbeat is older than `timeout`.
    async fn get_timeout_transactions(&self, timeout: Duration) -> Result<Vec<TransactionId>>;

    /// Record a transaction's commit outcome. A failure reason marks the
    /// transaction Failed (range eligible for tombstoning); none marks it
    /// Committed (eligible for visibility advancement).
    async fn commit_merge_transaction(
        &self,
        transaction_id: TransactionId,
        failure_reason: Option<&str>,
    ) -> Result<()>;

    /// Overwrite each row of a Failed transaction's range with the tombstone
    /// sentinel and record the cleanup date. Rows are never deleted; the
    /// surrogate sequence stays contiguous. Already-tombstoned transactions
    /// are a no-op returning 0.
    async fn delete_invisible_history(&self, transaction_id: TransactionId) -> Result<u64>;

    /// Batched point lookup. `include_invisible` bypasses the watermark gate
    /// and returns sentinel rows.
    async fn fetch_resources(
        &self,
        keys: &[ResourceKey],
        include_invisible: bool,
    ) -> Result<Vec<ResourceRow>>;

    /// Current-version lookup for each surrogate-addressed key, one reply row
    /// per input in order.
    async fn fetch_resource_versions(&self, keys: &[ResourceDateKey]) -> Result<Vec<VersionRow>>;

    /// Every row written by one transaction, history rows included on
    /// request. Not watermark-gated; used for recovery and change feeds.
    async fn fetch_by_transaction(
        &self,
        transaction_id: TransactionId,
        include_history: bool,
    ) -> Result<Vec<ResourceRow>>;

    /// Keys-only variant of [`fetch_by_transaction`], for the crash-recovery
    /// tombstoning path.
    ///
    /// [`fetch_by_transaction`]: MergeStoreBackend::fetch_by_transaction
    async fn fetch_keys_by_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<ResourceDateKey>>;

    /// Irreversibly remove a resource's rows. Returns how many rows were
    /// affected.
    async fn hard_delete_resource(
        &self,
        resource_type_id: ResourceTypeId,
        resource_id: &str,
        options: HardDeleteOptions,
    ) -> Result<u64>;

    /// Transaction metadata for ids in `(start_exclusive, end_inclusive]`.
    /// `end_date`, when present, keeps only transactions whose terminal
    /// timestamp is at or before it.
    async fn get_transaction_range(
        &self,
        start_exclusive: TransactionId,
        end_inclusive: TransactionId,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<Vec<TransactionMetadata>>;
}
