#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Mergeline
//!
//! Mergeline is a client/protocol layer for persisting versioned domain
//! records into a shared relational backing store. It guarantees that
//! multi-record writes become visible to readers atomically, that abandoned
//! writers are detected and reconciled, and that reads stay resilient to
//! transient backend overload -- on top of a backend that offers only
//! classic transactional primitives, not a native MVCC visibility model.
//!
//! ## The protocol
//!
//! A writer begins a merge transaction and receives a transaction id plus a
//! contiguous surrogate-id range sized for its batch. It writes records
//! tagged with that range, heartbeats while the write is in flight, and
//! commits with a success or failure outcome. The watchdog reconciles
//! transactions whose heartbeat went stale (forcing them Failed and
//! overwriting their rows with a one-byte tombstone sentinel instead of
//! deleting them) and advances the visibility watermark: the highest
//! transaction id below which every transaction is terminal. Readers never
//! observe a record above the watermark unless they explicitly opt into
//! invisible rows.
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use mergeline::{
//!     CancellationSignal, FixedSchema, MemoryMergeStore, MergeStoreConfig,
//!     MergeTransactionCoordinator, TracingAuditor,
//! };
//!
//! #[tokio::main]
//! async fn main() -> mergeline::Result<()> {
//!     let backend = Arc::new(MemoryMergeStore::new());
//!     let coordinator = MergeTransactionCoordinator::new(
//!         backend,
//!         Arc::new(TracingAuditor),
//!         Arc::new(FixedSchema(true)),
//!         MergeStoreConfig::default(),
//!     );
//!
//!     let cancel = CancellationSignal::none();
//!     let txn = coordinator.begin_transaction(10, None, &cancel).await?;
//!     // ... write records tagged with txn.sequence_range_start .. +10 ...
//!     coordinator.commit_transaction(txn.transaction_id, None, &cancel).await?;
//!     coordinator.advance_transaction_visibility(&cancel).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`coordinator`]: begin / heartbeat / commit / timeout-scan /
//!   visibility-advance state machine
//! - [`reader`]: batched, retrying reads with tombstone filtering
//! - [`history`]: transaction metadata range queries for change feeds
//! - [`watchdog`]: periodic reconciliation of abandoned transactions
//! - [`retry`]: execution-timeout retry and overload backoff policies
//! - [`backend`]: the opaque stored-procedure seam plus an in-memory store
//! - [`model`]: surrogate ids, keys, payloads, transaction states
//! - [`codec`]: gzip payload codec and the tombstone sentinel
//! - [`audit`]: best-effort event auditing
//! - [`config`]: retry, backoff and call-budget configuration
//! - [`error`]: error taxonomy and Result alias

pub mod audit;
pub mod backend;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod model;
pub mod reader;
pub mod retry;
pub mod watchdog;

pub use audit::{AuditStatus, EventAuditor, MemoryAuditor, TracingAuditor};
pub use backend::{
    HardDeleteOptions, MemoryMergeStore, MergeStoreBackend, NewMergeTransaction, ResourceRow,
    VersionRow,
};
pub use cancel::{CancellationSignal, CancellationSource};
pub use codec::{GzipPayloadCodec, PayloadCodec, TOMBSTONE_SENTINEL};
pub use config::MergeStoreConfig;
pub use coordinator::{FixedSchema, MergeTransactionCoordinator, SchemaCapabilities};
pub use error::{MergelineError, Result};
pub use history::TransactionHistoryReader;
pub use model::{
    MergeTransactionState, RawResource, ResourceDateKey, ResourceKey, ResourceTypeId,
    ResourceWrapper, SurrogateId, TransactionId, TransactionMetadata,
};
pub use reader::{ResourceReader, ResourceTypeMap, ResourceVersionMatch, StaticTypeMap};
pub use watchdog::{TransactionWatchdog, WatchdogStats};
