//! Resilient read path
//!
//! Batched record retrieval over the backend seam: point lookups by key,
//! current-version lookups by surrogate-addressed key, and whole-transaction
//! enumeration. Each call wraps one remote procedure in an execution budget
//! scaled by batch size; execution timeouts get a bounded fixed-delay retry
//! with an audit event per attempt, except the long transaction scans and
//! the destructive hard delete, which must fail loudly rather than risk an
//! ambiguous re-execution.
//!
//! Tombstoned ("invisible") record versions are recognized by their
//! one-byte sentinel payload and filtered from default reads; callers opt in
//! with `include_invisible` for diagnostics and recovery.

use std::fmt::Debug;
use std::sync::Arc;

use chrono::Utc;
#[cfg(feature = "metrics")]
use metrics::counter;
use tracing::{debug, info, warn};

use crate::audit::{AuditStatus, EventAuditor};
use crate::backend::{HardDeleteOptions, MergeStoreBackend, ResourceRow, VersionRow};
use crate::cancel::CancellationSignal;
use crate::config::MergeStoreConfig;
use crate::error::{MergelineError, Result};
use crate::model::surrogate;
use crate::model::{
    RawResource, ResourceDateKey, ResourceKey, ResourceTypeId, ResourceWrapper, TransactionId,
};
use crate::retry::{run_remote, sleep_cancellable, RetryDecision, TimeoutRetryPolicy};

/// Type-id to type-name mapping consumed from the embedding system.
pub trait ResourceTypeMap: Send + Sync + Debug {
    fn resource_type_id(&self, name: &str) -> Option<ResourceTypeId>;
    fn resource_type_name(&self, id: ResourceTypeId) -> Option<String>;
}

/// Fixed in-memory type map.
#[derive(Debug, Default)]
pub struct StaticTypeMap {
    entries: Vec<(ResourceTypeId, String)>,
}

impl StaticTypeMap {
    pub fn new<S, I>(entries: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = (ResourceTypeId, S)>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(id, name)| (id, name.into()))
                .collect(),
        }
    }
}

impl ResourceTypeMap for StaticTypeMap {
    fn resource_type_id(&self, name: &str) -> Option<ResourceTypeId> {
        self.entries
            .iter()
            .find(|(_, n)| n == name)
            .map(|(id, _)| *id)
    }

    fn resource_type_name(&self, id: ResourceTypeId) -> Option<String> {
        self.entries
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, name)| name.clone())
    }
}

/// Reply of a current-version lookup: the key the caller asked about plus
/// the version and payload of the resource's current visible row, letting
/// the caller detect "current differs from what I last observed" in one
/// round trip. Both fields are `None` when no current visible row exists.
#[derive(Debug, Clone)]
pub struct ResourceVersionMatch {
    pub key: ResourceDateKey,
    pub matched_version: Option<String>,
    pub matched_payload: Option<RawResource>,
}

/// Batched, retrying reader over the backend seam.
#[derive(Debug, Clone)]
pub struct ResourceReader {
    backend: Arc<dyn MergeStoreBackend>,
    auditor: Arc<dyn EventAuditor>,
    type_map: Arc<dyn ResourceTypeMap>,
    config: MergeStoreConfig,
}

impl ResourceReader {
    pub fn new(
        backend: Arc<dyn MergeStoreBackend>,
        auditor: Arc<dyn EventAuditor>,
        type_map: Arc<dyn ResourceTypeMap>,
        config: MergeStoreConfig,
    ) -> Self {
        Self {
            backend,
            auditor,
            type_map,
            config,
        }
    }

    /// Batched point lookup. An empty key list short-circuits without a
    /// remote call. Sentinel-payload rows are excluded unless
    /// `include_invisible` is set, which also bypasses the watermark gate.
    pub async fn get_by_keys(
        &self,
        keys: &[ResourceKey],
        include_invisible: bool,
        cancel: &CancellationSignal,
    ) -> Result<Vec<ResourceWrapper>> {
        const OP: &str = "get_by_keys";

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let budget = self.config.budgets.read_budget(keys.len());
        let policy = TimeoutRetryPolicy::from_config(&self.config.retry);
        let mut retries = 0u32;
        loop {
            cancel.check(OP)?;
            let started = Utc::now();
            let call = self.backend.fetch_resources(keys, include_invisible);
            match run_remote(OP, budget, cancel, call).await {
                Ok(rows) => {
                    let mut wrappers: Vec<ResourceWrapper> =
                        rows.into_iter().map(|row| self.project(row)).collect();
                    if !include_invisible {
                        wrappers.retain(|w| !w.is_invisible());
                    }
                    debug!(
                        requested = keys.len(),
                        returned = wrappers.len(),
                        include_invisible,
                        "Resources fetched"
                    );
                    return Ok(wrappers);
                }
                Err(e) => match policy.evaluate(retries, &e) {
                    RetryDecision::RetryAfter(delay) => {
                        retries += 1;
                        warn!(attempt = retries, error = %e, "Resource fetch timed out; retrying");
                        #[cfg(feature = "metrics")]
                        counter!("mergeline_read_retries_total").increment(1);
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

    /// Current-version lookup for each surrogate-addressed key, one reply
    /// per input. Same budget and retry policy as
    /// [`ResourceReader::get_by_keys`].
    pub async fn get_versions(
        &self,
        keys: &[ResourceDateKey],
        cancel: &CancellationSignal,
    ) -> Result<Vec<ResourceVersionMatch>> {
        const OP: &str = "get_versions";

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let budget = self.config.budgets.read_budget(keys.len());
        let policy = TimeoutRetryPolicy::from_config(&self.config.retry);
        let mut retries = 0u32;
        loop {
            cancel.check(OP)?;
            let started = Utc::now();
            let call = self.backend.fetch_resource_versions(keys);
            match run_remote(OP, budget, cancel, call).await {
                Ok(rows) => return Ok(rows.into_iter().map(project_version).collect()),
                Err(e) => match policy.evaluate(retries, &e) {
                    RetryDecision::RetryAfter(delay) => {
                        retries += 1;
                        warn!(attempt = retries, error = %e, "Version lookup timed out; retrying");
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

    /// Every record a transaction wrote. Runs under the long scan budget and
    /// is never retried; used by log-style consumers.
    pub async fn get_by_transaction(
        &self,
        transaction_id: TransactionId,
        include_history: bool,
        cancel: &CancellationSignal,
    ) -> Result<Vec<ResourceWrapper>> {
        const OP: &str = "get_by_transaction";
        cancel.check(OP)?;
        let budget = self.config.budgets.transaction_scan_budget();
        let call = self.backend.fetch_by_transaction(transaction_id, include_history);
        let rows = run_remote(OP, budget, cancel, call).await?;
        Ok(rows.into_iter().map(|row| self.project(row)).collect())
    }

    /// Keys of every record a transaction wrote, for the crash-recovery
    /// tombstoning path. Long scan budget, never retried.
    pub async fn get_keys_by_transaction(
        &self,
        transaction_id: TransactionId,
        cancel: &CancellationSignal,
    ) -> Result<Vec<ResourceDateKey>> {
        const OP: &str = "get_keys_by_transaction";
        cancel.check(OP)?;
        let budget = self.config.budgets.transaction_scan_budget();
        let call = self.backend.fetch_keys_by_transaction(transaction_id);
        run_remote(OP, budget, cancel, call).await
    }

    /// Irreversibly remove a resource's rows. Destructive, so never retried:
    /// an ambiguous re-execution is worse than a loud failure.
    pub async fn hard_delete(
        &self,
        resource_type_id: ResourceTypeId,
        resource_id: &str,
        keep_current_version: bool,
        change_capture_enabled: bool,
        cancel: &CancellationSignal,
    ) -> Result<()> {
        const OP: &str = "hard_delete";

        if resource_id.is_empty() {
            return Err(MergelineError::invalid_input(
                "hard delete requires a resource id",
            ));
        }
        cancel.check(OP)?;
        let budget = self.config.budgets.control_budget();
        let call = self.backend.hard_delete_resource(
            resource_type_id,
            resource_id,
            HardDeleteOptions {
                keep_current_version,
                change_capture_enabled,
            },
        );
        let affected = run_remote(OP, budget, cancel, call).await?;
        info!(
            resource_type_id,
            resource_id, affected, keep_current_version, change_capture_enabled,
            "Resource hard deleted"
        );
        Ok(())
    }

    /// Project a stored row into the read-side wrapper: map the type name,
    /// recognize the sentinel, derive last-modified from the surrogate id.
    fn project(&self, row: ResourceRow) -> ResourceWrapper {
        let resource_type_name = self
            .type_map
            .resource_type_name(row.resource_type_id)
            .unwrap_or_else(|| row.resource_type_id.to_string());
        ResourceWrapper {
            resource_id: row.resource_id,
            version: row.version,
            resource_type_id: row.resource_type_id,
            resource_type_name,
            raw_resource: RawResource::from_stored(row.raw_payload, row.format, row.meta_set),
            request_method: row.request_method,
            last_modified: surrogate::last_modified(row.surrogate_id),
            is_deleted: row.is_deleted,
            is_history: row.is_history,
            search_param_hash: row.search_param_hash,
            surrogate_id: row.surrogate_id,
        }
    }
}

fn project_version(row: VersionRow) -> ResourceVersionMatch {
    let matched_payload = row
        .matched_payload
        .map(|payload| RawResource::from_stored(payload, row.matched_format, true));
    ResourceVersionMatch {
        key: row.key,
        matched_version: row.matched_version,
        matched_payload,
    }
}
