//! In-memory merge store
//!
//! A complete in-process implementation of the backend seam, used by tests
//! and by embedders that do not need a shared relational store. One mutex
//! guards the whole state; the protocol semantics (contiguous surrogate
//! allocation, heartbeat scan, tombstone overwrite, contiguity-respecting
//! visibility advance, watermark-gated reads) match what the stored
//! procedures of a production backend provide.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::codec;
use crate::error::{MergelineError, Result};
use crate::model::surrogate::{self, MAX_SEQUENCE};
use crate::model::{
    MergeTransactionState, ResourceDateKey, ResourceKey, ResourceTypeId, SurrogateId,
    TransactionId, TransactionMetadata,
};

use super::{
    HardDeleteOptions, MergeStoreBackend, NewMergeTransaction, ResourceRow, VersionRow,
};

/// Tuning knobs of the in-memory store.
#[derive(Debug, Clone)]
pub struct MemoryStoreOptions {
    /// Started-transaction count above which a throttled begin call is
    /// refused with the overload signal. Unthrottled calls never hit it.
    pub max_started_transactions: usize,
}

impl Default for MemoryStoreOptions {
    fn default() -> Self {
        Self {
            max_started_transactions: 64,
        }
    }
}

#[derive(Debug, Clone)]
struct TransactionEntry {
    state: MergeTransactionState,
    range_len: i64,
    heartbeat: DateTime<Utc>,
    visible_date: Option<DateTime<Utc>>,
    invisible_history_removed_date: Option<DateTime<Utc>>,
}

type RowKey = (ResourceTypeId, String, SurrogateId);

#[derive(Debug, Default)]
struct StoreState {
    /// Keyed by transaction id, which is also the first surrogate id of the
    /// transaction's reserved range.
    transactions: BTreeMap<TransactionId, TransactionEntry>,
    rows: BTreeMap<RowKey, ResourceRow>,
    watermark: TransactionId,
    clock_millis: i64,
    clock_sequence: i64,
}

impl StoreState {
    /// Transaction owning a surrogate id, found by range containment.
    fn owner_of(&self, surrogate_id: SurrogateId) -> Option<(TransactionId, &TransactionEntry)> {
        let (&id, entry) = self.transactions.range(..=surrogate_id).next_back()?;
        if surrogate_id < id + entry.range_len {
            Some((id, entry))
        } else {
            None
        }
    }

    /// Whether a row may be returned by a default (watermark-gated) read.
    fn row_visible(&self, row: &ResourceRow) -> bool {
        match self.owner_of(row.surrogate_id) {
            Some((id, entry)) => {
                entry.state == MergeTransactionState::Visible || id <= self.watermark
            }
            // Rows staged outside any known transaction never surface.
            None => false,
        }
    }

    /// Rows of one resource, in surrogate order.
    fn resource_rows(
        &self,
        resource_type_id: ResourceTypeId,
        resource_id: &str,
    ) -> impl DoubleEndedIterator<Item = &ResourceRow> + '_ {
        let start = (resource_type_id, resource_id.to_string(), SurrogateId::MIN);
        let end = (resource_type_id, resource_id.to_string(), SurrogateId::MAX);
        self.rows.range(start..=end).map(|(_, row)| row)
    }

    /// The resource's current visible row: the highest-surrogate visible row
    /// whose payload is not the tombstone sentinel.
    fn current_visible_row(
        &self,
        resource_type_id: ResourceTypeId,
        resource_id: &str,
    ) -> Option<&ResourceRow> {
        self.resource_rows(resource_type_id, resource_id)
            .filter(|row| self.row_visible(row) && !codec::is_tombstone(&row.raw_payload))
            .next_back()
    }
}

/// In-process reference backend.
#[derive(Debug, Default)]
pub struct MemoryMergeStore {
    options: MemoryStoreOptions,
    state: Mutex<StoreState>,
}

impl MemoryMergeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: MemoryStoreOptions) -> Self {
        Self {
            options,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Stage record rows under a Started transaction, standing in for the
    /// external write path. Every row's surrogate id must lie inside the
    /// transaction's reserved range.
    pub fn stage_resources(
        &self,
        transaction_id: TransactionId,
        rows: Vec<ResourceRow>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .transactions
            .get(&transaction_id)
            .ok_or(MergelineError::TransactionNotFound(transaction_id))?;
        if entry.state != MergeTransactionState::Started {
            return Err(MergelineError::invalid_state(
                transaction_id,
                entry.state.to_string(),
                "stage resources",
            ));
        }
        let range_end = transaction_id + entry.range_len;
        for row in &rows {
            if row.surrogate_id < transaction_id || row.surrogate_id >= range_end {
                return Err(MergelineError::invalid_input(format!(
                    "surrogate id {} is outside transaction {}'s range [{}, {})",
                    row.surrogate_id, transaction_id, transaction_id, range_end
                )));
            }
        }
        for row in rows {
            let key = (
                row.resource_type_id,
                row.resource_id.clone(),
                row.surrogate_id,
            );
            state.rows.insert(key, row);
        }
        Ok(())
    }

    /// Allocate a contiguous surrogate range. The clock never sleeps: when a
    /// millisecond tick's sequence space is exhausted it advances logically,
    /// so monotonicity is the contract, wall-clock alignment is not.
    fn allocate_range(state: &mut StoreState, count: i64) -> SurrogateId {
        let now_millis = Utc::now().timestamp_millis();
        if now_millis > state.clock_millis {
            state.clock_millis = now_millis;
            state.clock_sequence = 0;
        }
        if state.clock_sequence + count > MAX_SEQUENCE + 1 {
            state.clock_millis += 1;
            state.clock_sequence = 0;
        }
        let first = surrogate::from_parts(state.clock_millis, state.clock_sequence);
        state.clock_sequence += count;
        first
    }
}

#[async_trait]
impl MergeStoreBackend for MemoryMergeStore {
    async fn begin_merge_transaction(
        &self,
        resource_version_count: u32,
        heartbeat_date: Option<DateTime<Utc>>,
        throttled: bool,
    ) -> Result<NewMergeTransaction> {
        let count = i64::from(resource_version_count.max(1));
        if count > MAX_SEQUENCE + 1 {
            return Err(MergelineError::invalid_input(format!(
                "resource version count {count} exceeds the per-transaction range limit of {}",
                MAX_SEQUENCE + 1
            )));
        }

        let mut state = self.state.lock();
        if throttled {
            let started = state
                .transactions
                .values()
                .filter(|t| t.state == MergeTransactionState::Started)
                .count();
            if started >= self.options.max_started_transactions {
                return Err(MergelineError::overload(format!(
                    "{started} merge transactions already in flight"
                )));
            }
        }

        let first = Self::allocate_range(&mut state, count);
        state.transactions.insert(
            first,
            TransactionEntry {
                state: MergeTransactionState::Started,
                range_len: count,
                heartbeat: heartbeat_date.unwrap_or_else(Utc::now),
                visible_date: None,
                invisible_history_removed_date: None,
            },
        );
        Ok(NewMergeTransaction {
            transaction_id: first,
            sequence_range_start: first,
        })
    }

    async fn put_transaction_heartbeat(&self, transaction_id: TransactionId) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .transactions
            .get_mut(&transaction_id)
            .ok_or(MergelineError::TransactionNotFound(transaction_id))?;
        if entry.state != MergeTransactionState::Started {
            return Err(MergelineError::invalid_state(
                transaction_id,
                entry.state.to_string(),
                "heartbeat",
            ));
        }
        entry.heartbeat = Utc::now();
        Ok(())
    }

    async fn get_transaction_visibility(&self) -> Result<TransactionId> {
        Ok(self.state.lock().watermark)
    }

    async fn advance_transaction_visibility(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let newly: Vec<TransactionId> = {
            let mut ids = Vec::new();
            for (&id, entry) in state
                .transactions
                .range((Bound::Excluded(state.watermark), Bound::Unbounded))
            {
                if !entry.state.advances_watermark() {
                    break;
                }
                ids.push(id);
            }
            ids
        };

        let now = Utc::now();
        for &id in &newly {
            if let Some(entry) = state.transactions.get_mut(&id) {
                if entry.state == MergeTransactionState::Committed {
                    entry.state = MergeTransactionState::Visible;
                    entry.visible_date = Some(now);
                }
            }
        }
        if let Some(&last) = newly.last() {
            state.watermark = last;
        }
        Ok(newly.len() as u64)
    }

    async fn get_timeout_transactions(&self, timeout: Duration) -> Result<Vec<TransactionId>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout)
                .map_err(|e| MergelineError::invalid_input(format!("timeout out of range: {e}")))?;
        let state = self.state.lock();
        Ok(state
            .transactions
            .iter()
            .filter(|(_, entry)| {
                entry.state == MergeTransactionState::Started && entry.heartbeat < cutoff
            })
            .map(|(&id, _)| id)
            .collect())
    }

    async fn commit_merge_transaction(
        &self,
        transaction_id: TransactionId,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        use MergeTransactionState::*;
        let desired = if failure_reason.is_some() {
            Failed
        } else {
            Committed
        };

        let mut state = self.state.lock();
        let entry = state
            .transactions
            .get_mut(&transaction_id)
            .ok_or(MergelineError::TransactionNotFound(transaction_id))?;
        match (entry.state, desired) {
            (Started, _) => {
                entry.state = desired;
                Ok(())
            }
            // Idempotent re-commit with the same outcome, including outcomes
            // the reconciliation already advanced past.
            (Committed, Committed) | (Visible, Committed) => Ok(()),
            (Failed, Failed) | (Tombstoned, Failed) => Ok(()),
            (current, _) => Err(MergelineError::invalid_state(
                transaction_id,
                current.to_string(),
                "commit",
            )),
        }
    }

    async fn delete_invisible_history(&self, transaction_id: TransactionId) -> Result<u64> {
        let mut state = self.state.lock();
        let entry = state
            .transactions
            .get(&transaction_id)
            .ok_or(MergelineError::TransactionNotFound(transaction_id))?;
        match entry.state {
            MergeTransactionState::Tombstoned => Ok(0),
            MergeTransactionState::Failed => {
                let range_end = transaction_id + entry.range_len;
                let mut affected = 0u64;
                for row in state.rows.values_mut() {
                    if row.surrogate_id >= transaction_id && row.surrogate_id < range_end {
                        row.raw_payload = codec::tombstone_payload();
                        affected += 1;
                    }
                }
                let entry = state
                    .transactions
                    .get_mut(&transaction_id)
                    .ok_or(MergelineError::TransactionNotFound(transaction_id))?;
                entry.state = MergeTransactionState::Tombstoned;
                entry.invisible_history_removed_date = Some(Utc::now());
                Ok(affected)
            }
            other => Err(MergelineError::invalid_state(
                transaction_id,
                other.to_string(),
                "delete invisible history",
            )),
        }
    }

    async fn fetch_resources(
        &self,
        keys: &[ResourceKey],
        include_invisible: bool,
    ) -> Result<Vec<ResourceRow>> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for key in keys {
            let matched = match &key.version {
                Some(version) => state
                    .resource_rows(key.resource_type_id, &key.resource_id)
                    .filter(|row| {
                        &row.version == version
                            && (include_invisible || state.row_visible(row))
                    })
                    .next_back(),
                None => {
                    if include_invisible {
                        state
                            .resource_rows(key.resource_type_id, &key.resource_id)
                            .next_back()
                    } else {
                        state.current_visible_row(key.resource_type_id, &key.resource_id)
                    }
                }
            };
            if let Some(row) = matched {
                out.push(row.clone());
            }
        }
        Ok(out)
    }

    async fn fetch_resource_versions(&self, keys: &[ResourceDateKey]) -> Result<Vec<VersionRow>> {
        let state = self.state.lock();
        Ok(keys
            .iter()
            .map(|key| {
                match state.current_visible_row(key.resource_type_id, &key.resource_id) {
                    Some(row) => VersionRow {
                        key: key.clone(),
                        matched_version: Some(row.version.clone()),
                        matched_payload: Some(row.raw_payload.clone()),
                        matched_format: row.format,
                    },
                    None => VersionRow {
                        key: key.clone(),
                        matched_version: None,
                        matched_payload: None,
                        matched_format: Default::default(),
                    },
                }
            })
            .collect())
    }

    async fn fetch_by_transaction(
        &self,
        transaction_id: TransactionId,
        include_history: bool,
    ) -> Result<Vec<ResourceRow>> {
        let state = self.state.lock();
        let entry = state
            .transactions
            .get(&transaction_id)
            .ok_or(MergelineError::TransactionNotFound(transaction_id))?;
        let range_end = transaction_id + entry.range_len;
        let mut rows: Vec<ResourceRow> = state
            .rows
            .values()
            .filter(|row| {
                row.surrogate_id >= transaction_id
                    && row.surrogate_id < range_end
                    && (include_history || !row.is_history)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.surrogate_id);
        Ok(rows)
    }

    async fn fetch_keys_by_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<ResourceDateKey>> {
        let rows = self.fetch_by_transaction(transaction_id, true).await?;
        Ok(rows
            .into_iter()
            .map(|row| ResourceDateKey {
                resource_type_id: row.resource_type_id,
                resource_id: row.resource_id,
                surrogate_id: row.surrogate_id,
                version: Some(row.version),
                is_deleted: row.is_deleted,
            })
            .collect())
    }

    async fn hard_delete_resource(
        &self,
        resource_type_id: ResourceTypeId,
        resource_id: &str,
        options: HardDeleteOptions,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        let mut targets: Vec<RowKey> = state
            .resource_rows(resource_type_id, resource_id)
            .map(|row| {
                (
                    row.resource_type_id,
                    row.resource_id.clone(),
                    row.surrogate_id,
                )
            })
            .collect();
        if options.keep_current_version {
            // The highest surrogate is the current version; keep it.
            targets.pop();
        }

        let affected = targets.len() as u64;
        if options.change_capture_enabled {
            for key in targets {
                if let Some(row) = state.rows.get_mut(&key) {
                    row.raw_payload = codec::tombstone_payload();
                    row.is_deleted = true;
                }
            }
        } else {
            for key in targets {
                state.rows.remove(&key);
            }
        }
        Ok(affected)
    }

    async fn get_transaction_range(
        &self,
        start_exclusive: TransactionId,
        end_inclusive: TransactionId,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<Vec<TransactionMetadata>> {
        let state = self.state.lock();
        Ok(state
            .transactions
            .range((Bound::Excluded(start_exclusive), Bound::Included(end_inclusive)))
            .map(|(&id, entry)| TransactionMetadata {
                transaction_id: id,
                visible_date: entry.visible_date,
                invisible_history_removed_date: entry.invisible_history_removed_date,
            })
            .filter(|meta| match end_date {
                Some(cutoff) => meta.terminal_date().is_some_and(|d| d <= cutoff),
                None => true,
            })
            .collect())
    }
}
