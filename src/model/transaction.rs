//! Merge-transaction lifecycle and metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a merge transaction. A transaction's id is also the first
/// surrogate id of the contiguous range reserved for its writes, which is why
/// transaction ids and surrogate ids share one ordering domain and the
/// visibility watermark can be expressed as a transaction id.
pub type TransactionId = i64;

/// Lifecycle state of a merge transaction.
///
/// ```text
/// Started ──► Committed ──► Visible
///    │
///    └──────► Failed ─────► Tombstoned
/// ```
///
/// Started transactions with a stale heartbeat are discovered by the timeout
/// scan and driven through Failed to Tombstoned by the reconciliation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeTransactionState {
    /// Begun; its writer may still be staging record versions.
    Started,
    /// Commit recorded; awaiting visibility advancement.
    Committed,
    /// Commit recorded a failure; its range awaits tombstoning.
    Failed,
    /// Failed range overwritten with the tombstone sentinel.
    Tombstoned,
    /// Committed and published by a visibility advance.
    Visible,
}

impl MergeTransactionState {
    /// Whether a commit outcome has been recorded. Finalized transactions
    /// accept no further writes or heartbeats.
    pub fn is_finalized(&self) -> bool {
        !matches!(self, MergeTransactionState::Started)
    }

    /// Whether the visibility watermark may move past this transaction.
    /// A Failed transaction does not qualify until its range has been
    /// tombstoned, so a rolled-back payload can never surface through the
    /// watermark gate.
    pub fn advances_watermark(&self) -> bool {
        matches!(
            self,
            MergeTransactionState::Committed
                | MergeTransactionState::Visible
                | MergeTransactionState::Tombstoned
        )
    }

    /// Whether the reconciliation loop still owes this transaction a
    /// tombstoning pass.
    pub fn needs_rollback(&self) -> bool {
        matches!(self, MergeTransactionState::Failed)
    }

    /// Whether `next` is a legal successor state.
    pub fn can_transition_to(&self, next: MergeTransactionState) -> bool {
        use MergeTransactionState::*;
        matches!(
            (self, next),
            (Started, Committed) | (Started, Failed) | (Committed, Visible) | (Failed, Tombstoned)
        )
    }
}

impl fmt::Display for MergeTransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeTransactionState::Started => "started",
            MergeTransactionState::Committed => "committed",
            MergeTransactionState::Failed => "failed",
            MergeTransactionState::Tombstoned => "tombstoned",
            MergeTransactionState::Visible => "visible",
        };
        f.write_str(name)
    }
}

/// Transaction row as seen by history consumers: when it became visible, and
/// when its invisible history was cleaned up after a rollback. Either date
/// being set means the transaction is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub transaction_id: TransactionId,
    pub visible_date: Option<DateTime<Utc>>,
    pub invisible_history_removed_date: Option<DateTime<Utc>>,
}

impl TransactionMetadata {
    /// The instant this transaction reached its terminal state, if it has.
    pub fn terminal_date(&self) -> Option<DateTime<Utc>> {
        self.visible_date.or(self.invisible_history_removed_date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use MergeTransactionState::*;
        assert!(Started.can_transition_to(Committed));
        assert!(Started.can_transition_to(Failed));
        assert!(Committed.can_transition_to(Visible));
        assert!(Failed.can_transition_to(Tombstoned));
    }

    #[test]
    fn illegal_transitions() {
        use MergeTransactionState::*;
        assert!(!Committed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Committed));
        assert!(!Visible.can_transition_to(Failed));
        assert!(!Tombstoned.can_transition_to(Visible));
        assert!(!Started.can_transition_to(Visible));
        assert!(!Started.can_transition_to(Tombstoned));
    }

    #[test]
    fn watermark_predicate_excludes_failed_until_tombstoned() {
        use MergeTransactionState::*;
        assert!(!Started.advances_watermark());
        assert!(!Failed.advances_watermark());
        assert!(Committed.advances_watermark());
        assert!(Visible.advances_watermark());
        assert!(Tombstoned.advances_watermark());
    }

    #[test]
    fn finalized_and_rollback_predicates() {
        use MergeTransactionState::*;
        assert!(!Started.is_finalized());
        assert!(Committed.is_finalized());
        assert!(Failed.is_finalized());
        assert!(Failed.needs_rollback());
        assert!(!Tombstoned.needs_rollback());
    }

    #[test]
    fn display_names() {
        assert_eq!(MergeTransactionState::Started.to_string(), "started");
        assert_eq!(MergeTransactionState::Tombstoned.to_string(), "tombstoned");
    }

    #[test]
    fn terminal_date_prefers_visible_date() {
        let now = Utc::now();
        let meta = TransactionMetadata {
            transaction_id: 10,
            visible_date: Some(now),
            invisible_history_removed_date: None,
        };
        assert_eq!(meta.terminal_date(), Some(now));

        let meta = TransactionMetadata {
            transaction_id: 11,
            visible_date: None,
            invisible_history_removed_date: Some(now),
        };
        assert_eq!(meta.terminal_date(), Some(now));

        let meta = TransactionMetadata {
            transaction_id: 12,
            visible_date: None,
            invisible_history_removed_date: None,
        };
        assert_eq!(meta.terminal_date(), None);
    }
}
