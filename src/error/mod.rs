//! Error types for the merge store client
//!
//! This module defines the error taxonomy that drives every retry decision in
//! the crate: transient execution timeouts and concurrency overload are the
//! only locally retried signals, everything else crosses the call boundary
//! unmodified with the original backend diagnostic attached.

use thiserror::Error;

/// Result type alias for merge store operations
pub type Result<T> = std::result::Result<T, MergelineError>;

/// Main error type for the merge store client
#[derive(Error, Debug)]
pub enum MergelineError {
    /// The backing store exceeded its execution budget for a single call.
    /// Retried a bounded number of times by reads and by transaction begin.
    #[error("Execution timed out during {operation}: {message}")]
    ExecutionTimeout {
        operation: &'static str,
        message: String,
    },

    /// The backing store refused to begin another merge transaction because
    /// too many are already in flight. Backed off with jitter by the begin
    /// path, which eventually proceeds unthrottled instead of failing.
    #[error("Too many concurrent merge transactions: {0}")]
    TooManyConcurrentTransactions(String),

    #[error("Merge transaction {0} not found")]
    TransactionNotFound(i64),

    #[error("Merge transaction {transaction_id} is {state}; cannot {operation}")]
    InvalidTransactionState {
        transaction_id: i64,
        state: String,
        operation: &'static str,
    },

    #[error("Operation {0} was cancelled")]
    Cancelled(&'static str),

    #[error("Payload codec error: {0}")]
    Codec(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MergelineError {
    // ========== Error Context Builders ==========

    /// Create an execution-timeout error carrying the failed operation name
    pub fn execution_timeout(operation: &'static str, message: impl Into<String>) -> Self {
        MergelineError::ExecutionTimeout {
            operation,
            message: message.into(),
        }
    }

    /// Create an overload error with backend diagnostic context
    pub fn overload(message: impl Into<String>) -> Self {
        MergelineError::TooManyConcurrentTransactions(message.into())
    }

    /// Create an invalid-input error from a message
    pub fn invalid_input(message: impl Into<String>) -> Self {
        MergelineError::InvalidInput(message.into())
    }

    /// Create a storage error from a message
    pub fn storage_msg(message: impl Into<String>) -> Self {
        MergelineError::Storage(message.into())
    }

    /// Create a codec error from a message
    pub fn codec_msg(message: impl Into<String>) -> Self {
        MergelineError::Codec(message.into())
    }

    /// Create an invalid-transaction-state error for a rejected transition
    pub fn invalid_state(
        transaction_id: i64,
        state: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        MergelineError::InvalidTransactionState {
            transaction_id,
            state: state.into(),
            operation,
        }
    }

    // ========== Classification ==========

    /// Whether the backing store signalled that a call exceeded its
    /// execution budget
    pub fn is_execution_timeout(&self) -> bool {
        matches!(self, MergelineError::ExecutionTimeout { .. })
    }

    /// Whether the backing store signalled transaction-begin overload
    pub fn is_overload(&self) -> bool {
        matches!(self, MergelineError::TooManyConcurrentTransactions(_))
    }

    /// Whether the operation observed its cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MergelineError::Cancelled(_))
    }

    /// Whether a local retry may be attempted for this error. Only the two
    /// transient backend signals qualify; everything else propagates.
    pub fn is_retriable(&self) -> bool {
        self.is_execution_timeout() || self.is_overload()
    }
}
