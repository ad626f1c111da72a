//! Cooperative cancellation for remote store operations
//!
//! Every operation in this crate accepts a [`CancellationSignal`]. Observing
//! the signal aborts the in-flight remote call (the select race drops the
//! future) and unwinds any retry loop before another attempt is made. A
//! [`CancellationSource`] is held by the caller; any number of cloned signals
//! can be derived from it.

use tokio::sync::watch;

use crate::error::{MergelineError, Result};

/// Owning side of a cancellation channel.
#[derive(Debug)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl CancellationSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Derive a signal observing this source.
    pub fn signal(&self) -> CancellationSignal {
        CancellationSignal {
            rx: Some(self.tx.subscribe()),
        }
    }

    /// Request cancellation. Idempotent; all derived signals observe it.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observing side of a cancellation channel, passed into every operation.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancellationSignal {
    /// A signal that can never be cancelled, for callers without a
    /// cancellation requirement.
    pub fn none() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Fail fast with [`MergelineError::Cancelled`] if cancellation has been
    /// requested. Called at the top of every retry loop iteration.
    pub fn check(&self, operation: &'static str) -> Result<()> {
        if self.is_cancelled() {
            Err(MergelineError::Cancelled(operation))
        } else {
            Ok(())
        }
    }

    /// Resolve once cancellation is requested. Pends forever on a signal that
    /// can no longer be cancelled, which makes it safe to race in a select
    /// against the actual work.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            std::future::pending::<()>().await;
            return;
        };
        let mut rx = rx.clone();
        if *rx.borrow() {
            return;
        }
        loop {
            if rx.changed().await.is_err() {
                // Source dropped without cancelling: cancellation can no
                // longer happen.
                std::future::pending::<()>().await;
            }
            if *rx.borrow() {
                return;
            }
        }
    }
}
