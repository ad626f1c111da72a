//! Best-effort audit events for retry and reconciliation activity
//!
//! The retry paths record an event each time a backend execution timeout
//! forces another attempt, and the watchdog records what it reaped. Auditing
//! is strictly best-effort: implementations swallow their own failures, and
//! no operation ever fails because its audit event could not be written.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Severity attached to an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditStatus {
    Warn,
    Error,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Warn => "Warn",
            AuditStatus::Error => "Error",
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Name of the operation or process that produced the event
    pub process: String,
    pub status: AuditStatus,
    /// Free-text detail, typically the attempt count and backend diagnostic
    pub text: String,
    /// When the surrounding operation started, if the caller tracked it
    pub started_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

/// Audit sink consumed from the embedding system.
#[async_trait]
pub trait EventAuditor: Send + Sync + fmt::Debug {
    /// Record an operational event. Implementations must swallow their own
    /// failures; auditing never fails the calling operation.
    async fn try_log_event(
        &self,
        process: &str,
        status: AuditStatus,
        text: &str,
        started_at: Option<DateTime<Utc>>,
    );
}

/// Auditor that emits events as structured log records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditor;

#[async_trait]
impl EventAuditor for TracingAuditor {
    async fn try_log_event(
        &self,
        process: &str,
        status: AuditStatus,
        text: &str,
        started_at: Option<DateTime<Utc>>,
    ) {
        match status {
            AuditStatus::Warn => {
                warn!(process, text, started_at = ?started_at, "Audit event")
            }
            AuditStatus::Error => {
                error!(process, text, started_at = ?started_at, "Audit event")
            }
        }
    }
}

/// Auditor that keeps events in memory so tests can assert on retry
/// activity.
#[derive(Debug, Default)]
pub struct MemoryAuditor {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Number of events recorded for one process name.
    pub fn count_for(&self, process: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.process == process)
            .count()
    }
}

#[async_trait]
impl EventAuditor for MemoryAuditor {
    async fn try_log_event(
        &self,
        process: &str,
        status: AuditStatus,
        text: &str,
        started_at: Option<DateTime<Utc>>,
    ) {
        self.records.lock().push(AuditRecord {
            process: process.to_string(),
            status,
            text: text.to_string(),
            started_at,
            recorded_at: Utc::now(),
        });
    }
}
