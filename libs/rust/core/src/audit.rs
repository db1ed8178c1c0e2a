//! Security/audit event log. Events are immutable once created; sinks only
//! append, so one log can be shared by several sessions.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    SessionInitialized,
    PrivacyApplied,
    UpdateRolledBack,
    ChannelFailure,
    SessionCompleted,
    SessionFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub detail: String,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, session_id: Uuid, detail: impl Into<String>) -> Self {
        Self { kind, timestamp: Utc::now(), session_id, detail: detail.into() }
    }
}

pub trait AuditLog: Send + Sync {
    fn record(&self, event: SecurityEvent);
}

/// Keeps every event in memory; used by tests and the runner's report.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    events: RwLock<Vec<SecurityEvent>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self { Self::default() }
    pub fn events(&self) -> Vec<SecurityEvent> { self.events.read().clone() }
    pub fn count(&self, kind: SecurityEventKind) -> usize { self.events.read().iter().filter(|e| e.kind == kind).count() }
}

impl AuditLog for InMemoryAuditLog {
    fn record(&self, event: SecurityEvent) { self.events.write().push(event); }
}

/// Echoes events through `tracing` under the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn record(&self, event: SecurityEvent) {
        info!(target: "audit", kind = ?event.kind, session_id = %event.session_id, at = %event.timestamp, detail = %event.detail, "security event");
    }
}

/// Fans one event out to several sinks.
pub struct TeeAuditLog(pub Vec<std::sync::Arc<dyn AuditLog>>);

impl AuditLog for TeeAuditLog {
    fn record(&self, event: SecurityEvent) {
        for sink in &self.0 { sink.record(event.clone()); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn concurrent_appends_are_all_kept() {
        let log = Arc::new(InMemoryAuditLog::new());
        let handles: Vec<_> = (0..4).map(|_| {
            let log = log.clone();
            std::thread::spawn(move || for _ in 0..25 { log.record(SecurityEvent::new(SecurityEventKind::PrivacyApplied, Uuid::nil(), "x")); })
        }).collect();
        for h in handles { h.join().unwrap(); }
        assert_eq!(log.count(SecurityEventKind::PrivacyApplied), 100);
    }

    #[test]
    fn tee_forwards_to_each_sink() {
        let a = Arc::new(InMemoryAuditLog::new());
        let b = Arc::new(InMemoryAuditLog::new());
        let tee = TeeAuditLog(vec![a.clone(), b.clone(), Arc::new(TracingAuditLog)]);
        tee.record(SecurityEvent::new(SecurityEventKind::SessionCompleted, Uuid::nil(), "done"));
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
    }
}
