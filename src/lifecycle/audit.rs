//! Structured audit records.
//!
//! Every state-machine transition and every reconciler verdict produces a
//! record `{id, ts, kind, payload}`; durable persistence is an external
//! sink's job. The default sink writes structured log lines; tests use the
//! in-memory sink.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    OrderTransition,
    HedgeTransition,
    ReconcileVerdict,
    Alert,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::OrderTransition => "order_transition",
            AuditKind::HedgeTransition => "hedge_transition",
            AuditKind::ReconcileVerdict => "reconcile_verdict",
            AuditKind::Alert => "alert",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub kind: AuditKind,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Default sink: structured log lines, criticals at error level.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        let critical = record.kind == AuditKind::Alert
            && record.payload.get("severity").and_then(Value::as_str) == Some("critical");
        if critical {
            error!(kind = record.kind.as_str(), payload = %record.payload, "audit");
        } else if record.kind == AuditKind::Alert {
            warn!(kind = record.kind.as_str(), payload = %record.payload, "audit");
        } else {
            info!(kind = record.kind.as_str(), payload = %record.payload, "audit");
        }
    }
}

/// Test/introspection sink retaining records in memory.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn of_kind(&self, kind: AuditKind) -> Vec<AuditRecord> {
        self.records().into_iter().filter(|r| r.kind == kind).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record);
    }
}

/// Front-end the core writes through.
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    fn emit(&self, kind: AuditKind, payload: Value) {
        self.sink.record(AuditRecord { id: Uuid::new_v4(), ts: Utc::now(), kind, payload });
    }

    pub fn order_transition(
        &self,
        entity_id: &str,
        from_state: &str,
        to_state: &str,
        event: &str,
        correlation_id: &str,
    ) {
        self.emit(
            AuditKind::OrderTransition,
            json!({
                "entityType": "order",
                "entityId": entity_id,
                "fromState": from_state,
                "toState": to_state,
                "event": event,
                "correlationId": correlation_id,
            }),
        );
    }

    pub fn hedge_transition(
        &self,
        from_state: &str,
        to_state: &str,
        event: &str,
        correlation_id: &str,
    ) {
        self.emit(
            AuditKind::HedgeTransition,
            json!({
                "entityType": "hedge",
                "entityId": "hedge",
                "fromState": from_state,
                "toState": to_state,
                "event": event,
                "correlationId": correlation_id,
            }),
        );
    }

    pub fn reconcile_verdict(&self, payload: Value) {
        self.emit(AuditKind::ReconcileVerdict, payload);
    }

    pub fn alert(&self, severity: AlertSeverity, code: &str, payload: Value) {
        let severity = match severity {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        };
        self.emit(
            AuditKind::Alert,
            json!({ "severity": severity, "code": code, "detail": payload }),
        );
    }
}
