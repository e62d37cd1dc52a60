use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Mutex;
use subtle::ConstantTimeEq;

use dbward_sql::ValidatedQuery;

type HmacSha256 = Hmac<Sha256>;

/// Which decision stage emitted the event. The boundary emits at most one
/// `Authz` and one `Quota` event per request on the happy path, plus exactly
/// one event for whichever step produced a terminal denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Context,
    ToolLookup,
    ReadOnly,
    Authz,
    Quota,
    InputValidation,
    Handler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditDecision {
    Allow,
    Deny,
}

/// Single-line structured audit record. No raw SQL, no parameter values, no
/// schema/table/column names, no result
/// data, no DB error strings — `query_fingerprint` is the only SQL-derived
/// field, and it is a one-way HMAC digest of a structural shape, never the
/// text itself.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub event_type: Stage,
    pub request_id: String,
    pub operation_id: String,
    pub adapter_type: String,
    pub query_fingerprint: Option<String>,
    pub query_size_bytes: Option<usize>,
    pub validation_outcome: Option<String>,
    pub structural_metadata: Option<serde_json::Value>,
    pub decision: AuditDecision,
    pub reason: Option<String>,
    pub duration_ms_rounded: u64,
    pub actor_id_hash: String,
    pub tenant: String,
    pub tool: String,
}

/// Boundary-owned capability. Modeled as infallible (`emit` returns `()`) —
/// the sink must not be able to alter control flow. A future dispatcher
/// that can fail synchronously maps that failure to `AUDIT_FAILURE`;
/// routing every call through this one trait method keeps that an
/// additive change.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Reference sink: one `tracing::info!` record per event, field-per-column,
/// shipped through whatever layer (plain or JSON) the process installed.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        tracing::info!(
            event_type = ?event.event_type,
            request_id = %event.request_id,
            operation_id = %event.operation_id,
            adapter_type = %event.adapter_type,
            query_fingerprint = event.query_fingerprint.as_deref().unwrap_or_default(),
            query_size_bytes = event.query_size_bytes.unwrap_or_default(),
            decision = ?event.decision,
            reason = event.reason.as_deref().unwrap_or_default(),
            duration_ms = event.duration_ms_rounded,
            actor_id_hash = %event.actor_id_hash,
            tenant = %event.tenant,
            tool = %event.tool,
            "audit"
        );
    }
}

/// In-memory sink for tests that need to assert on emitted events (ordering,
/// count, content) — the testable properties around "exactly one authz
/// event" and "zero authz events for an unknown tool" need this.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        RecordingAuditSink::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit sink mutex poisoned").clone()
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type == stage)
            .count()
    }
}

impl AuditSink for RecordingAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().expect("audit sink mutex poisoned").push(event);
    }
}

/// Canonical structural form of a validated query: sorted table names plus
/// sort-key count, never the literal SQL text or identifiers beyond table
/// names already cleared by the allowlist. This is what gets fingerprinted,
/// not the raw query string.
pub fn canonical_structural_form(validated: &ValidatedQuery) -> String {
    let mut tables: Vec<String> = validated
        .tables
        .iter()
        .map(|t| format!("{}.{}", t.schema, t.table))
        .collect();
    tables.sort();
    format!("FROM[{}]ORDERBY[{}]", tables.join(","), validated.order_by.len())
}

/// HMAC-SHA256 over the canonical structural form, hex-encoded.
/// Non-reversible by construction: the secret never leaves the process.
pub fn fingerprint_query(secret: &[u8], canonical_form: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts a key of any length");
    mac.update(canonical_form.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of two fingerprints, for callers that need to
/// correlate audit records without leaking timing information.
pub fn fingerprints_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Hash of the actor identity for the audit event's `actor_id_hash` field —
/// never the raw identity string.
pub fn actor_id_hash(secret: &[u8], identity: &str) -> String {
    fingerprint_query(secret, identity)
}

/// Handed to tool handlers so `query_read` can emit its own structural-
/// validation audit event (with the query fingerprint) without the boundary
/// having to parse tool-specific arguments to reconstruct one.
pub struct AuditContext<'a> {
    pub sink: &'a dyn AuditSink,
    pub secret: &'a [u8],
    pub request_id: &'a str,
    pub operation_id: &'a str,
    pub tenant: &'a str,
}

impl<'a> AuditContext<'a> {
    pub fn emit(
        &self,
        stage: Stage,
        decision: AuditDecision,
        tool: &str,
        reason: Option<String>,
        query_fingerprint: Option<String>,
        query_size_bytes: Option<usize>,
    ) {
        self.sink.emit(AuditEvent {
            ts: Utc::now(),
            event_type: stage,
            request_id: self.request_id.to_string(),
            operation_id: self.operation_id.to_string(),
            adapter_type: String::new(),
            query_fingerprint,
            query_size_bytes,
            validation_outcome: None,
            structural_metadata: None,
            decision,
            reason,
            duration_ms_rounded: 0,
            actor_id_hash: String::new(),
            tenant: self.tenant.to_string(),
            tool: tool.to_string(),
        });
    }
}
