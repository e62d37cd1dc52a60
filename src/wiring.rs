use std::sync::Arc;

use dbward_core::{Deployment, QuotaEngineHandle, SessionContext};
use dbward_quota::QuotaEngine;
use dbward_sql::Allowlist;
use dbward_tools::{default_registry, cost_table, AuditSink, ExecutionBoundary, TracingAuditSink};

use crate::config::Config;

/// Everything the HTTP transport needs per process: a single session bound
/// from control-plane configuration before any tool is registered, and the
/// execution boundary it is handed to on every call.
pub struct AppState {
    pub session: SessionContext,
    pub boundary: Arc<ExecutionBoundary>,
}

/// Builds the bound session and execution boundary from a loaded [`Config`].
/// This is the only place `SessionContext::bind`/`attach_*` are called.
pub fn build(config: &Config, audit_sink: Option<Arc<dyn AuditSink>>) -> anyhow::Result<AppState> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let mut session = SessionContext::new().bind(&config.identity, &config.tenant, session_id)?;
    session.attach_capabilities(config.capabilities.clone())?;

    let quota_engine: Arc<dyn QuotaEngineHandle> = Arc::new(QuotaEngine::new(
        config.quota_policies.clone(),
        cost_table(),
    ));
    session.attach_quota_engine(quota_engine)?;

    let allowlist = Arc::new(Allowlist::new(
        config.allowlist_schemas.clone(),
        config.allowlist_tables.clone(),
    ));
    let registry = default_registry(allowlist, config.orderby_columns.clone());

    let audit: Arc<dyn AuditSink> = audit_sink.unwrap_or_else(|| Arc::new(TracingAuditSink));
    let boundary = Arc::new(ExecutionBoundary::new(
        registry,
        config.read_only,
        matches!(config.deployment, Deployment::Production),
        audit,
        audit_secret(),
    ));

    Ok(AppState { session, boundary })
}

/// HMAC secret for audit query fingerprints. A fixed process-lifetime
/// secret is sufficient here — fingerprints only need to be stable within a
/// process — a future iteration could read this from the same
/// control-plane source as the rest of the config.
fn audit_secret() -> Vec<u8> {
    std::env::var("AUDIT_FINGERPRINT_SECRET")
        .unwrap_or_else(|_| "dbward-default-audit-secret".to_string())
        .into_bytes()
}
