use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dbward_core::{
    evaluate, ActionKind, DenialCode, QuotaRequestContext, SessionContext,
};
use uuid::Uuid;

use crate::adapter::Adapter;
use crate::audit::{AuditDecision, AuditSink, Stage};
use crate::registry::ToolRegistry;
use crate::tool::{ToolFailure, ToolResult};

/// Sub-reason accompanying a top-level [`DenialCode`], where the code alone
/// does not disambiguate.
#[derive(Debug, Clone)]
pub enum DenialReason {
    Authz(dbward_core::AuthzReason),
    Quota(dbward_core::QuotaReason),
    Tool(ToolFailure),
    None,
}

/// Structured, stable denial returned to the transport. Never carries
/// underlying diagnostic text.
#[derive(Debug, Clone)]
pub struct Denial {
    pub code: DenialCode,
    pub reason: DenialReason,
}

pub type ExecuteOutcome = Result<ToolResult, Denial>;

fn deny(code: DenialCode, reason: DenialReason) -> ExecuteOutcome {
    Err(Denial { code, reason })
}

/// Canonical choke point. No other call site may invoke a
/// tool handler or reach an adapter. Every step is fail-closed; the first
/// failing step returns immediately with zero further data-plane side
/// effects — no later step runs, no handler is invoked, no quota beyond
/// what step 5 itself reserved is touched.
pub struct ExecutionBoundary {
    registry: ToolRegistry,
    read_only: bool,
    production: bool,
    audit: Arc<dyn AuditSink>,
    audit_secret: Vec<u8>,
}

impl ExecutionBoundary {
    pub fn new(
        registry: ToolRegistry,
        read_only: bool,
        production: bool,
        audit: Arc<dyn AuditSink>,
        audit_secret: Vec<u8>,
    ) -> Self {
        ExecutionBoundary {
            registry,
            read_only,
            production,
            audit,
            audit_secret,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    fn emit(
        &self,
        request_id: &str,
        operation_id: &str,
        stage: Stage,
        decision: AuditDecision,
        tool: &str,
        tenant: &str,
        reason: Option<String>,
        adapter_type: &str,
        started: Instant,
    ) {
        self.audit.emit(crate::audit::AuditEvent {
            ts: Utc::now(),
            event_type: stage,
            request_id: request_id.to_string(),
            operation_id: operation_id.to_string(),
            adapter_type: adapter_type.to_string(),
            query_fingerprint: None,
            query_size_bytes: None,
            validation_outcome: None,
            structural_metadata: None,
            decision,
            reason,
            duration_ms_rounded: started.elapsed().as_millis() as u64,
            actor_id_hash: String::new(),
            tenant: tenant.to_string(),
            tool: tool.to_string(),
        });
    }

    /// Sequences the seven boundary steps in order; ordering invariants are
    /// enforced by control flow, not by
    /// convention — step 2 (tool lookup) always runs before step 4
    /// (authorization) or step 5 (quota), so an unknown tool name never
    /// creates an authorization audit record or touches quota state.
    pub async fn execute_tool(
        &self,
        name: &str,
        args: serde_json::Value,
        session: &SessionContext,
        adapter: &dyn Adapter,
    ) -> ExecuteOutcome {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        // Step 1: session context present, BOUND, and brand-valid.
        if !SessionContext::is_valid(session) || !session.is_bound() {
            return deny(DenialCode::SessionContextInvalid, DenialReason::None);
        }
        let tenant = session
            .tenant()
            .expect("is_bound() was just checked")
            .to_string();
        let operation_id = Uuid::new_v4().to_string();

        self.emit(
            &request_id,
            &operation_id,
            Stage::Context,
            AuditDecision::Allow,
            name,
            &tenant,
            None,
            adapter.adapter_type(),
            started,
        );

        // Step 2: `name` is a key of the tool registry. This MUST precede
        // every later step — an invalid tool name must not create
        // authorization audit records or quota state.
        let Some(tool) = self.registry.get(name) else {
            return deny(DenialCode::ToolNotFound, DenialReason::None);
        };

        // Step 3: global read-only mode vs write-capable tool. Must precede
        // authorization: read-only refusal must not depend on whether the
        // caller is authorized.
        if self.read_only && tool.write_capable() {
            self.emit(
                &request_id,
                &operation_id,
                Stage::ReadOnly,
                AuditDecision::Deny,
                name,
                &tenant,
                Some("READ_ONLY".into()),
                adapter.adapter_type(),
                started,
            );
            return deny(DenialCode::ReadOnly, DenialReason::None);
        }

        // Step 4: capability evaluator on (session.capabilities, TOOL_INVOKE, name).
        let capabilities = session
            .capabilities()
            .expect("is_bound() was just checked");
        let decision = evaluate(capabilities, ActionKind::ToolInvoke, name, Utc::now());
        if !decision.allowed {
            let reason = decision.reason.expect("deny always carries a reason");
            self.emit(
                &request_id,
                &operation_id,
                Stage::Authz,
                AuditDecision::Deny,
                name,
                &tenant,
                Some(format!("{reason:?}")),
                adapter.adapter_type(),
                started,
            );
            return deny(DenialCode::Unauthorized, DenialReason::Authz(reason));
        }
        self.emit(
            &request_id,
            &operation_id,
            Stage::Authz,
            AuditDecision::Allow,
            name,
            &tenant,
            None,
            adapter.adapter_type(),
            started,
        );

        // Step 5: quota engine checkAndReserve, skipped iff no engine is
        // attached AND the deployment is non-production; otherwise mandatory.
        let quota_engine = session
            .quota_engine()
            .expect("is_bound() was just checked");
        let mut reserved_key: Option<String> = None;
        match quota_engine {
            Some(engine) => {
                let ctx = QuotaRequestContext {
                    tenant: tenant.clone(),
                    identity: session.identity().expect("bound").to_string(),
                    session_id: session.session_id().expect("bound").to_string(),
                    cap_set_id: capabilities.map(|c| c.cap_set_id.clone()),
                    action: ActionKind::ToolInvoke,
                    target: name.to_string(),
                };
                let quota_decision = engine.check_and_reserve(&ctx);
                if !quota_decision.allowed {
                    let reason = quota_decision
                        .reason
                        .expect("deny always carries a reason");
                    self.emit(
                        &request_id,
                        &operation_id,
                        Stage::Quota,
                        AuditDecision::Deny,
                        name,
                        &tenant,
                        Some(format!("{reason:?}")),
                        adapter.adapter_type(),
                        started,
                    );
                    return deny(DenialCode::RateLimited, DenialReason::Quota(reason));
                }
                reserved_key = quota_decision.semaphore_key;
                self.emit(
                    &request_id,
                    &operation_id,
                    Stage::Quota,
                    AuditDecision::Allow,
                    name,
                    &tenant,
                    None,
                    adapter.adapter_type(),
                    started,
                );
            }
            None if self.production => {
                self.emit(
                    &request_id,
                    &operation_id,
                    Stage::Quota,
                    AuditDecision::Deny,
                    name,
                    &tenant,
                    Some("POLICY_MISSING".into()),
                    adapter.adapter_type(),
                    started,
                );
                return deny(
                    DenialCode::RateLimited,
                    DenialReason::Quota(dbward_core::QuotaReason::PolicyMissing),
                );
            }
            None => {
                // Development deployment, no quota engine attached: quota
                // enforcement is skipped entirely.
            }
        }

        // Ensure the reserved semaphore slot (if any) is released on every
        // exit path from here on, including a handler panic/cancellation.
        let release_guard = reserved_key.map(|key| ReleaseGuard {
            engine: quota_engine.cloned(),
            key,
        });

        // Step 6: input schema validation for `args` against `tool.inputSchema`.
        let schema = tool.input_schema();
        if let Ok(compiled) = jsonschema::validator_for(&schema) {
            if !compiled.is_valid(&args) {
                drop(release_guard);
                return deny(DenialCode::InvalidInput, DenialReason::None);
            }
        }

        // Step 7: tool handler invocation, passing (validatedArgs, adapter, session).
        let audit_ctx = crate::audit::AuditContext {
            sink: self.audit.as_ref(),
            secret: &self.audit_secret,
            request_id: &request_id,
            operation_id: &operation_id,
            tenant: &tenant,
        };
        // Per spec.md §5 "Cancellation & timeouts": a per-query statement
        // timeout bounds handler time. The adapter enforces its own
        // statement-level timeout beneath this one as defense in depth;
        // this is the outer bound on the whole handler invocation,
        // including any boundary-side work the handler itself does.
        let outcome = match tokio::time::timeout(
            tool.execution_timeout(),
            tool.execute(args, adapter, session, &audit_ctx),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_elapsed) => Err(ToolFailure::QueryTimeout),
        };
        drop(release_guard);

        outcome.map_err(|failure| {
            let code = match failure {
                ToolFailure::QueryRejected => DenialCode::QueryRejected,
                ToolFailure::UnauthorizedTable => DenialCode::UnauthorizedTable,
                ToolFailure::QueryTimeout => DenialCode::QueryTimeout,
                ToolFailure::ExecutionError => DenialCode::ExecutionError,
                ToolFailure::InvalidInput => DenialCode::InvalidInput,
            };
            Denial {
                code,
                reason: DenialReason::Tool(failure),
            }
        })
    }
}

/// Releases a reserved semaphore slot on drop, so cancellation or an early
/// return between reservation and handler completion still releases it.
struct ReleaseGuard {
    engine: Option<Arc<dyn dbward_core::QuotaEngineHandle>>,
    key: String,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(engine) = &self.engine {
            engine.release(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingAuditSink;
    use crate::registry::ToolRegistryBuilder;
    use crate::tool::{Tool, ToolOutcome};
    use async_trait::async_trait;
    use dbward_core::{CapabilitySet, Grant};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTool {
        writes: bool,
        calls: AtomicUsize,
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "always outlasts its own timeout"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        fn execution_timeout(&self) -> std::time::Duration {
            std::time::Duration::from_millis(5)
        }
        async fn execute(
            &self,
            args: serde_json::Value,
            _adapter: &dyn Adapter,
            _session: &SessionContext,
            _audit: &crate::audit::AuditContext<'_>,
        ) -> ToolOutcome {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Ok(ToolResult::new(args))
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes input"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        fn write_capable(&self) -> bool {
            self.writes
        }
        async fn execute(
            &self,
            args: serde_json::Value,
            _adapter: &dyn Adapter,
            _session: &SessionContext,
            _audit: &crate::audit::AuditContext<'_>,
        ) -> ToolOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ToolResult::new(args))
        }
    }

    struct NullAdapter;
    #[async_trait]
    impl Adapter for NullAdapter {
        async fn list_tables(
            &self,
            _schema: Option<&str>,
            _session: &SessionContext,
        ) -> Result<serde_json::Value, ToolFailure> {
            Ok(json!([]))
        }
        async fn describe_table(
            &self,
            _schema: &str,
            _table: &str,
            _session: &SessionContext,
        ) -> Result<serde_json::Value, ToolFailure> {
            Ok(json!({}))
        }
        async fn execute_query(
            &self,
            _sql: &str,
            _session: &SessionContext,
        ) -> Result<serde_json::Value, ToolFailure> {
            Ok(json!([]))
        }
        fn adapter_type(&self) -> &'static str {
            "null"
        }
    }

    fn bound_session(grants: Vec<Grant>) -> SessionContext {
        let mut s = SessionContext::new().bind("u@x", "t1", "sess-1").unwrap();
        let now = Utc::now();
        s.attach_capabilities(CapabilitySet {
            cap_set_id: "cs1".into(),
            issued_at: now,
            expires_at: now + chrono::Duration::hours(1),
            issuer: "control-plane".into(),
            grants,
        })
        .unwrap();
        s
    }

    fn boundary(registry: ToolRegistry, sink: Arc<RecordingAuditSink>) -> ExecutionBoundary {
        ExecutionBoundary::new(registry, false, false, sink, b"test-secret".to_vec())
    }

    #[tokio::test]
    async fn unknown_tool_denies_before_any_authz_or_quota_event() {
        let registry = ToolRegistryBuilder::new().build();
        let sink = Arc::new(RecordingAuditSink::new());
        let b = boundary(registry, sink.clone());
        let session = bound_session(vec![]);
        let result = b
            .execute_tool("fake_admin", json!({}), &session, &NullAdapter)
            .await;
        assert!(matches!(
            result.unwrap_err().code,
            DenialCode::ToolNotFound
        ));
        assert_eq!(sink.count(Stage::Authz), 0);
        assert_eq!(sink.count(Stage::Quota), 0);
    }

    #[tokio::test]
    async fn unauthorized_tool_denies_without_invoking_handler() {
        let tool = Arc::new(EchoTool {
            writes: false,
            calls: AtomicUsize::new(0),
        });
        let registry = ToolRegistryBuilder::new().register(tool.clone()).build();
        let sink = Arc::new(RecordingAuditSink::new());
        let b = boundary(registry, sink);
        let session = bound_session(vec![]); // no grants
        let result = b
            .execute_tool("echo", json!({}), &session, &NullAdapter)
            .await;
        assert!(matches!(result.unwrap_err().code, DenialCode::Unauthorized));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn read_only_mode_denies_write_capable_tool_before_authz() {
        let tool = Arc::new(EchoTool {
            writes: true,
            calls: AtomicUsize::new(0),
        });
        let registry = ToolRegistryBuilder::new().register(tool.clone()).build();
        let sink = Arc::new(RecordingAuditSink::new());
        let b = ExecutionBoundary::new(registry, true, false, sink.clone(), b"s".to_vec());
        let session = bound_session(vec![Grant {
            action: ActionKind::ToolInvoke,
            target: "echo".into(),
        }]);
        let result = b
            .execute_tool("echo", json!({}), &session, &NullAdapter)
            .await;
        assert!(matches!(result.unwrap_err().code, DenialCode::ReadOnly));
        assert_eq!(sink.count(Stage::Authz), 0, "authz must not run when read-only rejects first");
    }

    #[tokio::test]
    async fn happy_path_invokes_handler_and_emits_authz_allow() {
        let tool = Arc::new(EchoTool {
            writes: false,
            calls: AtomicUsize::new(0),
        });
        let registry = ToolRegistryBuilder::new().register(tool.clone()).build();
        let sink = Arc::new(RecordingAuditSink::new());
        let b = boundary(registry, sink.clone());
        let session = bound_session(vec![Grant {
            action: ActionKind::ToolInvoke,
            target: "echo".into(),
        }]);
        let result = b
            .execute_tool("echo", json!({"x": 1}), &session, &NullAdapter)
            .await;
        assert!(result.is_ok());
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count(Stage::Authz), 1);
    }

    #[tokio::test]
    async fn unbound_session_denies_session_context_invalid() {
        let registry = ToolRegistryBuilder::new().build();
        let sink = Arc::new(RecordingAuditSink::new());
        let b = boundary(registry, sink);
        let session = SessionContext::new();
        let result = b
            .execute_tool("echo", json!({}), &session, &NullAdapter)
            .await;
        assert!(matches!(
            result.unwrap_err().code,
            DenialCode::SessionContextInvalid
        ));
    }

    #[tokio::test]
    async fn missing_quota_engine_denies_in_production() {
        let tool = Arc::new(EchoTool {
            writes: false,
            calls: AtomicUsize::new(0),
        });
        let registry = ToolRegistryBuilder::new().register(tool).build();
        let sink = Arc::new(RecordingAuditSink::new());
        let b = ExecutionBoundary::new(registry, false, true, sink, b"s".to_vec());
        let session = bound_session(vec![Grant {
            action: ActionKind::ToolInvoke,
            target: "echo".into(),
        }]);
        let result = b
            .execute_tool("echo", json!({}), &session, &NullAdapter)
            .await;
        assert!(matches!(result.unwrap_err().code, DenialCode::RateLimited));
    }

    #[tokio::test]
    async fn missing_quota_engine_is_skipped_in_development() {
        let tool = Arc::new(EchoTool {
            writes: false,
            calls: AtomicUsize::new(0),
        });
        let registry = ToolRegistryBuilder::new().register(tool.clone()).build();
        let sink = Arc::new(RecordingAuditSink::new());
        let b = boundary(registry, sink);
        let session = bound_session(vec![Grant {
            action: ActionKind::ToolInvoke,
            target: "echo".into(),
        }]);
        let result = b
            .execute_tool("echo", json!({}), &session, &NullAdapter)
            .await;
        assert!(result.is_ok());
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_exceeding_its_timeout_denies_query_timeout() {
        let registry = ToolRegistryBuilder::new().register(Arc::new(SlowTool)).build();
        let sink = Arc::new(RecordingAuditSink::new());
        let b = boundary(registry, sink);
        let session = bound_session(vec![Grant {
            action: ActionKind::ToolInvoke,
            target: "slow".into(),
        }]);
        let result = b
            .execute_tool("slow", json!({}), &session, &NullAdapter)
            .await;
        assert!(matches!(result.unwrap_err().code, DenialCode::QueryTimeout));
    }
}
