use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dbward_core::SessionContext;
use dbward_sql::{Allowlist, ValidationError};
use serde_json::{json, Value};

use crate::adapter::Adapter;
use crate::audit::{actor_id_hash, canonical_structural_form, fingerprint_query, AuditContext, AuditDecision, Stage};
use crate::registry::{ToolRegistry, ToolRegistryBuilder};
use crate::tool::{Tool, ToolFailure, ToolOutcome, ToolResult};

/// Server-side cost table consulted by the quota engine's cost dimension
/// only. All three reference tools have an explicit entry; the engine
/// falls back to cost 1 for anything absent.
pub fn cost_table() -> HashMap<String, u64> {
    let mut t = HashMap::new();
    t.insert("list_tables".to_string(), 1);
    t.insert("describe_table".to_string(), 1);
    t.insert("query_read".to_string(), 5);
    t
}

/// `list_tables` — lists the `(schema, table)` pairs visible through the
/// allowlist. An optional `schema` filter argument is itself passed through
/// the allowlist before being handed to the adapter, never trusted blindly.
pub struct ListTablesTool {
    allowlist: Arc<Allowlist>,
}

impl ListTablesTool {
    pub fn new(allowlist: Arc<Allowlist>) -> Self {
        ListTablesTool { allowlist }
    }
}

#[async_trait]
impl Tool for ListTablesTool {
    fn name(&self) -> &str {
        "list_tables"
    }

    fn description(&self) -> &str {
        "Lists schema-qualified tables visible to the caller's allowlist."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "schema": { "type": "string" } },
            "additionalProperties": false,
        })
    }

    async fn execute(
        &self,
        args: Value,
        adapter: &dyn Adapter,
        session: &SessionContext,
        audit: &AuditContext<'_>,
    ) -> ToolOutcome {
        let schema = args.get("schema").and_then(Value::as_str);
        if let Some(schema) = schema {
            if !self.allowlist.schema_allowed(schema) {
                audit.emit(
                    Stage::Handler,
                    AuditDecision::Deny,
                    self.name(),
                    Some("UNAUTHORIZED_TABLE".into()),
                    None,
                    None,
                );
                return Err(ToolFailure::UnauthorizedTable);
            }
        }
        adapter
            .list_tables(schema, session)
            .await
            .map(ToolResult::new)
    }
}

/// `describe_table` — returns column metadata for one allowlisted table,
/// including nullability and declared type when the adapter can supply it.
pub struct DescribeTableTool {
    allowlist: Arc<Allowlist>,
}

impl DescribeTableTool {
    pub fn new(allowlist: Arc<Allowlist>) -> Self {
        DescribeTableTool { allowlist }
    }
}

#[async_trait]
impl Tool for DescribeTableTool {
    fn name(&self) -> &str {
        "describe_table"
    }

    fn description(&self) -> &str {
        "Describes the columns of one schema-qualified, allowlisted table."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "schema": { "type": "string" },
                "table": { "type": "string" },
            },
            "required": ["schema", "table"],
            "additionalProperties": false,
        })
    }

    async fn execute(
        &self,
        args: Value,
        adapter: &dyn Adapter,
        session: &SessionContext,
        audit: &AuditContext<'_>,
    ) -> ToolOutcome {
        let Some(schema) = args.get("schema").and_then(Value::as_str) else {
            return Err(ToolFailure::InvalidInput);
        };
        let Some(table) = args.get("table").and_then(Value::as_str) else {
            return Err(ToolFailure::InvalidInput);
        };
        let qname = dbward_sql::QualifiedName {
            schema: schema.to_string(),
            table: table.to_string(),
        };
        if self.allowlist.check(&qname).is_err() {
            audit.emit(
                Stage::Handler,
                AuditDecision::Deny,
                self.name(),
                Some("UNAUTHORIZED_TABLE".into()),
                None,
                None,
            );
            return Err(ToolFailure::UnauthorizedTable);
        }
        adapter
            .describe_table(schema, table, session)
            .await
            .map(ToolResult::new)
    }
}

/// `query_read` — the structural-validator-gated, read-only query tool.
/// Validation happens here, before the adapter is ever called; the adapter
/// re-runs it independently as defense in depth.
pub struct QueryReadTool {
    allowlist: Arc<Allowlist>,
    orderby_allowlist: Option<std::collections::HashSet<(String, String, String)>>,
}

impl QueryReadTool {
    pub fn new(
        allowlist: Arc<Allowlist>,
        orderby_allowlist: Option<std::collections::HashSet<(String, String, String)>>,
    ) -> Self {
        QueryReadTool {
            allowlist,
            orderby_allowlist,
        }
    }
}

#[async_trait]
impl Tool for QueryReadTool {
    fn name(&self) -> &str {
        "query_read"
    }

    fn description(&self) -> &str {
        "Executes a single read-only, structurally validated SELECT query."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string", "minLength": 1 } },
            "required": ["query"],
            "additionalProperties": false,
        })
    }

    async fn execute(
        &self,
        args: Value,
        adapter: &dyn Adapter,
        session: &SessionContext,
        audit: &AuditContext<'_>,
    ) -> ToolOutcome {
        let Some(sql) = args.get("query").and_then(Value::as_str) else {
            return Err(ToolFailure::InvalidInput);
        };

        let validated = match dbward_sql::validate(sql, self.orderby_allowlist.as_ref()) {
            Ok(v) => v,
            Err(err) => {
                audit.emit(
                    Stage::Handler,
                    AuditDecision::Deny,
                    self.name(),
                    Some(format!("{err:?}")),
                    None,
                    Some(sql.len()),
                );
                return Err(ToolFailure::QueryRejected);
            }
        };

        if self.allowlist.check_all(validated.tables.iter()).is_err() {
            let fingerprint =
                fingerprint_query(audit.secret, &canonical_structural_form(&validated));
            audit.emit(
                Stage::Handler,
                AuditDecision::Deny,
                self.name(),
                Some("UNAUTHORIZED_TABLE".into()),
                Some(fingerprint),
                Some(sql.len()),
            );
            return Err(ToolFailure::UnauthorizedTable);
        }

        let fingerprint = fingerprint_query(audit.secret, &canonical_structural_form(&validated));
        audit.emit(
            Stage::Handler,
            AuditDecision::Allow,
            self.name(),
            None,
            Some(fingerprint),
            Some(sql.len()),
        );

        adapter.execute_query(sql, session).await.map(ToolResult::new)
    }
}

/// `actor_id_hash` re-export convenience so the root binary doesn't need to
/// import `dbward_tools::audit` directly for a single helper call.
pub fn hash_actor_id(secret: &[u8], identity: &str) -> String {
    actor_id_hash(secret, identity)
}

/// Builds the closed registry of the three reference tools, wired against
/// one shared allowlist.
pub fn default_registry(
    allowlist: Arc<Allowlist>,
    orderby_allowlist: Option<std::collections::HashSet<(String, String, String)>>,
) -> ToolRegistry {
    ToolRegistryBuilder::new()
        .register(Arc::new(ListTablesTool::new(allowlist.clone())))
        .register(Arc::new(DescribeTableTool::new(allowlist.clone())))
        .register(Arc::new(QueryReadTool::new(allowlist, orderby_allowlist)))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingAuditSink;
    use dbward_core::CapabilitySet;
    use std::collections::HashSet;

    struct RecordingAdapter;

    #[async_trait]
    impl Adapter for RecordingAdapter {
        async fn list_tables(
            &self,
            _schema: Option<&str>,
            _session: &SessionContext,
        ) -> Result<Value, ToolFailure> {
            Ok(json!(["public.users"]))
        }
        async fn describe_table(
            &self,
            _schema: &str,
            _table: &str,
            _session: &SessionContext,
        ) -> Result<Value, ToolFailure> {
            Ok(json!({"columns": []}))
        }
        async fn execute_query(
            &self,
            _sql: &str,
            _session: &SessionContext,
        ) -> Result<Value, ToolFailure> {
            Ok(json!({"rows": []}))
        }
        fn adapter_type(&self) -> &'static str {
            "recording"
        }
    }

    fn session() -> SessionContext {
        let mut s = SessionContext::new().bind("u@x", "t1", "sess-1").unwrap();
        let now = chrono::Utc::now();
        s.attach_capabilities(CapabilitySet {
            cap_set_id: "cs1".into(),
            issued_at: now,
            expires_at: now + chrono::Duration::hours(1),
            issuer: "control-plane".into(),
            grants: vec![],
        })
        .unwrap();
        s
    }

    fn audit_ctx<'a>(sink: &'a RecordingAuditSink, secret: &'a [u8]) -> AuditContext<'a> {
        AuditContext {
            sink,
            secret,
            request_id: "req-1",
            operation_id: "op-1",
            tenant: "t1",
        }
    }

    #[tokio::test]
    async fn query_read_rejects_unauthorized_table() {
        let allowlist = Arc::new(Allowlist::new(HashSet::from(["public".to_string()]), {
            let mut m = HashMap::new();
            m.insert("public".to_string(), HashSet::from(["users".to_string()]));
            Some(m)
        }));
        let tool = QueryReadTool::new(allowlist, None);
        let sink = RecordingAuditSink::new();
        let ctx = audit_ctx(&sink, b"secret");
        let result = tool
            .execute(
                json!({"query": "SELECT * FROM public.admins"}),
                &RecordingAdapter,
                &session(),
                &ctx,
            )
            .await;
        assert_eq!(result.unwrap_err(), ToolFailure::UnauthorizedTable);
    }

    #[tokio::test]
    async fn query_read_rejects_structurally_invalid_sql() {
        let allowlist = Arc::new(Allowlist::new(HashSet::from(["public".to_string()]), None));
        let tool = QueryReadTool::new(allowlist, None);
        let sink = RecordingAuditSink::new();
        let ctx = audit_ctx(&sink, b"secret");
        let result = tool
            .execute(
                json!({"query": "SELECT * FROM public.users; DROP TABLE public.users"}),
                &RecordingAdapter,
                &session(),
                &ctx,
            )
            .await;
        assert_eq!(result.unwrap_err(), ToolFailure::QueryRejected);
    }

    #[tokio::test]
    async fn query_read_happy_path_invokes_adapter() {
        let allowlist = Arc::new(Allowlist::new(HashSet::from(["public".to_string()]), None));
        let tool = QueryReadTool::new(allowlist, None);
        let sink = RecordingAuditSink::new();
        let ctx = audit_ctx(&sink, b"secret");
        let result = tool
            .execute(
                json!({"query": "SELECT u.id FROM public.users u"}),
                &RecordingAdapter,
                &session(),
                &ctx,
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(sink.count(Stage::Handler), 1);
    }

    #[tokio::test]
    async fn list_tables_rejects_unauthorized_schema_filter() {
        let allowlist = Arc::new(Allowlist::new(HashSet::from(["public".to_string()]), None));
        let tool = ListTablesTool::new(allowlist);
        let sink = RecordingAuditSink::new();
        let ctx = audit_ctx(&sink, b"secret");
        let result = tool
            .execute(json!({"schema": "other"}), &RecordingAdapter, &session(), &ctx)
            .await;
        assert_eq!(result.unwrap_err(), ToolFailure::UnauthorizedTable);
    }

    #[tokio::test]
    async fn describe_table_rejects_unauthorized_table() {
        let allowlist = Arc::new(Allowlist::new(HashSet::from(["public".to_string()]), None));
        let tool = DescribeTableTool::new(allowlist);
        let sink = RecordingAuditSink::new();
        let ctx = audit_ctx(&sink, b"secret");
        let result = tool
            .execute(
                json!({"schema": "other", "table": "secrets"}),
                &RecordingAdapter,
                &session(),
                &ctx,
            )
            .await;
        assert_eq!(result.unwrap_err(), ToolFailure::UnauthorizedTable);
    }

    #[test]
    fn cost_table_has_entries_for_all_reference_tools() {
        let t = cost_table();
        assert_eq!(t.get("list_tables"), Some(&1));
        assert_eq!(t.get("describe_table"), Some(&1));
        assert_eq!(t.get("query_read"), Some(&5));
    }
}
