use async_trait::async_trait;
use dbward_core::SessionContext;
use serde_json::Value;

use crate::tool::ToolFailure;

/// External collaborator contract. The boundary guarantees
/// `session` is bound and brand-valid before any adapter call; every method
/// re-asserts that itself (defense in depth) rather than trusting the
/// caller. `execute_query` additionally re-runs the structural validator and
/// allowlist — the boundary's own `query_read` tool validates once, but the
/// adapter is the last line before a real statement reaches the database.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn list_tables(
        &self,
        schema: Option<&str>,
        session: &SessionContext,
    ) -> Result<Value, ToolFailure>;

    async fn describe_table(
        &self,
        schema: &str,
        table: &str,
        session: &SessionContext,
    ) -> Result<Value, ToolFailure>;

    async fn execute_query(
        &self,
        sql: &str,
        session: &SessionContext,
    ) -> Result<Value, ToolFailure>;

    /// Short, stable label for the audit event's `adapter_type` field.
    fn adapter_type(&self) -> &'static str;
}
