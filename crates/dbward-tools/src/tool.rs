use async_trait::async_trait;
use dbward_core::SessionContext;
use serde_json::Value;
use std::time::Duration;

use crate::adapter::Adapter;
use crate::audit::AuditContext;

/// Successful handler output. `content` is already shaped for the caller —
/// the tool, not the boundary, decides the response body.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolResult {
    pub content: Value,
}

impl ToolResult {
    pub fn new(content: Value) -> Self {
        ToolResult { content }
    }
}

/// Errors a handler or adapter may surface. Deliberately a small, closed set
/// matching the adapter/runtime branch of the denial taxonomy — a handler
/// never returns a free-text error to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFailure {
    QueryRejected,
    UnauthorizedTable,
    QueryTimeout,
    ExecutionError,
    InvalidInput,
}

pub type ToolOutcome = Result<ToolResult, ToolFailure>;

/// One registered tool. The registry holds a closed set of these, keyed by
/// `name()`; the only caller is the execution boundary's step 7.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema the boundary validates `arguments` against before
    /// invocation (step 6).
    fn input_schema(&self) -> Value;

    /// Whether this tool mutates data-plane state. Consulted by the
    /// boundary's read-only check (step 3); none of the reference tools
    /// return `true`.
    fn write_capable(&self) -> bool {
        false
    }

    /// Per-call timeout the boundary enforces around `execute` (step 7).
    fn execution_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn execute(
        &self,
        args: Value,
        adapter: &dyn Adapter,
        session: &SessionContext,
        audit: &AuditContext<'_>,
    ) -> ToolOutcome;
}
