//! Tool registry, adapter contract, audit sink, the reference tool set, and
//! the execution boundary that sequences all of it.
//! This is the only crate in the workspace that is allowed to invoke a
//! [`Tool`] handler or an [`Adapter`] method — every other caller goes
//! through [`boundary::ExecutionBoundary::execute_tool`].

pub mod adapter;
pub mod audit;
pub mod boundary;
pub mod registry;
pub mod tool;
pub mod tools;

pub use adapter::Adapter;
pub use audit::{AuditContext, AuditDecision, AuditEvent, AuditSink, RecordingAuditSink, Stage, TracingAuditSink};
pub use boundary::{Denial, DenialReason, ExecuteOutcome, ExecutionBoundary};
pub use registry::{ToolRegistry, ToolRegistryBuilder};
pub use tool::{Tool, ToolFailure, ToolOutcome, ToolResult};
pub use tools::{cost_table, default_registry, DescribeTableTool, ListTablesTool, QueryReadTool};
