//! `dbward` wires the security-critical crates (`dbward-core`,
//! `dbward-quota`, `dbward-sql`, `dbward-tools`) into a runnable service: a
//! config loader for the control-plane environment variables, a reference
//! SQLite-backed adapter, and a thin `axum` transport. None of the modules
//! in this crate may bypass `dbward_tools::ExecutionBoundary::execute_tool`
//! — see `http::call_tool`.

pub mod adapter_sqlite;
pub mod config;
pub mod http;
pub mod wiring;
