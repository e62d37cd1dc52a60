use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbward_core::SessionContext;
use dbward_sql::Allowlist;
use dbward_tools::{Adapter, ToolFailure};
use rusqlite::{Connection, OpenFlags};
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;

/// Reference `Adapter` implementation backed by a single read-only-opened
/// SQLite connection. Connection pooling and physical drivers remain out of
/// scope — this is a single-connection reference, not a pool. Every method
/// re-asserts the session brand before doing any work, matching the
/// defense-in-depth contract the boundary already enforces.
pub struct SqliteAdapter {
    conn: Arc<AsyncMutex<Connection>>,
    allowlist: Arc<Allowlist>,
    orderby_allowlist: Option<std::collections::HashSet<(String, String, String)>>,
    statement_timeout: Duration,
    row_limit: i64,
}

impl SqliteAdapter {
    pub fn open(
        path: &str,
        allowlist: Arc<Allowlist>,
        orderby_allowlist: Option<std::collections::HashSet<(String, String, String)>>,
    ) -> anyhow::Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_millis(500))?;
        Ok(SqliteAdapter {
            conn: Arc::new(AsyncMutex::new(conn)),
            allowlist,
            orderby_allowlist,
            statement_timeout: Duration::from_secs(5),
            row_limit: 1_000,
        })
    }

    fn assert_brand(session: &SessionContext) -> Result<(), ToolFailure> {
        if !SessionContext::is_valid(session) || !session.is_bound() {
            // A bug at a layer above handed us an unbound/unbranded
            // session; this is a fatal invariant violation, not a policy
            // decision — panicking here surfaces it loudly instead of
            // letting it masquerade as an ordinary denial.
            panic!("adapter received a session that was not bound and brand-valid");
        }
        let _ = session;
        Ok(())
    }
}

#[async_trait]
impl Adapter for SqliteAdapter {
    async fn list_tables(
        &self,
        schema: Option<&str>,
        session: &SessionContext,
    ) -> Result<Value, ToolFailure> {
        Self::assert_brand(session)?;
        if let Some(schema) = schema
            && !self.allowlist.schema_allowed(schema)
        {
            return Err(ToolFailure::UnauthorizedTable);
        }

        let conn = self.conn.clone();
        let timeout = self.statement_timeout;
        let result = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || -> rusqlite::Result<Vec<String>> {
                let conn = conn.blocking_lock();
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect()
            }),
        )
        .await;

        match result {
            Ok(Ok(Ok(names))) => Ok(json!({ "tables": names })),
            Ok(Ok(Err(_db_err))) => Err(ToolFailure::ExecutionError),
            Ok(Err(_join_err)) => Err(ToolFailure::ExecutionError),
            Err(_elapsed) => Err(ToolFailure::QueryTimeout),
        }
    }

    async fn describe_table(
        &self,
        schema: &str,
        table: &str,
        session: &SessionContext,
    ) -> Result<Value, ToolFailure> {
        Self::assert_brand(session)?;
        let qname = dbward_sql::QualifiedName {
            schema: schema.to_string(),
            table: table.to_string(),
        };
        if self.allowlist.check(&qname).is_err() {
            return Err(ToolFailure::UnauthorizedTable);
        }

        let conn = self.conn.clone();
        let table_owned = table.to_string();
        let timeout = self.statement_timeout;
        let result = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || -> rusqlite::Result<Vec<Value>> {
                let conn = conn.blocking_lock();
                // `PRAGMA table_info` does not accept bound parameters; the
                // table name was already validated against the allowlist
                // above, so interpolation here is safe from injection in
                // the sense that only allowlisted identifiers ever reach it.
                let sql = format!("PRAGMA table_info({table_owned})");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], |row| {
                    let name: String = row.get(1)?;
                    let declared_type: String = row.get(2)?;
                    let not_null: i64 = row.get(3)?;
                    Ok(json!({
                        "name": name,
                        "type": declared_type,
                        "nullable": not_null == 0,
                    }))
                })?;
                rows.collect()
            }),
        )
        .await;

        match result {
            Ok(Ok(Ok(columns))) => Ok(json!({ "schema": schema, "table": table, "columns": columns })),
            Ok(Ok(Err(_))) => Err(ToolFailure::ExecutionError),
            Ok(Err(_)) => Err(ToolFailure::ExecutionError),
            Err(_) => Err(ToolFailure::QueryTimeout),
        }
    }

    async fn execute_query(&self, sql: &str, session: &SessionContext) -> Result<Value, ToolFailure> {
        Self::assert_brand(session)?;

        // Defense in depth: re-run the structural validator and allowlist
        // even though the tool handler already did.
        let validated = dbward_sql::validate(sql, self.orderby_allowlist.as_ref())
            .map_err(|_| ToolFailure::QueryRejected)?;
        self.allowlist
            .check_all(validated.tables.iter())
            .map_err(|_| ToolFailure::UnauthorizedTable)?;

        let clamped_sql = clamp_limit(sql, self.row_limit);
        let conn = self.conn.clone();
        let timeout = self.statement_timeout;
        let result = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || -> rusqlite::Result<Vec<Vec<Value>>> {
                let conn = conn.blocking_lock();
                let mut stmt = conn.prepare(&clamped_sql)?;
                let column_count = stmt.column_count();
                let rows = stmt.query_map([], |row| {
                    (0..column_count)
                        .map(|i| sqlite_value_to_json(row, i))
                        .collect::<rusqlite::Result<Vec<Value>>>()
                })?;
                rows.collect()
            }),
        )
        .await;

        match result {
            Ok(Ok(Ok(rows))) => Ok(json!({ "rows": rows })),
            // Any rusqlite error is mapped to the coarse taxonomy; the
            // underlying database message is never surfaced to the caller,
            // only logged at debug level.
            Ok(Ok(Err(db_err))) => {
                tracing::debug!(error = %db_err, "query_read execution error");
                Err(ToolFailure::ExecutionError)
            }
            Ok(Err(join_err)) => {
                tracing::debug!(error = %join_err, "query_read task join error");
                Err(ToolFailure::ExecutionError)
            }
            Err(_elapsed) => Err(ToolFailure::QueryTimeout),
        }
    }

    fn adapter_type(&self) -> &'static str {
        "sqlite"
    }
}

/// Enforces the server-side row cap: a query with no `LIMIT` gets one
/// appended; a query that already carries one is clamped down to whichever
/// is smaller, rather than growing a second `LIMIT` clause onto the end
/// (which SQLite rejects as a syntax error).
fn clamp_limit(sql: &str, row_limit: i64) -> String {
    static EXISTING_LIMIT_RE: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"(?is)\bLIMIT\s+(\d+)\s*$").unwrap());

    match EXISTING_LIMIT_RE.captures(sql) {
        Some(caps) => {
            let existing: i64 = caps[1].parse().unwrap_or(row_limit);
            let clamped = existing.min(row_limit);
            let start = caps.get(0).unwrap().start();
            format!("{}LIMIT {clamped}", &sql[..start])
        }
        None => format!("{sql} LIMIT {row_limit}"),
    }
}

fn sqlite_value_to_json(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    use rusqlite::types::ValueRef;
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => json!(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => json!("<blob>"),
    })
}
