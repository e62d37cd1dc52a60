use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dbward::adapter_sqlite::SqliteAdapter;
use dbward::config::Config;
use dbward::http;
use dbward::wiring;
use dbward_tools::Adapter;

/// `dbward` — a tool-invocation security boundary for a read-only
/// database-access service. Binds identity, tenant, capabilities, and
/// quota policy from the control-plane environment, then serves the three
/// reference tools over a thin HTTP transport.
#[derive(Parser, Debug)]
#[command(name = "dbward", version, about)]
struct Cli {
    /// Path to the read-only SQLite database the reference adapter opens.
    #[arg(long, env = "DBWARD_DATABASE_PATH", default_value = "dbward.sqlite")]
    database_path: String,

    /// Address the reference HTTP transport binds to.
    #[arg(long, env = "DBWARD_LISTEN_ADDR", default_value = "127.0.0.1:8089")]
    listen_addr: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".parse().unwrap());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    tracing::info!(tenant = %config.tenant, deployment = ?config.deployment, "binding control-plane session");

    let state = wiring::build(&config, None)?;
    let allowlist = std::sync::Arc::new(dbward_sql::Allowlist::new(
        config.allowlist_schemas.clone(),
        config.allowlist_tables.clone(),
    ));
    let adapter: Arc<dyn Adapter> = Arc::new(SqliteAdapter::open(
        &cli.database_path,
        allowlist,
        config.orderby_columns.clone(),
    )?);

    let app = http::router(Arc::new(state), adapter);
    let listener = tokio::net::TcpListener::bind(&cli.listen_addr).await?;
    tracing::info!(addr = %cli.listen_addr, "dbward listening");
    axum::serve(listener, app).await?;
    Ok(())
}
