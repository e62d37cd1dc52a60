use std::collections::{HashMap, HashSet};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use dbward_core::{ActionKind, CapabilitySet, Deployment, Grant};
use dbward_quota::QuotaPolicy;
use serde::Deserialize;

/// JSON shape of the `CAPABILITIES` environment variable:
/// `{capSetId, issuer, issuedAt, expiresAt, grants:[{action,target}]}`.
/// Kept separate from `dbward_core::CapabilitySet` so the core crate's
/// field names stay Rust-idiomatic snake_case while this ambient layer
/// speaks the wire's camelCase.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapabilitySetConfig {
    cap_set_id: String,
    issuer: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    grants: Vec<GrantConfig>,
}

#[derive(Debug, Deserialize)]
struct GrantConfig {
    action: ActionKind,
    target: String,
}

impl From<CapabilitySetConfig> for CapabilitySet {
    fn from(c: CapabilitySetConfig) -> Self {
        CapabilitySet {
            cap_set_id: c.cap_set_id,
            issued_at: c.issued_at,
            expires_at: c.expires_at,
            issuer: c.issuer,
            grants: c
                .grants
                .into_iter()
                .map(|g| Grant {
                    action: g.action,
                    target: g.target,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QuotaPoliciesConfig {
    policies: Vec<QuotaPolicy>,
}

/// Validated, immutable snapshot of the process environment. Built once
/// at startup by [`Config::from_env`]; `identity` and `tenant` come only
/// from this control-plane source, never from request data.
#[derive(Debug, Clone)]
pub struct Config {
    pub identity: String,
    pub tenant: String,
    pub capabilities: CapabilitySet,
    pub quota_policies: Vec<QuotaPolicy>,
    pub read_only: bool,
    pub allowlist_schemas: HashSet<String>,
    pub allowlist_tables: Option<HashMap<String, HashSet<String>>>,
    pub orderby_columns: Option<HashSet<(String, String, String)>>,
    pub deployment: Deployment,
}

impl Config {
    /// Reads and validates the process environment variables. Fails closed: a
    /// present-but-malformed `CAPABILITIES`/`QUOTA_POLICIES` value aborts
    /// startup rather than degrading to an empty, always-deny set that
    /// looks like "no capability" instead of "config error".
    pub fn from_env() -> Result<Config> {
        let identity = required_nonempty("SESSION_IDENTITY")?;
        let tenant = required_nonempty("SESSION_TENANT")?;
        let deployment = parse_deployment();

        let capabilities_raw =
            std::env::var("CAPABILITIES").context("CAPABILITIES environment variable is required")?;
        let capabilities: CapabilitySetConfig = serde_json::from_str(&capabilities_raw)
            .context("CAPABILITIES is not valid JSON for the expected capability-set shape")?;

        let quota_policies = match std::env::var("QUOTA_POLICIES") {
            Ok(raw) => {
                let parsed: QuotaPoliciesConfig = serde_json::from_str(&raw)
                    .context("QUOTA_POLICIES is not valid JSON for the expected policy-list shape")?;
                parsed.policies
            }
            Err(_) if deployment.is_production() => {
                bail!("QUOTA_POLICIES is required in production deployments (fail-closed startup)");
            }
            Err(_) => Vec::new(),
        };

        let read_only = std::env::var("READ_ONLY")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);

        let allowlist_schemas: HashSet<String> = csv_set(std::env::var("ALLOWLIST_SCHEMAS").ok());

        let allowlist_tables = std::env::var("ALLOWLIST_TABLES").ok().map(|raw| {
            let mut map: HashMap<String, HashSet<String>> = HashMap::new();
            for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                if let Some((schema, table)) = entry.split_once('.') {
                    map.entry(schema.to_string())
                        .or_default()
                        .insert(table.to_string());
                }
            }
            map
        });

        let orderby_columns = std::env::var("ORDERBY_COLUMNS").ok().map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|entry| {
                    let mut parts = entry.splitn(3, '.');
                    let schema = parts.next()?;
                    let table = parts.next()?;
                    let column = parts.next()?;
                    Some((schema.to_string(), table.to_string(), column.to_string()))
                })
                .collect::<HashSet<_>>()
        });

        Ok(Config {
            identity,
            tenant,
            capabilities: capabilities.into(),
            quota_policies,
            read_only,
            allowlist_schemas,
            allowlist_tables,
            orderby_columns,
            deployment,
        })
    }
}

fn required_nonempty(key: &str) -> Result<String> {
    let value = std::env::var(key).with_context(|| format!("{key} environment variable is required"))?;
    if value.trim().is_empty() {
        bail!("{key} must not be empty or whitespace");
    }
    Ok(value)
}

fn parse_deployment() -> Deployment {
    match std::env::var("DEPLOYMENT") {
        Ok(v) if v.eq_ignore_ascii_case("production") => Deployment::Production,
        // Never defaults to production: defaulting to the stricter mode
        // would be a silent tightening, which is safe; the reverse would
        // be a silent weakening, which is not.
        _ => Deployment::Development,
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn csv_set(raw: Option<String>) -> HashSet<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
