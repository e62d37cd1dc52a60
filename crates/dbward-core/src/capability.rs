use chrono::{DateTime, Utc};

use crate::error::AuthzReason;

/// Closed set of actions a [`Grant`] can cover. Callers never supply this
/// directly; a tool name only becomes an `action`/`target` pair after the
/// tool registry has already validated it exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    ToolInvoke,
    ToolList,
    ResourceRead,
    ResourceList,
}

/// One capability entry: `action` on `target`. `target` is always an exact
/// string; `"*"` is a literal target, never a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Grant {
    pub action: ActionKind,
    pub target: String,
}

/// Immutable, issued bundle of grants. Constructed once from control-plane
/// configuration and never mutated afterward.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CapabilitySet {
    pub cap_set_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub issuer: String,
    pub grants: Vec<Grant>,
}

impl CapabilitySet {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn find_grant(&self, action: ActionKind, target: &str) -> Option<&Grant> {
        self.grants
            .iter()
            .find(|g| g.action == action && g.target == target)
    }
}

/// Outcome of [`evaluate`]. `allowed == false` always carries a `reason`;
/// `allowed == true` always carries the matching grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<AuthzReason>,
    pub grant: Option<Grant>,
}

impl Decision {
    fn deny(reason: AuthzReason) -> Self {
        Decision {
            allowed: false,
            reason: Some(reason),
            grant: None,
        }
    }

    fn allow(grant: Grant) -> Self {
        Decision {
            allowed: true,
            reason: None,
            grant: Some(grant),
        }
    }
}

/// Pure function: `(capset, action, target) -> allow | deny(reason)`.
///
/// Matching is byte-exact string equality on `target`; there is no wildcard
/// expansion, pattern matching, normalization, or case folding. This
/// function consults no ambient state and takes `now` as an explicit
/// parameter rather than reading the clock itself, so it stays pure and
/// reproducible under test.
pub fn evaluate(
    capset: Option<&CapabilitySet>,
    action: ActionKind,
    target: &str,
    now: DateTime<Utc>,
) -> Decision {
    let Some(capset) = capset else {
        return Decision::deny(AuthzReason::DeniedNoCapability);
    };
    if capset.is_expired(now) {
        return Decision::deny(AuthzReason::DeniedExpired);
    }
    match capset.find_grant(action, target) {
        Some(grant) => Decision::allow(grant.clone()),
        None => Decision::deny(AuthzReason::DeniedNoGrant),
    }
}
