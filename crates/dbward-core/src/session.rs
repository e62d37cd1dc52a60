use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::capability::{ActionKind, CapabilitySet};
use crate::error::{DbwardError, QuotaReason};

/// Zero-sized, module-private marker. `Brand` is constructible only inside
/// this module, so any `SessionContext` a caller holds was necessarily
/// produced by [`SessionContext::new`] — there is no runtime predicate to
/// forge, the type system rules it out.
#[derive(Debug, Clone, Copy)]
struct Brand(());

/// Caller-facing identifier for a request, handed to `checkAndReserve` and
/// the audit sink. Deliberately tiny: no ambient clock or config reads.
#[derive(Debug, Clone)]
pub struct QuotaRequestContext {
    pub tenant: String,
    pub identity: String,
    pub session_id: String,
    pub cap_set_id: Option<String>,
    pub action: ActionKind,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub reason: Option<QuotaReason>,
    pub semaphore_key: Option<String>,
}

/// Seam between `dbward-core` and the quota engine implementation in
/// `dbward-quota`. Defined here (rather than the other way around) so the
/// branding/capability types stay free of the quota crate's dependency.
pub trait QuotaEngineHandle: Send + Sync + std::fmt::Debug {
    fn check_and_reserve(&self, ctx: &QuotaRequestContext) -> QuotaDecision;
    fn release(&self, semaphore_key: &str);
}

/// A session that has not yet been bound to a principal. The only thing
/// that can be done with it is call [`SessionContext::bind`].
#[derive(Debug)]
pub struct Unbound {
    brand: Brand,
}

/// A session bound to `(identity, tenant, sessionId)`. Structural fields
/// are immutable from this point on; `capabilities` and `quota_engine` are
/// each attachable at most once.
#[derive(Debug)]
pub struct Bound {
    brand: Brand,
    identity: String,
    tenant: String,
    session_id: String,
    bound_at: DateTime<Utc>,
    capabilities: Option<CapabilitySet>,
    quota_engine: Option<Arc<dyn QuotaEngineHandle>>,
}

/// One-shot session state machine, per the design notes: a sum type with
/// `Unbound` and `Bound` variants rather than a boolean flag plus asserts.
#[derive(Debug)]
pub enum SessionContext {
    Unbound(Unbound),
    Bound(Bound),
}

impl SessionContext {
    /// Creates a fresh, unbound, branded instance.
    pub fn new() -> Self {
        SessionContext::Unbound(Unbound { brand: Brand(()) })
    }

    /// Transitions `Unbound -> Bound`. `identity` and `tenant` must come
    /// only from control-plane configuration, never from request data —
    /// that contract is enforced by the caller (the config loader), not by
    /// this function's signature.
    pub fn bind(
        self,
        identity: impl Into<String>,
        tenant: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Result<Self, DbwardError> {
        let unbound = match self {
            SessionContext::Unbound(u) => u,
            SessionContext::Bound(_) => return Err(DbwardError::Rebinding),
        };
        let identity = identity.into();
        let tenant = tenant.into();
        if identity.trim().is_empty() || tenant.trim().is_empty() {
            return Err(DbwardError::InvalidField);
        }
        Ok(SessionContext::Bound(Bound {
            brand: unbound.brand,
            identity,
            tenant,
            session_id: session_id.into(),
            bound_at: Utc::now(),
            capabilities: None,
            quota_engine: None,
        }))
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, SessionContext::Bound(_))
    }

    fn bound(&self) -> Result<&Bound, DbwardError> {
        match self {
            SessionContext::Bound(b) => Ok(b),
            SessionContext::Unbound(_) => Err(DbwardError::UnboundAccess),
        }
    }

    fn bound_mut(&mut self) -> Result<&mut Bound, DbwardError> {
        match self {
            SessionContext::Bound(b) => Ok(b),
            SessionContext::Unbound(_) => Err(DbwardError::UnboundAccess),
        }
    }

    pub fn attach_capabilities(&mut self, capabilities: CapabilitySet) -> Result<(), DbwardError> {
        let bound = self.bound_mut()?;
        if bound.capabilities.is_some() {
            return Err(DbwardError::AttachAfterBind);
        }
        bound.capabilities = Some(capabilities);
        Ok(())
    }

    pub fn attach_quota_engine(
        &mut self,
        quota_engine: Arc<dyn QuotaEngineHandle>,
    ) -> Result<(), DbwardError> {
        let bound = self.bound_mut()?;
        if bound.quota_engine.is_some() {
            return Err(DbwardError::AttachAfterBind);
        }
        bound.quota_engine = Some(quota_engine);
        Ok(())
    }

    pub fn identity(&self) -> Result<&str, DbwardError> {
        self.bound().map(|b| b.identity.as_str())
    }

    pub fn tenant(&self) -> Result<&str, DbwardError> {
        self.bound().map(|b| b.tenant.as_str())
    }

    pub fn session_id(&self) -> Result<&str, DbwardError> {
        self.bound().map(|b| b.session_id.as_str())
    }

    pub fn bound_at(&self) -> Result<DateTime<Utc>, DbwardError> {
        self.bound().map(|b| b.bound_at)
    }

    pub fn has_capabilities(&self) -> bool {
        self.bound().is_ok_and(|b| b.capabilities.is_some())
    }

    pub fn has_quota_engine(&self) -> bool {
        self.bound().is_ok_and(|b| b.quota_engine.is_some())
    }

    pub fn capabilities(&self) -> Result<Option<&CapabilitySet>, DbwardError> {
        self.bound().map(|b| b.capabilities.as_ref())
    }

    pub fn quota_engine(&self) -> Result<Option<&Arc<dyn QuotaEngineHandle>>, DbwardError> {
        self.bound().map(|b| b.quota_engine.as_ref())
    }

    /// Every value of type `SessionContext` in safe Rust was produced by
    /// [`SessionContext::new`] — the `Brand` field is private and
    /// unconstructable elsewhere, so this always holds. Kept as an explicit
    /// predicate (rather than deleted) so call sites that receive a session
    /// through an FFI or deserialization boundary have a place to assert
    /// the brand.
    pub fn is_valid(session: &SessionContext) -> bool {
        match session {
            SessionContext::Unbound(u) => matches!(u.brand, Brand(())),
            SessionContext::Bound(b) => matches!(b.brand, Brand(())),
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_unbound() {
        let s = SessionContext::new();
        assert!(!s.is_bound());
        assert!(SessionContext::is_valid(&s));
    }

    #[test]
    fn bind_succeeds_once() {
        let s = SessionContext::new();
        let s = s.bind("u@x", "t1", "sess-1").unwrap();
        assert!(s.is_bound());
        assert_eq!(s.identity().unwrap(), "u@x");
        assert_eq!(s.tenant().unwrap(), "t1");
    }

    #[test]
    fn rebinding_fails() {
        let s = SessionContext::new().bind("u@x", "t1", "sess-1").unwrap();
        let err = s.bind("u2@x", "t2", "sess-2").unwrap_err();
        assert!(matches!(err, DbwardError::Rebinding));
    }

    #[test]
    fn blank_identity_fails() {
        let s = SessionContext::new();
        let err = s.bind("   ", "t1", "sess-1").unwrap_err();
        assert!(matches!(err, DbwardError::InvalidField));
    }

    #[test]
    fn accessors_fail_before_bind() {
        let s = SessionContext::new();
        assert!(matches!(s.identity(), Err(DbwardError::UnboundAccess)));
    }

    #[test]
    fn attach_capabilities_once_only() {
        let mut s = SessionContext::new().bind("u@x", "t1", "sess-1").unwrap();
        let cs = CapabilitySet {
            cap_set_id: "cs1".into(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            issuer: "control-plane".into(),
            grants: vec![],
        };
        s.attach_capabilities(cs.clone()).unwrap();
        assert!(s.has_capabilities());
        let err = s.attach_capabilities(cs).unwrap_err();
        assert!(matches!(err, DbwardError::AttachAfterBind));
    }

    #[test]
    fn attach_before_bind_fails() {
        let mut s = SessionContext::new();
        let cs = CapabilitySet {
            cap_set_id: "cs1".into(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            issuer: "control-plane".into(),
            grants: vec![],
        };
        let err = s.attach_capabilities(cs).unwrap_err();
        assert!(matches!(err, DbwardError::UnboundAccess));
    }
}
