use thiserror::Error;

/// Fatal invariant violations. These never degrade to a [`DenialCode`] — per
/// design, a logic error at this layer terminates the request rather than
/// being reported as a policy decision.
#[derive(Debug, Error)]
pub enum DbwardError {
    #[error("session is already bound")]
    Rebinding,
    #[error("identity and tenant must be non-empty")]
    InvalidField,
    #[error("capabilities or quota engine already attached")]
    AttachAfterBind,
    #[error("operation requires a bound session")]
    UnboundAccess,
    #[error("session value did not originate from the legitimate constructor")]
    UnbrandedSession,
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Stable, machine-readable denial codes returned to callers. Never carries
/// diagnostic text; the accompanying sub-reason (if any) is the most detail
/// a caller ever sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialCode {
    SessionContextInvalid,
    ToolNotFound,
    ReadOnly,
    Unauthorized,
    RateLimited,
    InvalidInput,
    QueryRejected,
    UnauthorizedTable,
    QueryTimeout,
    ExecutionError,
    AuditFailure,
}

/// Sub-reason for [`DenialCode::Unauthorized`], produced by the capability
/// evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthzReason {
    DeniedUnknownAction,
    DeniedNoCapability,
    DeniedExpired,
    DeniedNoGrant,
}

/// Sub-reason for [`DenialCode::RateLimited`], produced by the quota engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuotaReason {
    PolicyMissing,
    PolicyAmbiguous,
    RateExceeded,
    CostExceeded,
    ConcurrencyExceeded,
    CounterError,
    ClockAmbiguity,
}
