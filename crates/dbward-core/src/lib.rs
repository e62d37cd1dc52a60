//! Branding, capability evaluation, and the fatal/denial error taxonomies
//! shared by every other `dbward` crate. This crate has no knowledge of
//! quota enforcement, SQL validation, or transports — it defines the seam
//! types (`QuotaEngineHandle`) that those crates implement or consume.

pub mod capability;
pub mod deployment;
pub mod error;
pub mod session;

pub use capability::{evaluate, ActionKind, CapabilitySet, Decision, Grant};
pub use deployment::Deployment;
pub use error::{AuthzReason, DbwardError, DenialCode, QuotaReason};
pub use session::{Bound, QuotaDecision, QuotaEngineHandle, QuotaRequestContext, SessionContext, Unbound};
