//! Regex-only structural validator plus allowlist for the read-only query
//! tool. Deliberately not a SQL parser: the threat model favors a small,
//! auditable rejection surface over permissive parsing. This crate has no
//! knowledge of sessions, capabilities, or quotas — it is a pure function
//! from SQL text to either a rejection or an extracted table/order-by set.

pub mod allowlist;
pub mod validator;

pub use allowlist::{Allowlist, AllowlistError};
pub use validator::{validate, OrderByKey, QualifiedName, ValidatedQuery, ValidationError};
