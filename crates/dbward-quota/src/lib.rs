//! Rate, cost, and concurrency enforcement keyed by policy-derived scope
//! strings. `QuotaEngine` implements `dbward_core::QuotaEngineHandle`, the
//! seam the execution boundary calls through.

pub mod bucket;
pub mod engine;
pub mod policy;

pub use bucket::{ConsumeOutcome, Semaphore, TokenBucket};
pub use engine::{QuotaEngine, DEFAULT_MAX_KEYS, DEFAULT_TTL_SECONDS};
pub use policy::{Dimension, QuotaPolicy};
