use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Quota dimension. Processing order during `checkAndReserve` is fixed:
/// rate (minute), rate (10s), cost (minute), then concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Dimension {
    RatePerMinute,
    RatePer10Seconds,
    Concurrency,
    CostPerMinute,
}

impl Dimension {
    /// Fixed evaluation order for a single `checkAndReserve` call.
    pub const ORDER: [Dimension; 4] = [
        Dimension::RatePerMinute,
        Dimension::RatePer10Seconds,
        Dimension::CostPerMinute,
        Dimension::Concurrency,
    ];

    pub fn window_ms(self) -> f64 {
        match self {
            Dimension::RatePerMinute | Dimension::CostPerMinute => 60_000.0,
            Dimension::RatePer10Seconds => 10_000.0,
            Dimension::Concurrency => 0.0,
        }
    }
}

/// `{ tenant, identity?, capSetId?, limits }`. Immutable once loaded.
/// *Applies to* a request when every non-null field matches exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaPolicy {
    pub tenant: String,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default, rename = "capSetId")]
    pub cap_set_id: Option<String>,
    pub limits: HashMap<Dimension, u64>,
}

impl QuotaPolicy {
    pub fn applies_to(&self, tenant: &str, identity: &str, cap_set_id: Option<&str>) -> bool {
        if self.tenant != tenant {
            return false;
        }
        if let Some(policy_identity) = &self.identity
            && policy_identity != identity
        {
            return false;
        }
        if let Some(policy_cap_set_id) = &self.cap_set_id
            && Some(policy_cap_set_id.as_str()) != cap_set_id
        {
            return false;
        }
        true
    }
}
