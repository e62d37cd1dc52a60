use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dbward_core::{QuotaDecision, QuotaEngineHandle, QuotaReason, QuotaRequestContext};

use crate::bucket::{ConsumeOutcome, Semaphore, TokenBucket};
use crate::policy::{Dimension, QuotaPolicy};

pub const DEFAULT_MAX_KEYS: usize = 10_000;
pub const DEFAULT_TTL_SECONDS: i64 = 3_600;

struct QuotaState {
    rate_buckets: HashMap<String, TokenBucket>,
    cost_buckets: HashMap<String, TokenBucket>,
    semaphores: HashMap<String, Semaphore>,
    last_access: HashMap<String, DateTime<Utc>>,
}

impl QuotaState {
    fn new() -> Self {
        QuotaState {
            rate_buckets: HashMap::new(),
            cost_buckets: HashMap::new(),
            semaphores: HashMap::new(),
            last_access: HashMap::new(),
        }
    }

    fn total_keys(&self) -> usize {
        self.rate_buckets.len() + self.cost_buckets.len() + self.semaphores.len()
    }

    fn evict_stale(&mut self, now: DateTime<Utc>, ttl: ChronoDuration) {
        let cutoff = now - ttl;
        let stale: Vec<String> = self
            .last_access
            .iter()
            .filter(|(_, &seen)| seen < cutoff)
            .map(|(k, _)| k.clone())
            .filter(|k| {
                // never evict a semaphore that is still in use
                self.semaphores.get(k).map(|s| s.current() == 0).unwrap_or(true)
            })
            .collect();
        for key in stale {
            self.rate_buckets.remove(&key);
            self.cost_buckets.remove(&key);
            self.semaphores.remove(&key);
            self.last_access.remove(&key);
        }
    }
}

/// In-process quota engine: token buckets for rate/cost dimensions plus
/// semaphores for concurrency, all keyed by a policy-derived scope string
/// and guarded by a single mutex. `checkAndReserve`/`release` are
/// synchronous and never suspend, per the concurrency model: the whole
/// operation (policy match, bucket fetch, consume, acquire) executes under
/// one critical section, never per-key locks.
pub struct QuotaEngine {
    policies: Vec<QuotaPolicy>,
    cost_table: HashMap<String, u64>,
    max_keys: usize,
    ttl: ChronoDuration,
    state: Mutex<QuotaState>,
}

impl std::fmt::Debug for QuotaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaEngine")
            .field("policies", &self.policies.len())
            .field("max_keys", &self.max_keys)
            .finish()
    }
}

impl QuotaEngine {
    pub fn new(policies: Vec<QuotaPolicy>, cost_table: HashMap<String, u64>) -> Self {
        Self::with_limits(policies, cost_table, DEFAULT_MAX_KEYS, DEFAULT_TTL_SECONDS)
    }

    pub fn with_limits(
        policies: Vec<QuotaPolicy>,
        cost_table: HashMap<String, u64>,
        max_keys: usize,
        ttl_seconds: i64,
    ) -> Self {
        QuotaEngine {
            policies,
            cost_table,
            max_keys,
            ttl: ChronoDuration::seconds(ttl_seconds),
            state: Mutex::new(QuotaState::new()),
        }
    }

    /// Empty engine for development deployments with no configured policies.
    /// Every `checkAndReserve` call then denies `POLICY_MISSING`, matching
    /// the "no quotas configured means fail closed" decision.
    pub fn empty() -> Self {
        Self::new(Vec::new(), HashMap::new())
    }

    fn tool_cost(&self, target: &str) -> f64 {
        self.cost_table.get(target).copied().unwrap_or(1) as f64
    }

    fn find_policy(
        &self,
        tenant: &str,
        identity: &str,
        cap_set_id: Option<&str>,
    ) -> Result<&QuotaPolicy, QuotaReason> {
        let matches: Vec<&QuotaPolicy> = self
            .policies
            .iter()
            .filter(|p| p.applies_to(tenant, identity, cap_set_id))
            .collect();
        match matches.as_slice() {
            [] => Err(QuotaReason::PolicyMissing),
            [single] => Ok(*single),
            _ => Err(QuotaReason::PolicyAmbiguous),
        }
    }

    fn scope_key(ctx: &QuotaRequestContext, policy: &QuotaPolicy) -> String {
        let mut key = format!("tenant:{}", ctx.tenant);
        if policy.identity.is_some() {
            key.push_str(&format!(":identity:{}", ctx.identity));
        }
        if policy.cap_set_id.is_some() {
            key.push_str(&format!(
                ":capset:{}",
                ctx.cap_set_id.as_deref().unwrap_or("")
            ));
        }
        key.push_str(&format!(":action:{:?}:target:{}", ctx.action, ctx.target));
        key
    }

    pub fn check_and_reserve_at(
        &self,
        ctx: &QuotaRequestContext,
        now: DateTime<Utc>,
    ) -> QuotaDecision {
        if ctx.tenant.is_empty() || ctx.target.is_empty() {
            return deny(QuotaReason::PolicyAmbiguous);
        }

        let policy = match self.find_policy(&ctx.tenant, &ctx.identity, ctx.cap_set_id.as_deref()) {
            Ok(policy) => policy,
            Err(reason) => return deny(reason),
        };

        let scope_key = Self::scope_key(ctx, policy);
        let mut state = self.state.lock().expect("quota state mutex poisoned");
        let mut semaphore_key = None;

        for dim in Dimension::ORDER {
            let Some(&limit) = policy.limits.get(&dim) else {
                continue;
            };

            match dim {
                Dimension::RatePerMinute | Dimension::RatePer10Seconds | Dimension::CostPerMinute => {
                    let prefix = if dim == Dimension::CostPerMinute { "cost" } else { "rate" };
                    let key = format!("{prefix}:{scope_key}:{dim:?}");
                    if !state.rate_buckets.contains_key(&key)
                        && !state.cost_buckets.contains_key(&key)
                        && state.total_keys() + 1 > self.max_keys
                    {
                        state.evict_stale(now, self.ttl);
                        if state.total_keys() + 1 > self.max_keys {
                            tracing::warn!(max_keys = self.max_keys, dimension = ?dim, "quota key cap exhausted after eviction");
                            return deny(QuotaReason::CounterError);
                        }
                    }
                    let map = if dim == Dimension::CostPerMinute {
                        &mut state.cost_buckets
                    } else {
                        &mut state.rate_buckets
                    };
                    let bucket = map
                        .entry(key.clone())
                        .or_insert_with(|| TokenBucket::new(limit as f64, limit as f64, dim.window_ms(), now));
                    let amount = if dim == Dimension::CostPerMinute {
                        self.tool_cost(&ctx.target)
                    } else {
                        1.0
                    };
                    match bucket.try_consume(amount, now) {
                        ConsumeOutcome::Consumed => {
                            state.last_access.insert(key, now);
                        }
                        ConsumeOutcome::Insufficient => {
                            return deny(if dim == Dimension::CostPerMinute {
                                QuotaReason::CostExceeded
                            } else {
                                QuotaReason::RateExceeded
                            });
                        }
                        ConsumeOutcome::ClockRegressed => return deny(QuotaReason::ClockAmbiguity),
                    }
                }
                Dimension::Concurrency => {
                    let key = format!("sem:{scope_key}");
                    if !state.semaphores.contains_key(&key) && state.total_keys() + 1 > self.max_keys {
                        state.evict_stale(now, self.ttl);
                        if state.total_keys() + 1 > self.max_keys {
                            tracing::warn!(max_keys = self.max_keys, "quota key cap exhausted after eviction");
                            return deny(QuotaReason::CounterError);
                        }
                    }
                    let sem = state
                        .semaphores
                        .entry(key.clone())
                        .or_insert_with(|| Semaphore::new(limit as u32));
                    if sem.try_acquire() {
                        state.last_access.insert(key.clone(), now);
                        semaphore_key = Some(key);
                    } else {
                        return deny(QuotaReason::ConcurrencyExceeded);
                    }
                }
            }
        }

        QuotaDecision {
            allowed: true,
            reason: None,
            semaphore_key,
        }
    }

    pub fn release_key(&self, semaphore_key: &str) {
        let mut state = self.state.lock().expect("quota state mutex poisoned");
        if let Some(sem) = state.semaphores.get_mut(semaphore_key) {
            sem.release();
        }
    }
}

fn deny(reason: QuotaReason) -> QuotaDecision {
    QuotaDecision {
        allowed: false,
        reason: Some(reason),
        semaphore_key: None,
    }
}

impl QuotaEngineHandle for QuotaEngine {
    fn check_and_reserve(&self, ctx: &QuotaRequestContext) -> QuotaDecision {
        self.check_and_reserve_at(ctx, Utc::now())
    }

    fn release(&self, semaphore_key: &str) {
        self.release_key(semaphore_key);
    }
}
