use chrono::{DateTime, Utc};

/// Outcome of a single consume attempt, distinguishing insufficient tokens
/// from clock regression so callers can pick the right denial reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed,
    Insufficient,
    ClockRegressed,
}

/// Continuous-refill token bucket. `tokens` is a float so fractional refill
/// between attempts is never lost to rounding.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    window_ms: f64,
    tokens: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64, window_ms: f64, now: DateTime<Utc>) -> Self {
        TokenBucket {
            capacity,
            refill_rate,
            window_ms,
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Refills based on elapsed time, then attempts to subtract `amount`.
    /// `now < last_refill` fails closed rather than refilling a negative
    /// elapsed duration into free tokens.
    pub fn try_consume(&mut self, amount: f64, now: DateTime<Utc>) -> ConsumeOutcome {
        if now < self.last_refill {
            return ConsumeOutcome::ClockRegressed;
        }
        let elapsed_ms = (now - self.last_refill).num_milliseconds() as f64;
        self.tokens = (self.tokens + elapsed_ms / self.window_ms * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= amount {
            self.tokens -= amount;
            ConsumeOutcome::Consumed
        } else {
            ConsumeOutcome::Insufficient
        }
    }
}

/// Binary/counting semaphore for the concurrency dimension.
#[derive(Debug, Clone)]
pub struct Semaphore {
    max_concurrent: u32,
    current: u32,
}

impl Semaphore {
    pub fn new(max_concurrent: u32) -> Self {
        Semaphore {
            max_concurrent,
            current: 0,
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        if self.current < self.max_concurrent {
            self.current += 1;
            true
        } else {
            false
        }
    }

    pub fn release(&mut self) {
        if self.current > 0 {
            self.current -= 1;
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }
}
