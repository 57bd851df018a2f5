//! Continuous-refill token bucket
//!
//! One bucket per key, created on the key's first selection. Capacity equals
//! the key's requests-per-minute limit and tokens accrue continuously at
//! `rpm_limit / 60` per second, so sustained throughput converges to the
//! configured rate while bursts up to capacity are admitted immediately
//! after idle periods.

use std::time::Instant;

/// Token bucket bounding request admission for a single key.
///
/// Tokens are fractional; `rpm_limit = 60` refills at exactly one token per
/// second. The struct itself is unsynchronized - the pool performs
/// refill+check+subtract inside its own critical section, which keeps the
/// sequence atomic with respect to concurrent callers.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    fill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket for the given requests-per-minute limit. Starts full.
    pub fn new(rpm_limit: u32) -> Self {
        Self::new_at(rpm_limit, Instant::now())
    }

    fn new_at(rpm_limit: u32, now: Instant) -> Self {
        let capacity = f64::from(rpm_limit);
        Self {
            capacity,
            fill_rate: capacity / 60.0,
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Recompute the token count from elapsed time, capped at capacity.
    /// An instant at or before `last_refill` is a no-op, so the refill
    /// point never moves backwards.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.fill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Try to take `n` tokens right now.
    pub fn try_consume(&mut self, n: f64) -> bool {
        self.try_consume_at(n, Instant::now())
    }

    /// Try to take `n` tokens at `now`: refill first, then subtract only if
    /// the full amount is available. A refused probe debits nothing.
    pub fn try_consume_at(&mut self, n: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Tokens that would be available at `now`, without consuming.
    pub fn available_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.fill_rate).min(self.capacity)
    }

    /// Maximum burst size (the configured rpm limit).
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}
