//! Admission strategies (spec.md §4.C "Strategies"). `Burst` rejects
//! immediately when the bucket is dry; `FixedInterval`/`ApiCredit` block the
//! caller until their slot/credits are available.

use std::num::NonZeroU32;
use std::time::Instant;

use governor::{Quota, RateLimiter as GovernorLimiter};
use parking_lot::Mutex;

/// Hand-rolled token bucket generalizing the teacher's
/// `middleware::rate_limit::TokenBucket`, extended to accept a variable
/// per-request cost (needed for the API-credit strategy).
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate_per_sec: f64) -> Self {
        Self { capacity, tokens: capacity, refill_rate_per_sec, last_refill: Instant::now() }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Seconds until `cost` tokens would be available, 0 if already available.
    fn wait_seconds(&mut self, cost: f64) -> f64 {
        self.refill();
        if self.tokens >= cost {
            0.0
        } else {
            (cost - self.tokens) / self.refill_rate_per_sec.max(f64::MIN_POSITIVE)
        }
    }

    fn consume(&mut self, cost: f64) {
        self.refill();
        self.tokens = (self.tokens - cost).max(0.0);
    }
}

/// The per-endpoint admission gate. Owns whichever strategy state the
/// adapter's `RATE_LIMITING_STRATEGY` setting selected.
pub enum Strategy {
    Burst(GovernorLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>),
    FixedInterval(Mutex<TokenBucket>),
    ApiCredit(Mutex<TokenBucket>),
}

impl Strategy {
    pub fn burst(requests_per_minute: f64) -> Self {
        let per_minute = requests_per_minute.max(1.0).round() as u32;
        let burst_size = (per_minute / 10).max(1);
        let quota = Quota::per_minute(NonZeroU32::new(per_minute).unwrap())
            .allow_burst(NonZeroU32::new(burst_size).unwrap());
        Strategy::Burst(GovernorLimiter::direct(quota))
    }

    pub fn fixed_interval(requests_per_minute: f64) -> Self {
        let refill_per_sec = requests_per_minute.max(0.001) / 60.0;
        Strategy::FixedInterval(Mutex::new(TokenBucket::new(1.0, refill_per_sec)))
    }

    pub fn api_credit(credits_per_minute: f64) -> Self {
        let refill_per_sec = credits_per_minute.max(0.001) / 60.0;
        Strategy::ApiCredit(Mutex::new(TokenBucket::new(credits_per_minute.max(1.0), refill_per_sec)))
    }

    /// Burst-only: true if admitted right now, false if the caller should be
    /// rejected instead of queued.
    pub fn try_admit(&self) -> bool {
        match self {
            Strategy::Burst(limiter) => limiter.check().is_ok(),
            _ => true,
        }
    }

    /// Fixed-interval/api-credit: how long the caller must sleep before its
    /// slot/credits are available. `cost` is ignored for fixed-interval
    /// (always 1 request per slot) and honored for api-credit.
    pub fn wait_seconds(&self, cost: u32) -> f64 {
        match self {
            Strategy::FixedInterval(bucket) => bucket.lock().wait_seconds(1.0),
            Strategy::ApiCredit(bucket) => bucket.lock().wait_seconds(cost.max(1) as f64),
            Strategy::Burst(_) => 0.0,
        }
    }

    pub fn consume(&self, cost: u32) {
        match self {
            Strategy::FixedInterval(bucket) => bucket.lock().consume(1.0),
            Strategy::ApiCredit(bucket) => bucket.lock().consume(cost.max(1) as f64),
            Strategy::Burst(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_interval_waits_when_empty() {
        let strategy = Strategy::fixed_interval(60.0); // 1/sec
        assert_eq!(strategy.wait_seconds(1), 0.0);
        strategy.consume(1);
        let wait = strategy.wait_seconds(1);
        assert!(wait > 0.0, "second request within the same second should wait");
    }

    #[test]
    fn api_credit_cost_is_respected() {
        let strategy = Strategy::api_credit(10.0); // capacity 10 credits
        assert_eq!(strategy.wait_seconds(5), 0.0);
        strategy.consume(5);
        assert_eq!(strategy.wait_seconds(5), 0.0);
        strategy.consume(5);
        assert!(strategy.wait_seconds(5) > 0.0);
    }
}
