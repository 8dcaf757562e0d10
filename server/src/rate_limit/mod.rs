//! Shared rate limiter (spec.md §4.C), serialized admission per endpoint, a
//! bounded FIFO request queue, and pluggable strategies.

mod allocation;
mod strategy;

pub use allocation::resolve_allocations;
pub use strategy::Strategy;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::config::RateLimitStrategy;
use crate::error::AdapterError;

struct Waiter {
    responder: oneshot::Sender<Result<(), AdapterError>>,
}

struct EndpointLimiter {
    strategy: Strategy,
    mode: RateLimitStrategy,
    queue: Mutex<VecDeque<Waiter>>,
    in_flight: AtomicUsize,
    max_queue_len: usize,
}

impl EndpointLimiter {
    fn queue_depth(&self) -> usize {
        self.queue.lock().len() + self.in_flight.load(Ordering::SeqCst)
    }
}

/// An admitted slot. Dropping it (normally, or via `?` early-return)
/// releases the in-flight count, so a panicking or erroring caller never
/// leaks capacity.
pub struct Permit<'a> {
    limiter: &'a EndpointLimiter,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.limiter.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared across every endpoint of one adapter (spec.md §5 "RateLimiter is
/// per-adapter, shared across endpoints").
pub struct RateLimiter {
    endpoints: HashMap<String, Arc<EndpointLimiter>>,
}

impl RateLimiter {
    /// `allocations` maps lowercase endpoint name to its percentage share of
    /// `total_requests_per_minute`. Spawns one admission pump per endpoint
    /// for the queue-based strategies (fixed-interval / api-credit); burst
    /// endpoints need no pump since admission never blocks.
    pub fn new(
        allocations: &HashMap<String, f64>,
        total_requests_per_minute: f64,
        mode: RateLimitStrategy,
        max_queue_len: usize,
    ) -> Self {
        let mut endpoints = HashMap::new();
        for (name, pct) in allocations {
            let share_rpm = total_requests_per_minute * pct / 100.0;
            let strategy = match mode {
                RateLimitStrategy::Burst => Strategy::burst(share_rpm),
                RateLimitStrategy::FixedInterval => Strategy::fixed_interval(share_rpm),
                RateLimitStrategy::ApiCredit => Strategy::api_credit(share_rpm),
            };
            let limiter = Arc::new(EndpointLimiter {
                strategy,
                mode,
                queue: Mutex::new(VecDeque::new()),
                in_flight: AtomicUsize::new(0),
                max_queue_len,
            });
            if matches!(mode, RateLimitStrategy::FixedInterval | RateLimitStrategy::ApiCredit) {
                spawn_pump(limiter.clone());
            }
            endpoints.insert(name.clone(), limiter);
        }
        Self { endpoints }
    }

    /// Acquire admission for `endpoint`. `cost` is the request's credit cost
    /// (1 for burst/fixed-interval, transport-reported for api-credit).
    pub async fn acquire(&self, endpoint: &str, cost: u32) -> Result<Permit<'_>, AdapterError> {
        let limiter = self
            .endpoints
            .get(endpoint)
            .ok_or_else(|| AdapterError::Internal(format!("no rate limit allocation for endpoint {endpoint:?}")))?;

        match limiter.mode {
            RateLimitStrategy::Burst => {
                if limiter.strategy.try_admit() {
                    limiter.in_flight.fetch_add(1, Ordering::SeqCst);
                    Ok(Permit { limiter: limiter.as_ref() })
                } else {
                    Err(AdapterError::QueueOverflow(format!(
                        "rate limit exhausted for endpoint {endpoint:?}, request queue overflowed"
                    )))
                }
            }
            RateLimitStrategy::FixedInterval | RateLimitStrategy::ApiCredit => {
                let (tx, rx) = oneshot::channel();
                {
                    let mut queue = limiter.queue.lock();
                    if limiter.queue_depth() >= limiter.max_queue_len {
                        if let Some(oldest) = queue.pop_front() {
                            let _ = oldest.responder.send(Err(AdapterError::QueueOverflow(format!(
                                "request queue overflowed for endpoint {endpoint:?}"
                            ))));
                        }
                    }
                    queue.push_back(Waiter { responder: tx });
                }
                rx.await.map_err(|_| AdapterError::Internal("rate limiter pump dropped waiter".into()))??;
                limiter.in_flight.fetch_add(1, Ordering::SeqCst);
                limiter.strategy.consume(cost);
                Ok(Permit { limiter: limiter.as_ref() })
            }
        }
    }
}

/// Background task that serializes admission for one endpoint's
/// queue-based strategy: pop the oldest waiter, sleep until its slot/credits
/// are available, then release it. One task per endpoint, so admission for
/// that endpoint is always serialized (spec.md §5).
fn spawn_pump(limiter: Arc<EndpointLimiter>) {
    tokio::spawn(async move {
        loop {
            let next = limiter.queue.lock().pop_front();
            match next {
                Some(waiter) => {
                    let wait = limiter.strategy.wait_seconds(1);
                    if wait > 0.0 {
                        tokio::time::sleep(std::time::Duration::from_secs_f64(wait)).await;
                    }
                    let _ = waiter.responder.send(Ok(()));
                }
                None => tokio::time::sleep(std::time::Duration::from_millis(25)).await,
            }
        }
    });
}
