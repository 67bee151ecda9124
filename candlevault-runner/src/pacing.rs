//! Token bucket pacing of upstream requests.
//!
//! The bucket holds up to `burst` tokens and refills at
//! `requests_per_second`. Each request takes one token; when the bucket is
//! empty the caller sleeps until a token is available. A rate-limit response
//! from upstream penalizes the bucket so nothing is sent before the server's
//! `Retry-After` has elapsed.

use crate::config::RateLimitConfig;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest hold-off a single penalty can impose.
pub const MAX_PENALTY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Tokens per second; `0.0` disables pacing.
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            rate: requests_per_second.max(0.0),
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
            blocked_until: None,
        }
    }

    /// No pacing; only explicit penalties delay requests.
    pub fn unlimited() -> Self {
        Self::new(0.0, 1)
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self::new(cfg.requests_per_second, cfg.burst)
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0.0
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token if one is available at `now`; otherwise return how long
    /// to wait before asking again.
    pub fn try_acquire_at(&mut self, now: Instant) -> Duration {
        if let Some(until) = self.blocked_until {
            if until > now {
                return until - now;
            }
            self.blocked_until = None;
        }

        if self.is_unlimited() {
            return Duration::ZERO;
        }

        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64((1.0 - self.tokens) / self.rate).unwrap_or(Duration::MAX)
    }

    /// Block until a request may be sent. Returns the total time slept.
    pub fn acquire(&mut self) -> Duration {
        let mut slept = Duration::ZERO;
        loop {
            let wait = self.try_acquire_at(Instant::now());
            if wait.is_zero() {
                return slept;
            }
            debug!(wait_ms = wait.as_millis() as u64, "pacing upstream request");
            std::thread::sleep(wait);
            slept = slept.saturating_add(wait);
        }
    }

    /// Hold off all requests until `now + delay`, capped at `MAX_PENALTY`.
    pub fn penalize_at(&mut self, now: Instant, delay: Duration) {
        if delay > MAX_PENALTY {
            warn!(
                requested_secs = delay.as_secs(),
                cap_secs = MAX_PENALTY.as_secs(),
                "penalty capped"
            );
        }
        let until = now.checked_add(delay.min(MAX_PENALTY)).unwrap_or(now);
        self.blocked_until = Some(match self.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    pub fn penalize(&mut self, delay: Duration) {
        self.penalize_at(Instant::now(), delay);
    }
}
