//! Failure policy for upstream fetches.
//!
//! `Stop` ends the run on the first failure, like a source that cannot tell
//! failure from exhaustion, but the run report keeps the two apart.
//! `Retry` repeats transient failures with exponential backoff and equal
//! jitter, never waiting less than the server's `Retry-After`.

use crate::config::{FailureConfig, FailurePolicyKind};
use candlevault_core::SourceError;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum FailurePolicy {
    Stop,
    Retry {
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
    },
}

/// What to do about one failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl FailurePolicy {
    pub fn from_config(cfg: &FailureConfig) -> Self {
        match cfg.policy {
            FailurePolicyKind::Stop => FailurePolicy::Stop,
            FailurePolicyKind::Retry => FailurePolicy::Retry {
                max_retries: cfg.max_retries,
                base_delay: Duration::from_millis(cfg.base_delay_ms),
                max_delay: Duration::from_millis(cfg.max_delay_ms),
            },
        }
    }

    /// Decide after the `failures`-th consecutive failure of the same request.
    pub fn decide(&self, err: &SourceError, failures: u32) -> FailureDecision {
        self.decide_with_jitter(err, failures, rand::thread_rng().gen::<f64>())
    }

    /// `decide` with the jitter sample supplied (in `[0, 1)`).
    pub fn decide_with_jitter(&self, err: &SourceError, failures: u32, jitter: f64) -> FailureDecision {
        match self {
            FailurePolicy::Stop => FailureDecision::GiveUp,
            FailurePolicy::Retry { max_retries, .. } if !err.is_transient() || failures > *max_retries => {
                FailureDecision::GiveUp
            }
            FailurePolicy::Retry {
                base_delay,
                max_delay,
                ..
            } => {
                let backoff = backoff_delay(*base_delay, *max_delay, failures, jitter);
                let floor = Duration::from_secs(err.retry_after_secs().unwrap_or(0));
                FailureDecision::RetryAfter(backoff.max(floor))
            }
        }
    }
}

/// `min(max, base * 2^(failures-1))`, then equal jitter: half fixed, half random.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32, jitter: f64) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    let capped = base.saturating_mul(1u32 << exp).min(max);
    let half = capped / 2;
    half + half.mul_f64(jitter.clamp(0.0, 1.0))
}
