//! Candle source trait and structured error types.
//!
//! The `CandleSource` trait abstracts over the upstream klines API so the
//! ingestion loop can run against Binance in production and a scripted
//! source in tests. A source makes exactly one upstream attempt per call;
//! retry and pacing belong to the caller.

pub mod binance;
pub mod circuit_breaker;

pub use binance::BinanceSource;
pub use circuit_breaker::CircuitBreaker;

use crate::candle::RawCandle;
use thiserror::Error;

/// Parameters of one paginated klines query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub symbol: String,
    pub interval: String,
    /// Upper bound on the batch size (upstream caps it at 1000).
    pub limit: u32,
    /// Inclusive lower bound on candle open time, epoch milliseconds.
    pub since: Option<i64>,
}

/// Whether a failed fetch is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeouts, connection failures, 5xx and rate limiting.
    Transient,
    /// Bans, client errors, malformed payloads, tripped breaker.
    Fatal,
}

/// Structured failures of a single upstream call.
///
/// An empty `Ok` batch means the upstream has nothing at or after `since`;
/// every other stop condition is one of these.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("network unreachable: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by upstream (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("upstream refused requests with HTTP {status} (IP ban)")]
    Banned { status: u16 },

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("hard stop: upstream has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("http client error: {0}")]
    Client(String),
}

impl SourceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SourceError::Network(_) | SourceError::Timeout(_) | SourceError::RateLimited { .. } => {
                FailureKind::Transient
            }
            SourceError::HttpStatus { status, .. } if *status >= 500 => FailureKind::Transient,
            _ => FailureKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }

    /// Minimum wait the upstream asked for, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            SourceError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// Paginated access to historical candles.
pub trait CandleSource {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Fetch at most `req.limit` candles with open time `>= req.since`, oldest first.
    ///
    /// An empty batch signals exhaustion.
    fn fetch(&self, req: &FetchRequest) -> Result<Vec<RawCandle>, SourceError>;
}
