//! Run configuration, loaded from TOML and fixed for the run.
//!
//! Every field has a default, so an empty file (or no file at all) yields
//! the stock five-year BTCUSDT hourly backfill.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Kline intervals accepted by the upstream API.
pub const VALID_INTERVALS: &[&str] = &[
    "1s", "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w",
    "1M",
];

/// Upstream cap on the page size.
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Slowest pacing accepted, short of disabling it with `0`.
pub const MIN_REQUESTS_PER_SECOND: f64 = 1e-3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything one ingestion run needs to know.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    pub symbol: String,
    pub interval: String,
    /// Candles requested per page.
    pub page_limit: u32,
    /// The run starts this many days before now.
    pub lookback_days: u32,
    pub archive_dir: PathBuf,
    pub database_path: PathBuf,
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Scan existing archive rows before appending.
    pub archive_dedup: bool,
    pub rate_limit: RateLimitConfig,
    pub failure: FailureConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".into(),
            interval: "1h".into(),
            page_limit: MAX_PAGE_LIMIT,
            lookback_days: 365 * 5,
            archive_dir: PathBuf::from("data/raw/csv"),
            database_path: PathBuf::from("data/raw/sqlite/candles.db"),
            base_url: candlevault_core::source::binance::DEFAULT_BASE_URL.into(),
            request_timeout_secs: 30,
            archive_dedup: true,
            rate_limit: RateLimitConfig::default(),
            failure: FailureConfig::default(),
        }
    }
}

/// Token bucket pacing of upstream requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained request rate; `0` disables pacing.
    pub requests_per_second: f64,
    /// Requests allowed back-to-back before pacing kicks in.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 1.0,
            burst: 1,
        }
    }
}

/// What the loop does when a fetch fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicyKind {
    /// Log the failure and end the run.
    #[default]
    Stop,
    /// Retry transient failures with backoff; fatal failures still end the run.
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FailureConfig {
    pub policy: FailurePolicyKind,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            policy: FailurePolicyKind::Stop,
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 16_000,
        }
    }
}

impl IngestConfig {
    /// Load a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Reject configurations that would fail upstream or produce unsafe names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.is_empty() || !self.symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::Invalid(format!(
                "symbol must be non-empty ASCII alphanumeric, got '{}'",
                self.symbol
            )));
        }
        if !VALID_INTERVALS.contains(&self.interval.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown interval '{}' (expected one of {})",
                self.interval,
                VALID_INTERVALS.join(", ")
            )));
        }
        if self.page_limit == 0 || self.page_limit > MAX_PAGE_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "page_limit must be in 1..={MAX_PAGE_LIMIT}, got {}",
                self.page_limit
            )));
        }
        if self.lookback_days == 0 {
            return Err(ConfigError::Invalid("lookback_days must be positive".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be positive".into(),
            ));
        }
        let rps = self.rate_limit.requests_per_second;
        if !rps.is_finite() || (rps != 0.0 && rps < MIN_REQUESTS_PER_SECOND) {
            return Err(ConfigError::Invalid(format!(
                "rate_limit.requests_per_second must be 0 (unpaced) or at least \
                 {MIN_REQUESTS_PER_SECOND}, got {rps}"
            )));
        }
        if self.rate_limit.burst == 0 {
            return Err(ConfigError::Invalid("rate_limit.burst must be at least 1".into()));
        }
        if self.failure.base_delay_ms > self.failure.max_delay_ms {
            return Err(ConfigError::Invalid(
                "failure.base_delay_ms must not exceed failure.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_default() {
        let cfg = IngestConfig::from_toml("").unwrap();
        assert_eq!(cfg, IngestConfig::default());
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.lookback_days, 1825);
        assert_eq!(cfg.page_limit, 1000);
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let cfg = IngestConfig::from_toml(
            r#"
            symbol = "ETHUSDT"
            interval = "4h"
            lookback_days = 30

            [rate_limit]
            requests_per_second = 5.0

            [failure]
            policy = "retry"
            max_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.interval, "4h");
        assert_eq!(cfg.lookback_days, 30);
        assert_eq!(cfg.rate_limit.requests_per_second, 5.0);
        assert_eq!(cfg.rate_limit.burst, 1);
        assert_eq!(cfg.failure.policy, FailurePolicyKind::Retry);
        assert_eq!(cfg.failure.max_retries, 5);
        assert_eq!(cfg.failure.base_delay_ms, 500);
    }

    #[test]
    fn rejects_unknown_interval() {
        let cfg = IngestConfig {
            interval: "7h".into(),
            ..IngestConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_page_limit_out_of_range() {
        for limit in [0, 1001] {
            let cfg = IngestConfig {
                page_limit: limit,
                ..IngestConfig::default()
            };
            assert!(cfg.validate().is_err(), "limit {limit} should be rejected");
        }
    }

    #[test]
    fn rejects_symbol_with_punctuation() {
        let cfg = IngestConfig {
            symbol: "BTC-USDT".into(),
            ..IngestConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_vanishing_request_rate() {
        let cfg = IngestConfig::from_toml("[rate_limit]\nrequests_per_second = 1e-20").unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        for rps in [-1.0, f64::NAN] {
            let mut cfg = IngestConfig::default();
            cfg.rate_limit.requests_per_second = rps;
            assert!(cfg.validate().is_err(), "rate {rps} should be rejected");
        }

        let mut unpaced = IngestConfig::default();
        unpaced.rate_limit.requests_per_second = 0.0;
        assert!(unpaced.validate().is_ok());
    }

    #[test]
    fn rejects_bad_toml() {
        assert!(matches!(
            IngestConfig::from_toml("page_limit = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn default_round_trips_through_toml() {
        let text = IngestConfig::default().to_toml().unwrap();
        let back = IngestConfig::from_toml(&text).unwrap();
        assert_eq!(back, IngestConfig::default());
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = IngestConfig::from_file(Path::new("/nonexistent/candlevault.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
