//! CandleVault Runner: the ingestion loop and everything that configures it.
//!
//! This crate builds on `candlevault-core` to provide:
//! - TOML run configuration with validated defaults
//! - Token bucket pacing of upstream requests
//! - Stop/retry failure policy with exponential backoff
//! - The cursor-driven ingestion state machine and its run report

pub mod config;
pub mod ingest;
pub mod pacing;
pub mod policy;

pub use config::{ConfigError, FailureConfig, FailurePolicyKind, IngestConfig, RateLimitConfig};
pub use ingest::{BatchSummary, Cursor, IngestError, IngestLoop, IngestReport, Step, StopReason};
pub use pacing::RateLimiter;
pub use policy::{backoff_delay, FailureDecision, FailurePolicy};
