//! CandleVault Core: candle model, upstream source, normalizer, partitioned sinks.
//!
//! This crate contains everything below the ingestion loop:
//! - Raw upstream tuples and the canonical OHLCV record
//! - The `CandleSource` trait and the Binance klines implementation
//! - Circuit breaker for upstream bans and repeated failures
//! - Batch normalization with keep-last deduplication
//! - Year-partitioned sinks (CSV archive, SQLite store) behind one trait

pub mod candle;
pub mod normalize;
pub mod sink;
pub mod source;

pub use candle::{OhlcvRecord, RawCandle, DATETIME_FORMAT};
pub use normalize::{normalize, NormalizeError};
pub use sink::{
    write_partitioned, CsvArchive, PartitionSink, PartitionWrite, SinkReport, SqliteStore,
    StorageError,
};
pub use source::{
    BinanceSource, CandleSource, CircuitBreaker, FailureKind, FetchRequest, SourceError,
};
