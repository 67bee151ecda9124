//! Raw upstream candles and the canonical OHLCV record.

use crate::normalize::NormalizeError;
use chrono::{DateTime, Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Textual form of `OhlcvRecord::datetime` in both sinks (UTC, second precision).
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One kline tuple exactly as the upstream API returned it.
///
/// Layout: `[open_time_ms, open, high, low, close, volume, ...]`. Everything
/// past the sixth field (close time, quote volume, trade count, ...) is
/// carried along untouched and discarded by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawCandle(pub Vec<Value>);

impl RawCandle {
    /// Epoch-millisecond open time (field 0).
    pub fn open_time(&self) -> Result<i64, NormalizeError> {
        let value = self.field(0)?;
        match value {
            Value::Number(n) => n.as_i64().ok_or_else(|| NormalizeError::FieldType {
                index: 0,
                value: value.to_string(),
            }),
            Value::String(s) => s.trim().parse::<i64>().map_err(|_| NormalizeError::FieldType {
                index: 0,
                value: value.to_string(),
            }),
            other => Err(NormalizeError::FieldType {
                index: 0,
                value: other.to_string(),
            }),
        }
    }

    /// Numeric field that upstream may encode either as a JSON number or a string.
    pub fn price_field(&self, index: usize) -> Result<f64, NormalizeError> {
        let value = self.field(index)?;
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| NormalizeError::FieldType {
            index,
            value: value.to_string(),
        })
    }

    fn field(&self, index: usize) -> Result<&Value, NormalizeError> {
        self.0.get(index).ok_or(NormalizeError::Arity {
            expected: OhlcvRecord::FIELD_COUNT,
            actual: self.0.len(),
        })
    }
}

/// Canonical unit of storage. `datetime` is the unique key within a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvRecord {
    pub datetime: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl OhlcvRecord {
    /// Number of leading raw fields the record is built from.
    pub const FIELD_COUNT: usize = 6;

    /// Column names shared by the archive header and the store tables.
    pub const COLUMNS: [&'static str; 6] = ["datetime", "open", "high", "low", "close", "volume"];

    /// Convert an epoch-millisecond open time to the canonical UTC datetime.
    pub fn datetime_from_millis(open_time_ms: i64) -> Result<NaiveDateTime, NormalizeError> {
        DateTime::from_timestamp_millis(open_time_ms)
            .map(|dt| dt.naive_utc())
            .ok_or(NormalizeError::Timestamp(open_time_ms))
    }

    /// Partition key.
    pub fn year(&self) -> i32 {
        self.datetime.year()
    }

    pub fn datetime_text(&self) -> String {
        self.datetime.format(DATETIME_FORMAT).to_string()
    }
}
