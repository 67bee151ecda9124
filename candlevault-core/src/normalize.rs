//! Batch normalization: raw upstream tuples → canonical OHLCV records.
//!
//! Projects the first six fields of every tuple, converts the open time to
//! the canonical datetime, and deduplicates by datetime keeping the last
//! occurrence. Output order follows the position of each kept row, so an
//! input sorted by time stays sorted.
//!
//! A tuple that violates the upstream shape contract is not skipped: the
//! whole batch is rejected with a `NormalizeError`, which the ingestion loop
//! treats as fatal.

use crate::candle::{OhlcvRecord, RawCandle};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use thiserror::Error;

/// Upstream payload shape violations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("malformed candle: expected at least {expected} fields, got {actual}")]
    Arity { expected: usize, actual: usize },

    #[error("malformed candle: field {index} is not numeric ({value})")]
    FieldType { index: usize, value: String },

    #[error("malformed candle: open time {0} ms is out of range")]
    Timestamp(i64),
}

/// Normalize one upstream batch.
pub fn normalize(batch: &[RawCandle]) -> Result<Vec<OhlcvRecord>, NormalizeError> {
    let records = batch
        .iter()
        .map(project)
        .collect::<Result<Vec<_>, _>>()?;

    let mut last_index: HashMap<NaiveDateTime, usize> = HashMap::with_capacity(records.len());
    for (i, rec) in records.iter().enumerate() {
        last_index.insert(rec.datetime, i);
    }

    if last_index.len() == records.len() {
        return Ok(records);
    }

    Ok(records
        .into_iter()
        .enumerate()
        .filter(|(i, rec)| last_index.get(&rec.datetime) == Some(i))
        .map(|(_, rec)| rec)
        .collect())
}

fn project(raw: &RawCandle) -> Result<OhlcvRecord, NormalizeError> {
    if raw.0.len() < OhlcvRecord::FIELD_COUNT {
        return Err(NormalizeError::Arity {
            expected: OhlcvRecord::FIELD_COUNT,
            actual: raw.0.len(),
        });
    }

    Ok(OhlcvRecord {
        datetime: OhlcvRecord::datetime_from_millis(raw.open_time()?)?,
        open: raw.price_field(1)?,
        high: raw.price_field(2)?,
        low: raw.price_field(3)?,
        close: raw.price_field(4)?,
        volume: raw.price_field(5)?,
    })
}
