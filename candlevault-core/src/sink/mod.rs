//! Year-partitioned, idempotent sinks.
//!
//! Both sinks sit behind `PartitionSink`, keyed by `(year, datetime)`.
//! `write_partitioned` owns the shared behavior: group a batch by calendar
//! year, hand each year to the backend, and contain per-year failures so one
//! bad partition never aborts its siblings.

pub mod archive;
pub mod store;

pub use archive::CsvArchive;
pub use store::SqliteStore;

use crate::candle::OhlcvRecord;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid table identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("archive file {path} has unexpected header: {found}")]
    ArchiveHeader { path: String, found: String },
}

/// Outcome of writing one year partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionWrite {
    pub year: i32,
    /// Rows newly persisted.
    pub written: usize,
    /// Rows whose datetime was already present.
    pub skipped: usize,
}

/// A storage backend that accepts one year's records at a time.
pub trait PartitionSink {
    /// Human-readable name used in logs and reports.
    fn name(&self) -> &str;

    /// Persist `records`, all of which fall in `year`.
    ///
    /// Records whose datetime already exists in the partition must be
    /// skipped without affecting the others.
    fn write_partition(
        &mut self,
        year: i32,
        records: &[OhlcvRecord],
    ) -> Result<PartitionWrite, StorageError>;
}

/// Per-sink summary of one batch (or, accumulated, of a whole run).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkReport {
    pub sink: String,
    pub partitions: Vec<PartitionWrite>,
    /// `(year, error message)` for every partition that failed.
    pub failures: Vec<(i32, String)>,
}

impl SinkReport {
    pub fn written(&self) -> usize {
        self.partitions.iter().map(|p| p.written).sum()
    }

    pub fn skipped(&self) -> usize {
        self.partitions.iter().map(|p| p.skipped).sum()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fold another report for the same sink into this one.
    pub fn absorb(&mut self, other: SinkReport) {
        if self.sink.is_empty() {
            self.sink = other.sink;
        }
        self.partitions.extend(other.partitions);
        self.failures.extend(other.failures);
    }
}

/// Group records by calendar year, ascending, preserving order within a year.
pub fn partition_by_year(records: &[OhlcvRecord]) -> BTreeMap<i32, Vec<OhlcvRecord>> {
    let mut by_year: BTreeMap<i32, Vec<OhlcvRecord>> = BTreeMap::new();
    for rec in records {
        by_year.entry(rec.year()).or_default().push(rec.clone());
    }
    by_year
}

/// Write a batch through `sink`, one call per year partition.
///
/// Failures are logged and recorded in the report; they never propagate.
pub fn write_partitioned(sink: &mut dyn PartitionSink, records: &[OhlcvRecord]) -> SinkReport {
    let mut report = SinkReport {
        sink: sink.name().to_string(),
        ..SinkReport::default()
    };

    for (year, year_records) in partition_by_year(records) {
        match sink.write_partition(year, &year_records) {
            Ok(outcome) => {
                info!(
                    sink = %report.sink,
                    year,
                    written = outcome.written,
                    skipped = outcome.skipped,
                    "partition saved"
                );
                report.partitions.push(outcome);
            }
            Err(e) => {
                warn!(sink = %report.sink, year, error = %e, "partition write failed");
                report.failures.push((year, e.to_string()));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(y: i32, m: u32, d: u32, close: f64) -> OhlcvRecord {
        OhlcvRecord {
            datetime: NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    /// In-memory sink that fails for one configured year.
    struct FlakySink {
        fail_year: i32,
        seen: Vec<(i32, usize)>,
    }

    impl PartitionSink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }

        fn write_partition(
            &mut self,
            year: i32,
            records: &[OhlcvRecord],
        ) -> Result<PartitionWrite, StorageError> {
            self.seen.push((year, records.len()));
            if year == self.fail_year {
                return Err(StorageError::InvalidIdentifier(format!("t_{year}")));
            }
            Ok(PartitionWrite {
                year,
                written: records.len(),
                skipped: 0,
            })
        }
    }

    #[test]
    fn groups_by_year_in_order() {
        let records = vec![
            record(2023, 12, 31, 1.0),
            record(2024, 1, 1, 2.0),
            record(2023, 12, 30, 3.0),
        ];
        let parts = partition_by_year(&records);
        let years: Vec<i32> = parts.keys().copied().collect();
        assert_eq!(years, vec![2023, 2024]);
        assert_eq!(parts[&2023].len(), 2);
        assert_eq!(parts[&2023][0].close, 1.0);
        assert_eq!(parts[&2023][1].close, 3.0);
    }

    #[test]
    fn failing_partition_does_not_abort_siblings() {
        let mut sink = FlakySink {
            fail_year: 2023,
            seen: Vec::new(),
        };
        let records = vec![
            record(2022, 6, 1, 1.0),
            record(2023, 6, 1, 2.0),
            record(2024, 6, 1, 3.0),
        ];
        let report = write_partitioned(&mut sink, &records);

        assert_eq!(sink.seen, vec![(2022, 1), (2023, 1), (2024, 1)]);
        assert_eq!(report.written(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, 2023);
        assert!(!report.all_succeeded());
    }

    #[test]
    fn absorb_accumulates() {
        let mut total = SinkReport::default();
        total.absorb(SinkReport {
            sink: "a".into(),
            partitions: vec![PartitionWrite {
                year: 2023,
                written: 3,
                skipped: 1,
            }],
            failures: vec![],
        });
        total.absorb(SinkReport {
            sink: "a".into(),
            partitions: vec![PartitionWrite {
                year: 2024,
                written: 2,
                skipped: 0,
            }],
            failures: vec![(2025, "boom".into())],
        });
        assert_eq!(total.sink, "a");
        assert_eq!(total.written(), 5);
        assert_eq!(total.skipped(), 1);
        assert_eq!(total.failures.len(), 1);
    }
}
