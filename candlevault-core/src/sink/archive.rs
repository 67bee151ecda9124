//! CSV archive with Hive-style partitioning.
//!
//! Layout: `{root}/symbol={SYMBOL}/interval={INTERVAL}/{year}.csv`
//!
//! - Append-only: existing rows are never rewritten.
//! - The header `datetime,open,high,low,close,volume` is written only when
//!   the file is created (or found empty).
//! - With dedup enabled, a year's existing `datetime` column is scanned on
//!   the first write to that year and kept in memory afterwards; rows already
//!   present are skipped. The archive assumes it is the file's only writer
//!   for its lifetime. With dedup disabled the archive is at-least-once and
//!   consumers must deduplicate.

use super::{PartitionSink, PartitionWrite, StorageError};
use crate::candle::OhlcvRecord;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// One archive row, in header order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRow {
    pub datetime: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<&OhlcvRecord> for ArchiveRow {
    fn from(rec: &OhlcvRecord) -> Self {
        Self {
            datetime: rec.datetime_text(),
            open: rec.open,
            high: rec.high,
            low: rec.low,
            close: rec.close,
            volume: rec.volume,
        }
    }
}

pub struct CsvArchive {
    root: PathBuf,
    symbol: String,
    interval: String,
    dedup: bool,
    /// Keys known to be in each year's file, loaded on first write.
    known: HashMap<i32, HashSet<String>>,
}

impl CsvArchive {
    pub fn new(
        root: impl Into<PathBuf>,
        symbol: impl Into<String>,
        interval: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            symbol: symbol.into(),
            interval: interval.into(),
            dedup: true,
            known: HashMap::new(),
        }
    }

    /// Toggle the pre-append key scan.
    pub fn with_dedup(mut self, dedup: bool) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{root}/symbol={SYMBOL}/interval={INTERVAL}/`
    pub fn partition_dir(&self) -> PathBuf {
        self.root
            .join(format!("symbol={}", self.symbol))
            .join(format!("interval={}", self.interval))
    }

    /// `{partition_dir}/{year}.csv`
    pub fn year_path(&self, year: i32) -> PathBuf {
        self.partition_dir().join(format!("{year}.csv"))
    }

    /// Years that have an archive file, ascending.
    pub fn partition_years(&self) -> Result<Vec<i32>, StorageError> {
        let dir = self.partition_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut years = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            if let Some(year) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i32>().ok())
            {
                years.push(year);
            }
        }
        years.sort_unstable();
        Ok(years)
    }

    /// Data rows (header excluded) in a year's file; zero if absent.
    pub fn row_count(&self, year: i32) -> Result<usize, StorageError> {
        Ok(self.read_rows(year)?.len())
    }

    /// All rows of a year's file, in file order.
    pub fn read_rows(&self, year: i32) -> Result<Vec<ArchiveRow>, StorageError> {
        let path = self.year_path(year);
        if !has_content(&path)? {
            return Ok(Vec::new());
        }
        let mut rdr = csv::Reader::from_path(&path)?;
        check_header(&path, &mut rdr)?;
        rdr.deserialize()
            .collect::<Result<Vec<ArchiveRow>, _>>()
            .map_err(StorageError::from)
    }

    /// Number of keys held in memory for `year`, if that year has been loaded.
    pub fn cached_keys(&self, year: i32) -> Option<usize> {
        self.known.get(&year).map(HashSet::len)
    }

    fn existing_keys(&self, path: &Path) -> Result<HashSet<String>, StorageError> {
        let mut rdr = csv::Reader::from_path(path)?;
        check_header(path, &mut rdr)?;
        let mut keys = HashSet::new();
        for row in rdr.records() {
            if let Some(dt) = row?.get(0) {
                keys.insert(dt.to_string());
            }
        }
        Ok(keys)
    }
}

impl PartitionSink for CsvArchive {
    fn name(&self) -> &str {
        "csv_archive"
    }

    fn write_partition(
        &mut self,
        year: i32,
        records: &[OhlcvRecord],
    ) -> Result<PartitionWrite, StorageError> {
        let result = self.append(year, records);
        if result.is_err() {
            // What reached the file is unknown; rescan on the next write.
            self.known.remove(&year);
        }
        result
    }
}

impl CsvArchive {
    fn append(&mut self, year: i32, records: &[OhlcvRecord]) -> Result<PartitionWrite, StorageError> {
        fs::create_dir_all(self.partition_dir())?;
        let path = self.year_path(year);

        let is_new = !has_content(&path)?;
        if self.dedup {
            if is_new {
                self.known.insert(year, HashSet::new());
            } else if !self.known.contains_key(&year) {
                let keys = self.existing_keys(&path)?;
                self.known.insert(year, keys);
            }
        } else if !is_new {
            check_header(&path, &mut csv::Reader::from_path(&path)?)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if is_new {
            wtr.write_record(OhlcvRecord::COLUMNS)?;
        }

        let mut outcome = PartitionWrite {
            year,
            ..PartitionWrite::default()
        };
        let mut seen = if self.dedup { self.known.get_mut(&year) } else { None };
        for rec in records {
            let row = ArchiveRow::from(rec);
            if let Some(keys) = seen.as_deref_mut() {
                if !keys.insert(row.datetime.clone()) {
                    outcome.skipped += 1;
                    continue;
                }
            }
            wtr.serialize(&row)?;
            outcome.written += 1;
        }
        wtr.flush()?;

        Ok(outcome)
    }
}

fn has_content(path: &Path) -> Result<bool, StorageError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len() > 0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn check_header<R: std::io::Read>(path: &Path, rdr: &mut csv::Reader<R>) -> Result<(), StorageError> {
    let header = rdr.headers()?;
    if header.iter().ne(OhlcvRecord::COLUMNS.iter().copied()) {
        return Err(StorageError::ArchiveHeader {
            path: path.display().to_string(),
            found: header.iter().collect::<Vec<_>>().join(","),
        });
    }
    Ok(())
}
