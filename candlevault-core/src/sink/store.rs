//! SQLite store, one table per calendar year.
//!
//! Tables are named `{symbol}_{interval}_{year}` and created lazily:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS "btcusdt_1h_2023" (
//!     datetime TEXT UNIQUE,
//!     open REAL, high REAL, low REAL, close REAL, volume REAL
//! )
//! ```
//!
//! Rows go in with `INSERT OR IGNORE` inside one transaction per partition,
//! so a datetime that is already stored is skipped and never takes its
//! sibling rows down with it.

use super::{PartitionSink, PartitionWrite, StorageError};
use crate::candle::{OhlcvRecord, DATETIME_FORMAT};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    table_stem: String,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path, symbol: &str, interval: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        // Pragmas (best-effort).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;");
        Self::from_connection(conn, symbol, interval)
    }

    pub fn in_memory(symbol: &str, interval: &str) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?, symbol, interval)
    }

    pub fn from_connection(
        conn: Connection,
        symbol: &str,
        interval: &str,
    ) -> Result<Self, StorageError> {
        let table_stem = Self::table_stem(symbol, interval);
        if table_stem.is_empty()
            || !table_stem
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StorageError::InvalidIdentifier(table_stem));
        }
        Ok(Self { conn, table_stem })
    }

    /// `{symbol}_{interval}` in lower case. SQLite identifiers are
    /// case-insensitive, so the monthly interval `1M` is spelled `1mo` to
    /// keep it apart from the one-minute `1m`.
    pub fn table_stem(symbol: &str, interval: &str) -> String {
        let interval = match interval.strip_suffix('M') {
            Some(n) => format!("{n}mo"),
            None => interval.to_string(),
        };
        format!("{}_{}", symbol.to_ascii_lowercase(), interval.to_ascii_lowercase())
    }

    pub fn table_name(&self, year: i32) -> String {
        format!("{}_{year}", self.table_stem)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Close the connection, surfacing any error the drop would swallow.
    pub fn close(self) -> Result<(), StorageError> {
        self.conn.close().map_err(|(_, e)| StorageError::from(e))
    }

    fn ensure_table(&self, table: &str) -> Result<(), StorageError> {
        self.conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                datetime TEXT UNIQUE,
                open REAL,
                high REAL,
                low REAL,
                close REAL,
                volume REAL
            );
            "#
        ))?;
        Ok(())
    }

    fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Years that have a table, ascending.
    pub fn partition_years(&self) -> Result<Vec<i32>, StorageError> {
        let prefix = format!("{}_", self.table_stem);
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut years: Vec<i32> = names
            .iter()
            .filter_map(|name| name.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
            .filter_map(|rest| rest.parse().ok())
            .collect();
        years.sort_unstable();
        Ok(years)
    }

    /// Rows in a year's table; zero if the table does not exist.
    pub fn row_count(&self, year: i32) -> Result<usize, StorageError> {
        let table = self.table_name(year);
        if !self.table_exists(&table)? {
            return Ok(0);
        }
        let sql = format!(r#"SELECT COUNT(*) FROM "{table}""#);
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Earliest and latest stored datetime of a year, as stored text.
    pub fn datetime_range(&self, year: i32) -> Result<Option<(String, String)>, StorageError> {
        let table = self.table_name(year);
        if !self.table_exists(&table)? {
            return Ok(None);
        }
        let range: (Option<String>, Option<String>) = self.conn.query_row(
            &format!(r#"SELECT MIN(datetime), MAX(datetime) FROM "{table}""#),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(range.0.zip(range.1))
    }

    /// Look up one stored row by datetime text.
    pub fn get(&self, year: i32, datetime: &str) -> Result<Option<OhlcvRecord>, StorageError> {
        let table = self.table_name(year);
        let Ok(parsed) = NaiveDateTime::parse_from_str(datetime, DATETIME_FORMAT) else {
            return Ok(None);
        };
        if !self.table_exists(&table)? {
            return Ok(None);
        }
        let record = self
            .conn
            .query_row(
                &format!(
                    r#"SELECT open, high, low, close, volume FROM "{table}" WHERE datetime = ?1"#
                ),
                [datetime],
                |row| {
                    Ok(OhlcvRecord {
                        datetime: parsed,
                        open: row.get(0)?,
                        high: row.get(1)?,
                        low: row.get(2)?,
                        close: row.get(3)?,
                        volume: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

impl PartitionSink for SqliteStore {
    fn name(&self) -> &str {
        "sqlite_store"
    }

    fn write_partition(
        &mut self,
        year: i32,
        records: &[OhlcvRecord],
    ) -> Result<PartitionWrite, StorageError> {
        let table = self.table_name(year);
        self.ensure_table(&table)?;

        let mut outcome = PartitionWrite {
            year,
            ..PartitionWrite::default()
        };

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                r#"INSERT OR IGNORE INTO "{table}" (datetime, open, high, low, close, volume)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#
            ))?;
            for rec in records {
                let changed = stmt.execute(params![
                    rec.datetime_text(),
                    rec.open,
                    rec.high,
                    rec.low,
                    rec.close,
                    rec.volume
                ])?;
                if changed == 0 {
                    debug!(table = %table, datetime = %rec.datetime_text(), "duplicate row skipped");
                    outcome.skipped += 1;
                } else {
                    outcome.written += 1;
                }
            }
        }
        tx.commit()?;

        Ok(outcome)
    }
}
