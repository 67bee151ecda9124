//! The ingestion loop: source → normalizer → sinks, one batch at a time.
//!
//! The loop has two states. While `RUNNING` it asks the source for the page
//! starting at the cursor; a non-empty page is normalized, written to every
//! sink, and the cursor moves to `last open time + 1`. An empty page, a
//! failure the policy will not retry, or a page that would not advance the
//! cursor moves it to `DONE`.
//!
//! State is explicit: `step` takes a cursor and returns the next one, so the
//! loop can be driven (and tested) one batch at a time. Pacing happens in
//! the rate limiter before every upstream request, including retries.

use crate::pacing::RateLimiter;
use crate::policy::{FailureDecision, FailurePolicy};
use candlevault_core::{
    normalize, write_partitioned, CandleSource, FetchRequest, NormalizeError, OhlcvRecord,
    PartitionSink, RawCandle, SinkReport, SourceError, DATETIME_FORMAT,
};
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

const DAY_MS: i64 = 86_400_000;

/// Failures that abort the run. Everything else is contained and reported.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Malformed(#[from] NormalizeError),
}

/// Pagination watermark: epoch milliseconds of the next requested open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor(i64);

impl Cursor {
    pub fn new(millis: i64) -> Self {
        Self(millis)
    }

    /// `now - lookback_days`.
    pub fn from_lookback(now: DateTime<Utc>, lookback_days: u32) -> Self {
        Self(
            now.timestamp_millis()
                .saturating_sub(i64::from(lookback_days) * DAY_MS),
        )
    }

    pub fn millis(self) -> i64 {
        self.0
    }

    /// The cursor that never re-requests the candle opened at `open_time`.
    pub fn past(open_time: i64) -> Self {
        Self(open_time.saturating_add(1))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match OhlcvRecord::datetime_from_millis(self.0) {
            Ok(dt) => write!(f, "{}", dt.format(DATETIME_FORMAT)),
            Err(_) => write!(f, "{}ms", self.0),
        }
    }
}

/// Why the loop reached `DONE`.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// The source returned an empty page.
    Exhausted,
    /// A fetch failed and the policy gave up on it.
    SourceFailed { error: String, transient: bool },
    /// The page ended before the cursor; advancing would not make progress.
    Stalled { cursor: i64, last_open_time: i64 },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Exhausted => write!(f, "no more data"),
            StopReason::SourceFailed { error, transient } => {
                let kind = if *transient { "transient" } else { "fatal" };
                write!(f, "source failed ({kind}): {error}")
            }
            StopReason::Stalled {
                cursor,
                last_open_time,
            } => write!(
                f,
                "stalled: page ended at {last_open_time} before cursor {cursor}"
            ),
        }
    }
}

/// What one non-empty batch did.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub since: Cursor,
    pub candles: usize,
    pub records: usize,
    pub last_open_time: i64,
    pub sinks: Vec<SinkReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Continue { next: Cursor, batch: BatchSummary },
    Done(StopReason),
}

/// Totals for a whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub start: Cursor,
    pub final_cursor: Cursor,
    pub source_calls: u32,
    pub retries: u32,
    pub batches: usize,
    pub candles: usize,
    pub records: usize,
    pub sinks: Vec<SinkReport>,
    pub stop: StopReason,
}

impl IngestReport {
    fn new(start: Cursor, sink_names: Vec<String>) -> Self {
        Self {
            start,
            final_cursor: start,
            source_calls: 0,
            retries: 0,
            batches: 0,
            candles: 0,
            records: 0,
            sinks: sink_names
                .into_iter()
                .map(|sink| SinkReport {
                    sink,
                    ..SinkReport::default()
                })
                .collect(),
            stop: StopReason::Exhausted,
        }
    }

    fn absorb(&mut self, batch: BatchSummary) {
        self.batches += 1;
        self.candles += batch.candles;
        self.records += batch.records;
        for (total, part) in self.sinks.iter_mut().zip(batch.sinks) {
            total.absorb(part);
        }
    }

    pub fn sink(&self, name: &str) -> Option<&SinkReport> {
        self.sinks.iter().find(|s| s.sink == name)
    }

    /// Year partitions that failed in any sink.
    pub fn partition_failures(&self) -> usize {
        self.sinks.iter().map(|s| s.failures.len()).sum()
    }
}

impl fmt::Display for IngestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Range:        {} -> {}", self.start, self.final_cursor)?;
        writeln!(
            f,
            "Batches:      {} ({} source calls, {} retries)",
            self.batches, self.source_calls, self.retries
        )?;
        writeln!(
            f,
            "Candles:      {} fetched, {} after dedup",
            self.candles, self.records
        )?;
        for sink in &self.sinks {
            writeln!(
                f,
                "{:<13} {} written, {} skipped, {} failed partitions",
                format!("{}:", sink.sink),
                sink.written(),
                sink.skipped(),
                sink.failures.len()
            )?;
        }
        write!(f, "Stopped:      {}", self.stop)
    }
}

/// Drives one run against a source and a set of sinks.
pub struct IngestLoop<'a> {
    source: &'a dyn CandleSource,
    sinks: Vec<&'a mut dyn PartitionSink>,
    symbol: String,
    interval: String,
    limit: u32,
    limiter: RateLimiter,
    policy: FailurePolicy,
    source_calls: u32,
    retries: u32,
}

impl<'a> IngestLoop<'a> {
    pub fn new(
        source: &'a dyn CandleSource,
        symbol: impl Into<String>,
        interval: impl Into<String>,
        limit: u32,
    ) -> Self {
        Self {
            source,
            sinks: Vec::new(),
            symbol: symbol.into(),
            interval: interval.into(),
            limit,
            limiter: RateLimiter::unlimited(),
            policy: FailurePolicy::Stop,
            source_calls: 0,
            retries: 0,
        }
    }

    /// Sinks are written in the order they are added.
    pub fn with_sink(mut self, sink: &'a mut dyn PartitionSink) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn source_calls(&self) -> u32 {
        self.source_calls
    }

    fn request(&self, cursor: Cursor) -> FetchRequest {
        FetchRequest {
            symbol: self.symbol.clone(),
            interval: self.interval.clone(),
            limit: self.limit,
            since: Some(cursor.millis()),
        }
    }

    /// One page, retried per the failure policy.
    fn fetch(&mut self, cursor: Cursor) -> Result<Vec<RawCandle>, SourceError> {
        let req = self.request(cursor);
        let mut failures = 0;
        loop {
            self.limiter.acquire();
            self.source_calls += 1;
            let err = match self.source.fetch(&req) {
                Ok(batch) => return Ok(batch),
                Err(e) => e,
            };

            failures += 1;
            match self.policy.decide(&err, failures) {
                FailureDecision::RetryAfter(delay) => {
                    warn!(
                        source = self.source.name(),
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "fetch failed, retrying"
                    );
                    self.retries += 1;
                    self.limiter.penalize(delay);
                }
                FailureDecision::GiveUp => return Err(err),
            }
        }
    }

    /// Advance the state machine by one batch.
    pub fn step(&mut self, cursor: Cursor) -> Result<Step, IngestError> {
        info!(
            symbol = %self.symbol,
            interval = %self.interval,
            cursor = cursor.millis(),
            "fetching data from {cursor}"
        );

        let raw = match self.fetch(cursor) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "stopping: source failed");
                return Ok(Step::Done(StopReason::SourceFailed {
                    error: e.to_string(),
                    transient: e.is_transient(),
                }));
            }
        };

        let Some(last) = raw.last() else {
            info!(symbol = %self.symbol, "no more data to fetch");
            return Ok(Step::Done(StopReason::Exhausted));
        };

        let records = normalize(&raw)?;
        let last_open_time = last.open_time()?;

        if last_open_time < cursor.millis() {
            warn!(
                symbol = %self.symbol,
                cursor = cursor.millis(),
                last_open_time,
                "page ends before the cursor, stopping"
            );
            return Ok(Step::Done(StopReason::Stalled {
                cursor: cursor.millis(),
                last_open_time,
            }));
        }

        let sinks = self
            .sinks
            .iter_mut()
            .map(|sink| write_partitioned(&mut **sink, &records))
            .collect();

        let next = Cursor::past(last_open_time);
        info!(
            symbol = %self.symbol,
            candles = raw.len(),
            records = records.len(),
            next = next.millis(),
            "batch stored"
        );

        Ok(Step::Continue {
            next,
            batch: BatchSummary {
                since: cursor,
                candles: raw.len(),
                records: records.len(),
                last_open_time,
                sinks,
            },
        })
    }

    /// Run until `DONE`. Only malformed upstream data aborts with an error.
    pub fn run(&mut self, start: Cursor) -> Result<IngestReport, IngestError> {
        let names = self.sinks.iter().map(|s| s.name().to_string()).collect();
        let mut report = IngestReport::new(start, names);
        let mut cursor = start;

        loop {
            match self.step(cursor)? {
                Step::Continue { next, batch } => {
                    report.absorb(batch);
                    cursor = next;
                }
                Step::Done(reason) => {
                    report.stop = reason;
                    break;
                }
            }
        }

        report.final_cursor = cursor;
        report.source_calls = self.source_calls;
        report.retries = self.retries;
        info!(
            symbol = %self.symbol,
            batches = report.batches,
            records = report.records,
            stop = %report.stop,
            "ingestion finished"
        );
        Ok(report)
    }
}
