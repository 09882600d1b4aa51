//! Telemetry source abstraction for record ingestion.
//!
//! Provides a unified trait for reading telemetry records from different
//! sources: CSV files (historical training windows and replay) and stdin
//! (JSON lines from a live collector or the simulator).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use tracing::warn;

use crate::types::TelemetryRecord;

/// Events produced by a telemetry source.
pub enum SourceEvent {
    /// A valid telemetry record was read.
    Record(TelemetryRecord),
    /// Source reached end of data (EOF for files/stdin).
    Eof,
}

/// Trait abstracting where telemetry records come from.
///
/// Implementations handle format parsing and pacing internally. The feed loop
/// calls [`next_record`](Self::next_record) in a select! with cancellation.
#[async_trait]
pub trait TelemetrySource: Send + 'static {
    /// Read the next record from the source.
    ///
    /// Returns `SourceEvent::Eof` when no more data is available.
    async fn next_record(&mut self) -> Result<SourceEvent>;

    /// Human-readable name for logging (e.g. "CSV", "stdin").
    fn source_name(&self) -> &str;
}

// ============================================================================
// CSV Loading
// ============================================================================

/// Parse a timestamp cell: RFC 3339 first, epoch seconds (fractional allowed)
/// as the fallback.
fn parse_timestamp(cell: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(cell) {
        return Some(ts.with_timezone(&Utc));
    }
    let secs: f64 = cell.parse().ok()?;
    if !secs.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
}

/// Parse one CSV data line: `robot_id,axis,timestamp,current`.
fn parse_line(line: &str) -> Option<TelemetryRecord> {
    let mut cells = line.split(',').map(str::trim);
    let robot_id: u32 = cells.next()?.parse().ok()?;
    let axis: u8 = cells.next()?.parse().ok()?;
    let timestamp = parse_timestamp(cells.next()?)?;
    let current: f64 = cells.next()?.parse().ok()?;
    Some(TelemetryRecord {
        robot_id,
        axis,
        timestamp,
        current,
    })
}

/// Load a telemetry CSV (`robot_id,axis,timestamp,current`, header optional).
///
/// Malformed lines are warned about and skipped — one bad row must not take
/// down a multi-day training file.
pub fn load_csv(path: &Path) -> Result<Vec<TelemetryRecord>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading telemetry CSV {}", path.display()))?;

    let mut records = Vec::new();
    let mut skipped: usize = 0;
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // header row: first cell not numeric
        if lineno == 0 && line.split(',').next().is_some_and(|c| c.trim().parse::<u32>().is_err()) {
            continue;
        }
        match parse_line(line) {
            Some(rec) => records.push(rec),
            None => {
                skipped += 1;
                if skipped <= 5 {
                    warn!(line = lineno + 1, "Skipping malformed CSV line");
                }
            }
        }
    }
    if skipped > 0 {
        warn!(skipped, total = records.len(), "CSV load finished with skipped lines");
    }
    Ok(records)
}

// ============================================================================
// CSV Source (file / replay)
// ============================================================================

/// Replays pre-loaded records with optional inter-record delay.
pub struct CsvSource {
    records: std::vec::IntoIter<TelemetryRecord>,
    delay_ms: u64,
    yielded_first: bool,
}

impl CsvSource {
    pub fn new(records: Vec<TelemetryRecord>, delay_ms: u64) -> Self {
        Self {
            records: records.into_iter(),
            delay_ms,
            yielded_first: false,
        }
    }

    /// Load a CSV file and replay it with `delay_ms` between records.
    pub fn from_path(path: &Path, delay_ms: u64) -> Result<Self> {
        Ok(Self::new(load_csv(path)?, delay_ms))
    }
}

#[async_trait]
impl TelemetrySource for CsvSource {
    async fn next_record(&mut self) -> Result<SourceEvent> {
        if self.yielded_first && self.delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.delay_ms)).await;
        }
        match self.records.next() {
            Some(r) => {
                self.yielded_first = true;
                Ok(SourceEvent::Record(r))
            }
            None => Ok(SourceEvent::Eof),
        }
    }

    fn source_name(&self) -> &str {
        "CSV"
    }
}

// ============================================================================
// Stdin Source (JSON telemetry records, one per line)
// ============================================================================

/// Reads JSON-formatted telemetry records from stdin.
///
/// Used with the simulator: `telemetry-sim --format json | axis-sentinel stream --stdin`
pub struct StdinSource {
    reader: tokio::io::BufReader<tokio::io::Stdin>,
    line_buffer: String,
}

impl StdinSource {
    pub fn new() -> Self {
        Self {
            reader: tokio::io::BufReader::new(tokio::io::stdin()),
            line_buffer: String::with_capacity(512),
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySource for StdinSource {
    async fn next_record(&mut self) -> Result<SourceEvent> {
        use tokio::io::AsyncBufReadExt;
        loop {
            self.line_buffer.clear();
            let bytes = self.reader.read_line(&mut self.line_buffer).await?;
            if bytes == 0 {
                return Ok(SourceEvent::Eof);
            }
            let line = self.line_buffer.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<TelemetryRecord>(line) {
                Ok(record) => return Ok(SourceEvent::Record(record)),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed telemetry line");
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        "stdin"
    }
}
