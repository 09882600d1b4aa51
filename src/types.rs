//! Core data model for the baseline-deviation detection engine.
//!
//! Everything the engine passes between stages lives here: telemetry input
//! records, training series, fitted baseline models, derived threshold sets,
//! ephemeral scored points, and the immutable output [`Event`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Highest axis index a robot controller reports.
pub const MAX_AXIS: u8 = 8;

/// Convert a timestamp to fractional epoch seconds for regression math.
pub fn epoch_secs(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

// ============================================================================
// Keys & Input Records
// ============================================================================

/// Identifies one monitored signal: a single axis of a single robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AxisKey {
    pub robot_id: u32,
    /// Axis index, 1-based (1..=8 on the controllers we ingest from).
    pub axis: u8,
}

impl AxisKey {
    pub fn new(robot_id: u32, axis: u8) -> Self {
        Self { robot_id, axis }
    }

    /// Whether the axis index is inside the declared controller range.
    pub fn is_valid(&self) -> bool {
        (1..=MAX_AXIS).contains(&self.axis)
    }
}

impl std::fmt::Display for AxisKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "robot{}:axis{}", self.robot_id, self.axis)
    }
}

/// One raw telemetry sample as delivered by the data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub robot_id: u32,
    pub axis: u8,
    pub timestamp: DateTime<Utc>,
    /// Observed axis current (amps).
    pub current: f64,
}

impl TelemetryRecord {
    pub fn key(&self) -> AxisKey {
        AxisKey::new(self.robot_id, self.axis)
    }
}

// ============================================================================
// Training Series
// ============================================================================

/// Time-ordered `(timestamp, value)` samples for one (robot, axis) pair.
///
/// Ordering is the source's responsibility; [`crate::baseline::validate_series`]
/// rejects series that violate it rather than silently re-sorting.
#[derive(Debug, Clone)]
pub struct AxisSeries {
    pub key: AxisKey,
    pub samples: Vec<(DateTime<Utc>, f64)>,
}

impl AxisSeries {
    pub fn new(key: AxisKey) -> Self {
        Self {
            key,
            samples: Vec::new(),
        }
    }

    pub fn push(&mut self, ts: DateTime<Utc>, value: f64) {
        self.samples.push((ts, value));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// ============================================================================
// Fitted Model & Thresholds
// ============================================================================

/// Per-pair expected-value baseline: `current = slope * t + intercept`
/// with `t` in epoch seconds.
///
/// Immutable once created. Retraining produces a new model (new version in
/// the store), never a mutation of an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineModel {
    pub robot_id: u32,
    pub axis: u8,
    pub slope: f64,
    pub intercept: f64,
    pub fitted_at: DateTime<Utc>,
    /// Training samples the fit consumed (provenance, not used at score time).
    pub sample_count: usize,
}

impl BaselineModel {
    pub fn key(&self) -> AxisKey {
        AxisKey::new(self.robot_id, self.axis)
    }

    /// Predicted current at `ts`.
    pub fn predict(&self, ts: DateTime<Utc>) -> f64 {
        self.slope * epoch_secs(ts) + self.intercept
    }
}

/// Residual thresholds and persistence duration derived from the training
/// residual distribution of the matching [`BaselineModel`].
///
/// Invariant: `0 <= min_c < max_c` and `persist_seconds > 0`. The residual
/// analyzer is the only producer and guarantees both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub robot_id: u32,
    pub axis: u8,
    /// Early-warning residual band (95th percentile of positive residuals).
    pub min_c: f64,
    /// Critical residual band (99th percentile of positive residuals).
    pub max_c: f64,
    /// Minimum continuous breach duration before an episode is a real event.
    pub persist_seconds: f64,
    pub derived_at: DateTime<Utc>,
}

impl ThresholdSet {
    pub fn key(&self) -> AxisKey {
        AxisKey::new(self.robot_id, self.axis)
    }
}

// ============================================================================
// Scored Points
// ============================================================================

/// One live record scored against the stored baseline. Ephemeral: consumed
/// immediately by the episode state machine, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub robot_id: u32,
    pub axis: u8,
    pub timestamp: DateTime<Utc>,
    pub observed: f64,
    pub predicted: f64,
    /// `observed - predicted`. Positive = excess consumption.
    pub residual: f64,
}

impl ScoredPoint {
    pub fn key(&self) -> AxisKey {
        AxisKey::new(self.robot_id, self.axis)
    }
}

// ============================================================================
// Severity & Events
// ============================================================================

/// Severity of an open episode. Ordered: `Critical > Watching`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Residual at or above `min_c` but below `max_c`.
    Watching,
    /// Residual reached `max_c` at least once.
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Watching => write!(f, "WATCHING"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Emitted event class. Ordered: `Error > Alert`.
///
/// Serializes as `"ALERT"` / `"ERROR"` — the schema contract of the
/// downstream events table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Alert,
    Error,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Alert => write!(f, "ALERT"),
            EventType::Error => write!(f, "ERROR"),
        }
    }
}

/// Finalized, immutable output record for one qualifying episode.
///
/// Created exactly once at episode close, fully formed before it reaches any
/// sink, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub robot_id: u32,
    pub axis: u8,
    pub event_type: EventType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// `end_time - start_time` in seconds (span of in-breach samples).
    pub duration_seconds: f64,
    pub max_residual: f64,
    pub avg_residual: f64,
    /// `max_c` for an Error, `min_c` for an Alert.
    pub threshold_used: f64,
    /// Projected days until the residual reaches the critical band, from the
    /// episode's own residual trend. `None` when the trend is flat or
    /// declining; `0.0` when the critical band was already reached.
    pub predicted_ttf_days: Option<f64>,
}

impl Event {
    pub fn key(&self) -> AxisKey {
        AxisKey::new(self.robot_id, self.axis)
    }
}
