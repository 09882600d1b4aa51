//! Streaming Scorer - predicted value and residual for each live record
//!
//! One lookup + two multiplies per record. Unmonitored pairs are a normal
//! operating condition (a robot added to the fleet before its training run),
//! so a missing model drops the record with a diagnostic counter rather than
//! failing the stream.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::store::{ModelStore, PairModel};
use crate::types::{AxisKey, ScoredPoint, TelemetryRecord};

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("no model published for {0} — pair not monitored")]
    ModelNotFound(AxisKey),
}

// ============================================================================
// Diagnostic Counters
// ============================================================================

/// Per-error-kind diagnostics, shared across workers. Counters are the
/// user-visible failure surface: nothing here is process-fatal, but every
/// dropped or rejected record is accounted for.
#[derive(Debug, Default)]
pub struct DiagnosticCounters {
    /// Records dropped because no model was published for the pair.
    pub unmonitored_dropped: AtomicU64,
    /// Records rejected for violating per-pair time monotonicity.
    pub out_of_order_rejected: AtomicU64,
    /// Malformed source lines skipped before scoring.
    pub malformed_skipped: AtomicU64,
    /// Events handed to the emitter.
    pub events_emitted: AtomicU64,
    /// Qualifying events suppressed by the cooldown policy.
    pub events_suppressed: AtomicU64,
    /// Episodes discarded for missing the persistence duration.
    pub episodes_discarded: AtomicU64,
    /// Records scored and forwarded to a state machine.
    pub records_scored: AtomicU64,
}

/// Point-in-time copy of the counters, for logging and end-of-run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub unmonitored_dropped: u64,
    pub out_of_order_rejected: u64,
    pub malformed_skipped: u64,
    pub events_emitted: u64,
    pub events_suppressed: u64,
    pub episodes_discarded: u64,
    pub records_scored: u64,
}

impl DiagnosticCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            unmonitored_dropped: self.unmonitored_dropped.load(Ordering::Relaxed),
            out_of_order_rejected: self.out_of_order_rejected.load(Ordering::Relaxed),
            malformed_skipped: self.malformed_skipped.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            events_suppressed: self.events_suppressed.load(Ordering::Relaxed),
            episodes_discarded: self.episodes_discarded.load(Ordering::Relaxed),
            records_scored: self.records_scored.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Scorer
// ============================================================================

/// Scores live records against the published baseline for their pair.
#[derive(Clone)]
pub struct StreamingScorer {
    store: Arc<ModelStore>,
    counters: Arc<DiagnosticCounters>,
}

impl StreamingScorer {
    pub fn new(store: Arc<ModelStore>, counters: Arc<DiagnosticCounters>) -> Self {
        Self { store, counters }
    }

    /// Score one record. Returns the scored point together with the pair
    /// model it was scored against, so the caller evaluates the episode
    /// transition with exactly the thresholds of that model version.
    pub fn score(
        &self,
        record: &TelemetryRecord,
    ) -> Result<(ScoredPoint, Arc<PairModel>), ScoreError> {
        let key = record.key();
        let Some(entry) = self.store.lookup(&key) else {
            self.counters
                .unmonitored_dropped
                .fetch_add(1, Ordering::Relaxed);
            return Err(ScoreError::ModelNotFound(key));
        };

        let predicted = entry.model.predict(record.timestamp);
        let point = ScoredPoint {
            robot_id: record.robot_id,
            axis: record.axis,
            timestamp: record.timestamp,
            observed: record.current,
            predicted,
            residual: record.current - predicted,
        };
        self.counters.records_scored.fetch_add(1, Ordering::Relaxed);
        Ok((point, entry))
    }

    pub fn counters(&self) -> &DiagnosticCounters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BaselineModel, ThresholdSet};
    use chrono::{TimeZone, Utc};

    fn monitored_store() -> Arc<ModelStore> {
        let now = Utc.timestamp_opt(1_700_000_000, 0).single().expect("valid ts");
        let store = ModelStore::new();
        store.publish(
            BaselineModel {
                robot_id: 1,
                axis: 1,
                slope: 0.0,
                intercept: 10.0,
                fitted_at: now,
                sample_count: 100,
            },
            ThresholdSet {
                robot_id: 1,
                axis: 1,
                min_c: 1.0,
                max_c: 3.0,
                persist_seconds: 5.0,
                derived_at: now,
            },
        );
        Arc::new(store)
    }

    #[test]
    fn test_score_produces_residual() {
        let counters = Arc::new(DiagnosticCounters::new());
        let scorer = StreamingScorer::new(monitored_store(), counters.clone());
        let rec = TelemetryRecord {
            robot_id: 1,
            axis: 1,
            timestamp: Utc.timestamp_opt(1_700_000_100, 0).single().expect("valid ts"),
            current: 12.5,
        };
        let (point, entry) = scorer.score(&rec).expect("monitored");
        assert!((point.predicted - 10.0).abs() < 1e-9);
        assert!((point.residual - 2.5).abs() < 1e-9);
        assert_eq!(entry.thresholds.min_c, 1.0);
        assert_eq!(counters.snapshot().records_scored, 1);
    }

    #[test]
    fn test_unmonitored_pair_dropped_with_counter() {
        let counters = Arc::new(DiagnosticCounters::new());
        let scorer = StreamingScorer::new(monitored_store(), counters.clone());
        let rec = TelemetryRecord {
            robot_id: 7,
            axis: 7,
            timestamp: Utc.timestamp_opt(1_700_000_100, 0).single().expect("valid ts"),
            current: 12.5,
        };
        assert!(matches!(
            scorer.score(&rec),
            Err(ScoreError::ModelNotFound(k)) if k == AxisKey::new(7, 7)
        ));
        let snap = counters.snapshot();
        assert_eq!(snap.unmonitored_dropped, 1);
        assert_eq!(snap.records_scored, 0);
    }
}
