//! Training Orchestration - from historical records to published models
//!
//! Groups a historical training window into per-pair series, runs the
//! baseline fitter and residual analyzer on each, and publishes every
//! activated pair to the store in one atomic batch. Faults are isolated per
//! pair: a bad series skips that pair and never touches its siblings.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::baseline::{fit_baseline, validate_series};
use crate::config;
use crate::residual::derive_thresholds;
use crate::store::ModelStore;
use crate::types::{AxisKey, AxisSeries, BaselineModel, TelemetryRecord, ThresholdSet};

/// Outcome of one training run.
#[derive(Debug, Default)]
pub struct TrainingReport {
    /// Pairs fitted, derived, and published.
    pub activated: Vec<AxisKey>,
    /// Pairs skipped, with the reason. Siblings are unaffected.
    pub skipped: Vec<(AxisKey, String)>,
}

impl TrainingReport {
    pub fn is_empty(&self) -> bool {
        self.activated.is_empty() && self.skipped.is_empty()
    }
}

/// Group raw records into per-pair series, preserving input order within
/// each pair. `BTreeMap` keeps pair iteration deterministic.
pub fn group_by_pair(records: &[TelemetryRecord]) -> BTreeMap<AxisKey, AxisSeries> {
    let mut series: BTreeMap<AxisKey, AxisSeries> = BTreeMap::new();
    for record in records {
        series
            .entry(record.key())
            .or_insert_with(|| AxisSeries::new(record.key()))
            .push(record.timestamp, record.current);
    }
    series
}

/// Fit and derive for every pair in the training window. Returns the
/// activated `(model, thresholds)` pairs alongside the report.
pub fn train_pairs(
    records: &[TelemetryRecord],
) -> (Vec<(BaselineModel, ThresholdSet)>, TrainingReport) {
    let cfg = config::get();
    let now = Utc::now();
    let mut activated = Vec::new();
    let mut report = TrainingReport::default();

    for (key, series) in group_by_pair(records) {
        if let Err(e) = validate_series(&series, &cfg.training) {
            warn!(pair = %key, error = %e, "Training data rejected — pair skipped");
            report.skipped.push((key, e.to_string()));
            continue;
        }
        let model = match fit_baseline(&series, now) {
            Ok(m) => m,
            Err(e) => {
                warn!(pair = %key, error = %e, "Baseline fit failed — pair skipped");
                report.skipped.push((key, e.to_string()));
                continue;
            }
        };
        let thresholds = match derive_thresholds(
            &model,
            &series,
            &cfg.training,
            &cfg.thresholds,
            cfg.streaming.max_sample_gap_seconds,
            now,
        ) {
            Ok(t) => t,
            Err(e) => {
                warn!(pair = %key, error = %e, "Threshold derivation failed — pair not activated");
                report.skipped.push((key, e.to_string()));
                continue;
            }
        };
        report.activated.push(key);
        activated.push((model, thresholds));
    }

    info!(
        activated = report.activated.len(),
        skipped = report.skipped.len(),
        "Training run finished"
    );
    (activated, report)
}

/// Train and publish in one step. Publication is a single atomic swap, so a
/// concurrent streaming session never observes a partial training run.
pub fn train_and_publish(store: &Arc<ModelStore>, records: &[TelemetryRecord]) -> TrainingReport {
    let (pairs, report) = train_pairs(records);
    store.publish_batch(pairs);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(offset: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + offset, 0)
            .single()
            .expect("valid ts")
    }

    fn rec(robot_id: u32, axis: u8, offset: i64, current: f64) -> TelemetryRecord {
        TelemetryRecord {
            robot_id,
            axis,
            timestamp: ts(offset),
            current,
        }
    }

    /// A healthy training series: gentle upward trend plus a deterministic
    /// sawtooth that yields plenty of positive residuals.
    fn healthy_records(robot_id: u32, axis: u8, n: i64) -> Vec<TelemetryRecord> {
        (0..n)
            .map(|i| {
                let trend = 10.0 + 0.001 * i as f64;
                let wobble = ((i % 7) as f64 - 3.0) * 0.2;
                rec(robot_id, axis, i, trend + wobble)
            })
            .collect()
    }

    #[test]
    fn test_group_by_pair_preserves_order() {
        let records = vec![
            rec(1, 1, 0, 1.0),
            rec(2, 1, 0, 2.0),
            rec(1, 1, 1, 1.5),
            rec(1, 2, 0, 3.0),
        ];
        let grouped = group_by_pair(&records);
        assert_eq!(grouped.len(), 3);
        let s = grouped.get(&AxisKey::new(1, 1)).expect("present");
        assert_eq!(s.len(), 2);
        assert_eq!(s.samples[0].0, ts(0));
        assert_eq!(s.samples[1].0, ts(1));
    }

    #[test]
    fn test_bad_pair_skipped_siblings_trained() {
        let mut records = healthy_records(1, 1, 300);
        // robot 2 axis 1: duplicate timestamps — fails validation
        records.extend((0..300).map(|i| rec(2, 1, i / 2, 5.0)));

        let (pairs, report) = train_pairs(&records);
        assert_eq!(pairs.len(), 1);
        assert_eq!(report.activated, vec![AxisKey::new(1, 1)]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, AxisKey::new(2, 1));
        assert!(report.skipped[0].1.contains("duplicate"));
    }

    #[test]
    fn test_train_and_publish_activates_store() {
        let store = Arc::new(ModelStore::new());
        let records = healthy_records(3, 4, 400);
        let report = train_and_publish(&store, &records);

        assert_eq!(report.activated, vec![AxisKey::new(3, 4)]);
        let entry = store.lookup(&AxisKey::new(3, 4)).expect("published");
        assert!(entry.thresholds.min_c < entry.thresholds.max_c);
        assert!(entry.thresholds.persist_seconds > 0.0);
        // slope recovers the injected trend
        assert!((entry.model.slope - 0.001).abs() < 1e-4);
    }

    #[test]
    fn test_flat_series_not_activated() {
        // perfectly flat signal: residuals are ~0, none positive — the pair
        // must not be activated for streaming detection
        let records: Vec<TelemetryRecord> = (0..300).map(|i| rec(4, 1, i, 20.0)).collect();
        let (pairs, report) = train_pairs(&records);
        assert!(pairs.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].1.contains("positive residuals"));
    }
}
