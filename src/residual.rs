//! Residual Analyzer - thresholds and persistence duration from training residuals
//!
//! Computes training residuals against a fitted baseline, keeps the positive
//! side of the distribution (excess consumption is the failure-relevant
//! direction), and derives:
//!
//! - `min_c`: early-warning band, 95th percentile of positive residuals
//! - `max_c`: critical band, 99th percentile
//! - `persist_seconds`: minimum breach duration, from training breach
//!   run-lengths (`persistence_multiplier` x `run_length_percentile`, floored
//!   at `min_persist_seconds`)
//!
//! All three are tunable via `[thresholds]` in the detector config. The
//! derivation is deterministic: identical input yields identical thresholds.

use chrono::{DateTime, Utc};
use statrs::statistics::Statistics;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ThresholdTuning, TrainingConfig};
use crate::types::{AxisKey, AxisSeries, BaselineModel, ThresholdSet};

/// Threshold derivation failed for one pair. The pair is not activated for
/// streaming detection; siblings are unaffected.
#[derive(Debug, Error)]
pub enum ResidualError {
    #[error("pair {key}: only {have} positive residuals, need {need} for threshold derivation")]
    InsufficientResidualData { key: AxisKey, have: usize, need: usize },
}

/// Interpolated quantile over an ascending-sorted slice.
///
/// Rank `p/100 * (n-1)` with linear interpolation between the two straddling
/// order statistics (the numpy/pandas default). Callers must pass sorted,
/// non-empty data.
pub fn interpolated_percentile(sorted: &[f64], p: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = rank - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}

/// Training residuals `observed - predicted`, with timestamps, in series order.
pub fn residuals(model: &BaselineModel, series: &AxisSeries) -> Vec<(DateTime<Utc>, f64)> {
    series
        .samples
        .iter()
        .map(|&(ts, observed)| (ts, observed - model.predict(ts)))
        .collect()
}

/// Durations (seconds) of contiguous training runs with residual >= `min_c`.
///
/// Contiguity means consecutive samples whose inter-sample gap stays within
/// `max_gap_seconds`; a dropout splits the run just as it would close a live
/// episode. A single-sample spike contributes a zero-length run.
fn breach_run_durations(
    scored: &[(DateTime<Utc>, f64)],
    min_c: f64,
    max_gap_seconds: f64,
) -> Vec<f64> {
    let mut durations = Vec::new();
    let mut run_start: Option<DateTime<Utc>> = None;
    let mut run_last: Option<DateTime<Utc>> = None;

    for &(ts, r) in scored {
        let gap_broken = run_last
            .map(|last| (ts - last).num_milliseconds() as f64 / 1000.0 > max_gap_seconds)
            .unwrap_or(false);

        if r >= min_c && !gap_broken {
            if run_start.is_none() {
                run_start = Some(ts);
            }
            run_last = Some(ts);
        } else {
            if let (Some(start), Some(last)) = (run_start, run_last) {
                durations.push((last - start).num_milliseconds() as f64 / 1000.0);
            }
            if r >= min_c {
                // gap split a breach: the current sample starts a new run
                run_start = Some(ts);
                run_last = Some(ts);
            } else {
                run_start = None;
                run_last = None;
            }
        }
    }
    if let (Some(start), Some(last)) = (run_start, run_last) {
        durations.push((last - start).num_milliseconds() as f64 / 1000.0);
    }

    durations
}

/// Derive the threshold set for one pair from its fitted model and the same
/// training series the model was fitted on.
pub fn derive_thresholds(
    model: &BaselineModel,
    series: &AxisSeries,
    training: &TrainingConfig,
    tuning: &ThresholdTuning,
    max_gap_seconds: f64,
    derived_at: DateTime<Utc>,
) -> Result<ThresholdSet, ResidualError> {
    let key = model.key();
    let scored = residuals(model, series);

    let mut positive: Vec<f64> = scored.iter().map(|&(_, r)| r).filter(|r| *r > 0.0).collect();
    if positive.len() < training.min_positive_residuals {
        return Err(ResidualError::InsufficientResidualData {
            key,
            have: positive.len(),
            need: training.min_positive_residuals,
        });
    }
    positive.sort_by(|a, b| a.total_cmp(b));

    let min_c = interpolated_percentile(&positive, tuning.alert_percentile);
    let mut max_c = interpolated_percentile(&positive, tuning.error_percentile);
    if max_c <= min_c {
        // tied tail (heavily repeated residuals): keep the strict ordering
        // invariant by opening a minimal spread above min_c
        max_c = min_c + (min_c.abs() * 1e-6).max(1e-9);
    }

    let run_durations = breach_run_durations(&scored, min_c, max_gap_seconds);
    let persist_seconds = if run_durations.is_empty() {
        tuning.min_persist_seconds
    } else {
        let mut sorted_runs = run_durations.clone();
        sorted_runs.sort_by(|a, b| a.total_cmp(b));
        let base = interpolated_percentile(&sorted_runs, tuning.run_length_percentile);
        (tuning.persistence_multiplier * base).max(tuning.min_persist_seconds)
    };

    debug!(
        pair = %key,
        positive = positive.len(),
        mean_residual = Statistics::mean(positive.iter()),
        breach_runs = run_durations.len(),
        "Residual distribution analyzed"
    );
    info!(
        pair = %key,
        min_c,
        max_c,
        persist_seconds,
        "Thresholds derived"
    );

    Ok(ThresholdSet {
        robot_id: key.robot_id,
        axis: key.axis,
        min_c,
        max_c,
        persist_seconds,
        derived_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crate::types::epoch_secs;

    fn ts(offset: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + offset, 0)
            .single()
            .expect("valid ts")
    }

    fn flat_model() -> BaselineModel {
        BaselineModel {
            robot_id: 1,
            axis: 3,
            slope: 0.0,
            intercept: 0.0,
            fitted_at: ts(0),
            sample_count: 0,
        }
    }

    fn tuning() -> ThresholdTuning {
        ThresholdTuning::default()
    }

    #[test]
    fn test_interpolated_percentile_known_values() {
        let sorted = [1.0, 2.0, 2.0, 3.0, 4.0, 5.0, 6.0, 8.0, 9.0, 20.0];
        // rank 0.95 * 9 = 8.55 -> 9 + 0.55 * 11
        assert!((interpolated_percentile(&sorted, 95.0) - 15.05).abs() < 1e-9);
        // rank 0.99 * 9 = 8.91 -> 9 + 0.91 * 11
        assert!((interpolated_percentile(&sorted, 99.0) - 19.01).abs() < 1e-9);
        assert!((interpolated_percentile(&sorted, 0.0) - 1.0).abs() < 1e-12);
        assert!((interpolated_percentile(&sorted, 100.0) - 20.0).abs() < 1e-12);
        assert!((interpolated_percentile(&sorted, 50.0) - 4.5).abs() < 1e-12);
    }

    #[test]
    fn test_interpolated_percentile_single_element() {
        assert_eq!(interpolated_percentile(&[7.5], 95.0), 7.5);
    }

    #[test]
    fn test_derivation_is_idempotent() {
        let mut series = AxisSeries::new(AxisKey::new(1, 3));
        for i in 0..200i64 {
            // flat baseline at 0 => residual == value; alternate sign
            let v = if i % 2 == 0 { (i % 17) as f64 + 0.5 } else { -1.0 };
            series.push(ts(i), v);
        }
        let model = flat_model();
        let cfg = TrainingConfig::default();
        let a = derive_thresholds(&model, &series, &cfg, &tuning(), 30.0, ts(1_000)).expect("derive");
        let b = derive_thresholds(&model, &series, &cfg, &tuning(), 30.0, ts(1_000)).expect("derive");
        assert_eq!(a, b);
        assert!(a.min_c < a.max_c);
        assert!(a.min_c >= 0.0);
        assert!(a.persist_seconds > 0.0);
    }

    #[test]
    fn test_insufficient_positive_residuals() {
        let mut series = AxisSeries::new(AxisKey::new(2, 1));
        for i in 0..100i64 {
            series.push(ts(i), -5.0); // all below the flat baseline
        }
        let err = derive_thresholds(
            &flat_model(),
            &series,
            &TrainingConfig::default(),
            &tuning(),
            30.0,
            ts(200),
        )
        .expect_err("must fail");
        assert!(matches!(
            err,
            ResidualError::InsufficientResidualData { have: 0, .. }
        ));
    }

    #[test]
    fn test_negative_residuals_excluded_not_clipped() {
        // Half the samples sit far below trend; they must not drag min_c down.
        let mut series = AxisSeries::new(AxisKey::new(1, 1));
        for i in 0..120i64 {
            let v = if i % 2 == 0 { 1.0 + (i % 10) as f64 } else { -100.0 };
            series.push(ts(i), v);
        }
        let set = derive_thresholds(
            &flat_model(),
            &series,
            &TrainingConfig::default(),
            &tuning(),
            30.0,
            ts(500),
        )
        .expect("derive");
        // positive residuals are 1..=10; min_c must be inside that range
        assert!(set.min_c >= 1.0 && set.min_c <= 10.0);
    }

    #[test]
    fn test_tied_tail_keeps_strict_ordering() {
        let mut series = AxisSeries::new(AxisKey::new(1, 2));
        for i in 0..100i64 {
            series.push(ts(i), 5.0); // every positive residual identical
        }
        let set = derive_thresholds(
            &flat_model(),
            &series,
            &TrainingConfig::default(),
            &tuning(),
            30.0,
            ts(500),
        )
        .expect("derive");
        assert!(set.min_c < set.max_c);
    }

    #[test]
    fn test_breach_run_durations_contiguity_and_gaps() {
        let scored: Vec<(DateTime<Utc>, f64)> = vec![
            (ts(0), 10.0),  // run A starts
            (ts(1), 11.0),
            (ts(2), 12.0),  // run A: 2s
            (ts(3), 0.5),   // below
            (ts(4), 10.0),  // run B, single sample: 0s
            (ts(5), 0.5),
            (ts(100), 10.0), // run C starts after quiet period
            (ts(200), 10.0), // 100s gap > 30s max: C closes at 0s, run D starts
            (ts(201), 10.0), // run D: 1s
        ];
        let mut durations = breach_run_durations(&scored, 9.0, 30.0);
        durations.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(durations, vec![0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_persistence_floor_applies() {
        // Only isolated one-sample spikes: median run-length 0 -> floor wins.
        let mut series = AxisSeries::new(AxisKey::new(1, 4));
        for i in 0..300i64 {
            let v = if i % 10 == 0 { 50.0 } else { 1.0 };
            series.push(ts(i), v);
        }
        let set = derive_thresholds(
            &flat_model(),
            &series,
            &TrainingConfig::default(),
            &tuning(),
            30.0,
            ts(500),
        )
        .expect("derive");
        assert_eq!(set.persist_seconds, tuning().min_persist_seconds);
    }

    #[test]
    fn test_residuals_follow_sloped_model() {
        let t0 = epoch_secs(ts(0));
        let model = BaselineModel {
            robot_id: 1,
            axis: 1,
            slope: 1.0,
            intercept: -t0, // predicted = t - t0
            fitted_at: ts(0),
            sample_count: 0,
        };
        let mut series = AxisSeries::new(AxisKey::new(1, 1));
        series.push(ts(10), 13.0); // predicted 10 -> residual 3
        series.push(ts(20), 18.0); // predicted 20 -> residual -2
        let r = residuals(&model, &series);
        assert!((r[0].1 - 3.0).abs() < 1e-6);
        assert!((r[1].1 + 2.0).abs() < 1e-6);
    }
}
