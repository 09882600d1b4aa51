//! Baseline Fitter - per-(robot, axis) expected-value trend
//!
//! Fits one scalar ordinary least-squares regression `current = slope * t +
//! intercept` per pair from a historical training window. The fit is the
//! commodity part; the data-quality gate in front of it is what keeps a bad
//! sensor from poisoning a baseline.
//!
//! Time is centered before the normal equations are solved. Epoch timestamps
//! sit near 1.7e9 seconds, and `sum(t^2)` at that magnitude loses the low
//! bits that carry the actual spread — centering keeps the arithmetic in the
//! spread's own scale.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::config::TrainingConfig;
use crate::types::{epoch_secs, AxisKey, AxisSeries, BaselineModel};

/// Training data rejected by the quality gate. Scoped to one pair; the
/// training orchestrator skips the pair and continues with its siblings.
#[derive(Debug, Error)]
pub enum FitError {
    #[error("series {key} too short: {have} samples, need {need}")]
    TooFewSamples { key: AxisKey, have: usize, need: usize },

    #[error("series {key} has duplicate timestamp at sample {index}")]
    DuplicateTimestamp { key: AxisKey, index: usize },

    #[error("series {key} timestamps not increasing at sample {index}")]
    NonMonotonicTime { key: AxisKey, index: usize },

    #[error("series {key} value {value} at sample {index} outside declared range [{min}, {max}]")]
    OutOfRange {
        key: AxisKey,
        index: usize,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("series {key} value at sample {index} is not finite")]
    NonFinite { key: AxisKey, index: usize },

    #[error("series {key} has no time spread — cannot fit a trend")]
    DegenerateTime { key: AxisKey },
}

/// Validate a training series against the data-quality contract:
/// strictly increasing timestamps, finite values inside the declared range,
/// and enough samples for a meaningful fit.
pub fn validate_series(series: &AxisSeries, cfg: &TrainingConfig) -> Result<(), FitError> {
    let key = series.key;

    if series.len() < cfg.min_samples {
        return Err(FitError::TooFewSamples {
            key,
            have: series.len(),
            need: cfg.min_samples,
        });
    }

    let mut prev: Option<DateTime<Utc>> = None;
    for (index, &(ts, value)) in series.samples.iter().enumerate() {
        if let Some(p) = prev {
            if ts == p {
                return Err(FitError::DuplicateTimestamp { key, index });
            }
            if ts < p {
                return Err(FitError::NonMonotonicTime { key, index });
            }
        }
        prev = Some(ts);

        if !value.is_finite() {
            return Err(FitError::NonFinite { key, index });
        }
        if value < cfg.valid_current_min || value > cfg.valid_current_max {
            return Err(FitError::OutOfRange {
                key,
                index,
                value,
                min: cfg.valid_current_min,
                max: cfg.valid_current_max,
            });
        }
    }

    Ok(())
}

/// Fit the baseline trend for one validated series.
///
/// Closed-form normal equations over centered time:
/// `slope = sxy / sxx`, `intercept = y_mean - slope * t_mean`.
/// The caller runs [`validate_series`] first; this function only re-checks
/// the degeneracy it can introduce itself (zero time spread).
pub fn fit_baseline(series: &AxisSeries, fitted_at: DateTime<Utc>) -> Result<BaselineModel, FitError> {
    let key = series.key;
    let n = series.len() as f64;

    let t_mean = series
        .samples
        .iter()
        .map(|&(ts, _)| epoch_secs(ts))
        .sum::<f64>()
        / n;
    let y_mean = series.samples.iter().map(|&(_, v)| v).sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for &(ts, value) in &series.samples {
        let dt = epoch_secs(ts) - t_mean;
        sxx += dt * dt;
        sxy += dt * (value - y_mean);
    }

    if sxx <= 0.0 {
        return Err(FitError::DegenerateTime { key });
    }

    let slope = sxy / sxx;
    let intercept = y_mean - slope * t_mean;

    debug!(
        pair = %key,
        slope,
        intercept,
        samples = series.len(),
        "Baseline fitted"
    );

    Ok(BaselineModel {
        robot_id: key.robot_id,
        axis: key.axis,
        slope,
        intercept,
        fitted_at,
        sample_count: series.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(offset: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + offset, 0)
            .single()
            .expect("valid ts")
    }

    fn series_from(values: impl IntoIterator<Item = (i64, f64)>) -> AxisSeries {
        let mut s = AxisSeries::new(AxisKey::new(1, 3));
        for (offset, v) in values {
            s.push(ts(offset), v);
        }
        s
    }

    fn lenient_cfg() -> TrainingConfig {
        TrainingConfig {
            min_samples: 3,
            min_positive_residuals: 1,
            valid_current_min: -1_000.0,
            valid_current_max: 1_000.0,
        }
    }

    #[test]
    fn test_exact_line_recovery() {
        // y = 0.5 * (t - t0) + 10, expressed in absolute epoch time
        let t0 = epoch_secs(ts(0));
        let series = series_from((0..50).map(|i| (i, 0.5 * i as f64 + 10.0)));
        let model = fit_baseline(&series, ts(100)).expect("fit");

        assert!((model.slope - 0.5).abs() < 1e-9);
        // intercept in absolute time: 10 - 0.5 * t0
        assert!((model.intercept - (10.0 - 0.5 * t0)).abs() < 1e-3);
        // predictions reproduce the line exactly
        assert!((model.predict(ts(20)) - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_least_squares_minimizer_matches_independent_computation() {
        // Noisy data; verify against the un-centered normal equations
        // computed over small relative times where they are stable.
        let data: Vec<(i64, f64)> = vec![
            (0, 10.2),
            (10, 10.9),
            (20, 12.1),
            (30, 12.8),
            (40, 14.3),
            (50, 14.9),
        ];
        let series = series_from(data.clone());
        let model = fit_baseline(&series, ts(60)).expect("fit");

        // Independent fit over relative time r = t - t0
        let n = data.len() as f64;
        let sr: f64 = data.iter().map(|&(r, _)| r as f64).sum();
        let sy: f64 = data.iter().map(|&(_, y)| y).sum();
        let srr: f64 = data.iter().map(|&(r, _)| (r as f64) * (r as f64)).sum();
        let sry: f64 = data.iter().map(|&(r, y)| r as f64 * y).sum();
        let slope_ref = (n * sry - sr * sy) / (n * srr - sr * sr);

        assert!((model.slope - slope_ref).abs() < 1e-9);

        // Residual sum against the fitted line is minimal: perturbing the
        // slope in either direction must not reduce the SSE.
        let sse = |slope: f64, intercept: f64| -> f64 {
            series
                .samples
                .iter()
                .map(|&(t, y)| {
                    let p = slope * epoch_secs(t) + intercept;
                    (y - p) * (y - p)
                })
                .sum()
        };
        let base = sse(model.slope, model.intercept);
        for eps in [1e-4, -1e-4] {
            let perturbed_slope = model.slope + eps;
            // re-solve intercept for the perturbed slope (best intercept given slope)
            let y_mean = sy / n;
            let t_mean: f64 =
                series.samples.iter().map(|&(t, _)| epoch_secs(t)).sum::<f64>() / n;
            let intercept = y_mean - perturbed_slope * t_mean;
            assert!(sse(perturbed_slope, intercept) >= base);
        }
    }

    #[test]
    fn test_centered_fit_stable_at_epoch_magnitude() {
        // A flat signal at large epoch timestamps: slope must come out ~0,
        // not garbage from catastrophic cancellation.
        let series = series_from((0..100).map(|i| (i * 60, 42.0)));
        let model = fit_baseline(&series, ts(10_000)).expect("fit");
        assert!(model.slope.abs() < 1e-12);
        assert!((model.predict(ts(3_000)) - 42.0).abs() < 1e-6);
    }

    #[test]
    fn test_validation_rejects_duplicate_timestamp() {
        let mut series = series_from([(0, 1.0), (1, 2.0), (2, 3.0)]);
        series.push(ts(2), 4.0);
        let err = validate_series(&series, &lenient_cfg()).expect_err("must reject");
        assert!(matches!(err, FitError::DuplicateTimestamp { index: 3, .. }));
    }

    #[test]
    fn test_validation_rejects_backwards_time() {
        let series = series_from([(0, 1.0), (10, 2.0), (5, 3.0)]);
        let err = validate_series(&series, &lenient_cfg()).expect_err("must reject");
        assert!(matches!(err, FitError::NonMonotonicTime { index: 2, .. }));
    }

    #[test]
    fn test_validation_rejects_out_of_range_and_nan() {
        let cfg = TrainingConfig {
            valid_current_min: 0.0,
            valid_current_max: 100.0,
            ..lenient_cfg()
        };
        let series = series_from([(0, 1.0), (1, 250.0), (2, 3.0)]);
        assert!(matches!(
            validate_series(&series, &cfg),
            Err(FitError::OutOfRange { index: 1, .. })
        ));

        let series = series_from([(0, 1.0), (1, f64::NAN), (2, 3.0)]);
        assert!(matches!(
            validate_series(&series, &cfg),
            Err(FitError::NonFinite { index: 1 , .. })
        ));
    }

    #[test]
    fn test_validation_rejects_short_series() {
        let series = series_from([(0, 1.0), (1, 2.0)]);
        assert!(matches!(
            validate_series(&series, &lenient_cfg()),
            Err(FitError::TooFewSamples { have: 2, need: 3, .. })
        ));
    }
}
