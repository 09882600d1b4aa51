//! Episode State Machine - continuous-duration exceedance tracking
//!
//! One independent `EpisodeTracker` per (robot, axis) pair. Tracks continuous
//! runs of residuals at or above `min_c`, escalates severity monotonically
//! when `max_c` is reached, and emits exactly one [`Event`] per qualifying
//! episode at close time.
//!
//! Two firewalls keep output honest:
//! - duration gating: an episode shorter than `persist_seconds` is noise and
//!   is discarded silently
//! - cooldown: once an event is emitted for a pair, later episodes of
//!   same-or-lower severity are suppressed until the cooldown has elapsed
//!   since the prior event's end. Detection keeps running either way; only
//!   emission is rate-limited.
//!
//! The tracker never performs I/O. Emission is returning an `Event` to the
//! caller; where it goes from there is the emitter's concern.

use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::scorer::DiagnosticCounters;
use crate::types::{AxisKey, Event, EventType, ScoredPoint, Severity, ThresholdSet};

/// Malformed stream input. The record is rejected without touching episode
/// state, so duration tracking stays intact.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("out-of-order record for {key}: {timestamp} is older than last seen {last_seen}")]
    OutOfOrderRecord {
        key: AxisKey,
        timestamp: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    },
}

/// One open exceedance run. Owned exclusively by its tracker; destroyed on
/// close (emitting zero or one event).
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    pub severity: Severity,
    pub start_time: DateTime<Utc>,
    pub last_time: DateTime<Utc>,
    pub first_residual: f64,
    pub last_residual: f64,
    pub peak_residual: f64,
    pub residual_sum: f64,
    pub sample_count: u64,
}

impl Episode {
    fn open(point: &ScoredPoint, thresholds: &ThresholdSet) -> Self {
        let severity = if point.residual >= thresholds.max_c {
            Severity::Critical
        } else {
            Severity::Watching
        };
        Self {
            severity,
            start_time: point.timestamp,
            last_time: point.timestamp,
            first_residual: point.residual,
            last_residual: point.residual,
            peak_residual: point.residual,
            residual_sum: point.residual,
            sample_count: 1,
        }
    }

    fn continue_with(&mut self, point: &ScoredPoint, thresholds: &ThresholdSet) {
        self.last_time = point.timestamp;
        self.last_residual = point.residual;
        self.peak_residual = self.peak_residual.max(point.residual);
        self.residual_sum += point.residual;
        self.sample_count += 1;
        // monotonic upgrade only; the episode is classified at close time by
        // the maximum severity it ever reached
        if point.residual >= thresholds.max_c {
            self.severity = Severity::Critical;
        }
    }

    /// Span of in-breach samples in seconds.
    pub fn duration_seconds(&self) -> f64 {
        (self.last_time - self.start_time).num_milliseconds() as f64 / 1000.0
    }

    /// Projected days until the residual reaches `max_c`, extrapolating the
    /// episode's own first-to-last residual trend. A critical episode is
    /// already there (`0.0`); a flat or declining trend projects no crossing.
    pub fn projected_ttf_days(&self, max_c: f64) -> Option<f64> {
        if self.severity == Severity::Critical {
            return Some(0.0);
        }
        let duration = self.duration_seconds();
        if duration <= 0.0 {
            return None;
        }
        let rate = (self.last_residual - self.first_residual) / duration;
        if rate <= 0.0 {
            return None;
        }
        let remaining = (max_c - self.last_residual).max(0.0);
        Some(remaining / rate / 86_400.0)
    }
}

#[derive(Debug)]
enum TrackerState {
    Normal,
    InBreach(Episode),
}

// ============================================================================
// Tracker
// ============================================================================

/// Per-pair episode state machine. Strictly sequential: one tracker is only
/// ever driven by one worker, so there is no shared mutable state to guard.
#[derive(Debug)]
pub struct EpisodeTracker {
    key: AxisKey,
    state: TrackerState,
    /// Newest timestamp accepted for this pair, breach or not.
    last_seen: Option<DateTime<Utc>>,
    /// Type and end time of the last event actually emitted (not suppressed).
    last_emitted: Option<(EventType, DateTime<Utc>)>,
    max_gap_seconds: f64,
    cooldown_seconds: f64,
    counters: Arc<DiagnosticCounters>,
}

impl EpisodeTracker {
    pub fn new(
        key: AxisKey,
        max_gap_seconds: f64,
        cooldown_seconds: f64,
        counters: Arc<DiagnosticCounters>,
    ) -> Self {
        Self {
            key,
            state: TrackerState::Normal,
            last_seen: None,
            last_emitted: None,
            max_gap_seconds,
            cooldown_seconds,
            counters,
        }
    }

    pub fn key(&self) -> AxisKey {
        self.key
    }

    /// Whether an episode is currently open.
    pub fn in_breach(&self) -> bool {
        matches!(self.state, TrackerState::InBreach(_))
    }

    /// Evaluate one scored point against the thresholds of the model version
    /// it was scored with. Returns at most one event (an episode closure).
    pub fn observe(
        &mut self,
        point: &ScoredPoint,
        thresholds: &ThresholdSet,
    ) -> Result<Option<Event>, StreamError> {
        if let Some(last_seen) = self.last_seen {
            if point.timestamp < last_seen {
                self.counters
                    .out_of_order_rejected
                    .fetch_add(1, Ordering::Relaxed);
                return Err(StreamError::OutOfOrderRecord {
                    key: self.key,
                    timestamp: point.timestamp,
                    last_seen,
                });
            }
        }
        self.last_seen = Some(point.timestamp);

        let r = point.residual;
        match std::mem::replace(&mut self.state, TrackerState::Normal) {
            TrackerState::Normal => {
                if r >= thresholds.min_c {
                    self.state = TrackerState::InBreach(Episode::open(point, thresholds));
                }
                Ok(None)
            }
            TrackerState::InBreach(mut episode) => {
                let gap = (point.timestamp - episode.last_time).num_milliseconds() as f64 / 1000.0;
                if gap > self.max_gap_seconds {
                    // sensor dropout: close as if the breach ended, then treat
                    // the current sample as a fresh arrival
                    let event = self.close_episode(episode, thresholds);
                    if r >= thresholds.min_c {
                        self.state = TrackerState::InBreach(Episode::open(point, thresholds));
                    }
                    return Ok(event);
                }

                if r >= thresholds.min_c {
                    episode.continue_with(point, thresholds);
                    self.state = TrackerState::InBreach(episode);
                    Ok(None)
                } else {
                    Ok(self.close_episode(episode, thresholds))
                }
            }
        }
    }

    /// Close an episode: duration-gate, classify, apply cooldown, build the
    /// event. Leaves the tracker in `Normal`.
    fn close_episode(&mut self, episode: Episode, thresholds: &ThresholdSet) -> Option<Event> {
        let duration = episode.duration_seconds();
        if duration < thresholds.persist_seconds {
            // transient spike: discarded without a trace beyond the counter
            self.counters
                .episodes_discarded
                .fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let event_type = match episode.severity {
            Severity::Critical => EventType::Error,
            Severity::Watching => EventType::Alert,
        };

        if let Some((prev_type, prev_end)) = self.last_emitted {
            let since_prev = (episode.start_time - prev_end).num_milliseconds() as f64 / 1000.0;
            if since_prev < self.cooldown_seconds && event_type <= prev_type {
                self.counters
                    .events_suppressed
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    pair = %self.key,
                    %event_type,
                    since_prev_secs = since_prev,
                    "Qualifying episode suppressed by cooldown"
                );
                return None;
            }
        }

        let threshold_used = match event_type {
            EventType::Error => thresholds.max_c,
            EventType::Alert => thresholds.min_c,
        };
        let event = Event {
            robot_id: self.key.robot_id,
            axis: self.key.axis,
            event_type,
            start_time: episode.start_time,
            end_time: episode.last_time,
            duration_seconds: duration,
            max_residual: episode.peak_residual,
            avg_residual: episode.residual_sum / episode.sample_count as f64,
            threshold_used,
            predicted_ttf_days: episode.projected_ttf_days(thresholds.max_c),
        };
        self.last_emitted = Some((event_type, event.end_time));
        self.counters.events_emitted.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    /// Shutdown hook. An open episode is left unresolved by policy: it is
    /// logged for the operator and dropped, never emitted, because its true
    /// end time is unknown.
    pub fn finish(&mut self) -> Option<Episode> {
        match std::mem::replace(&mut self.state, TrackerState::Normal) {
            TrackerState::Normal => None,
            TrackerState::InBreach(episode) => {
                info!(
                    pair = %self.key,
                    severity = %episode.severity,
                    samples = episode.sample_count,
                    span_secs = episode.duration_seconds(),
                    "Open episode dropped at stream shutdown"
                );
                Some(episode)
            }
        }
    }
}
