//! AXIS-SENTINEL: Baseline-Deviation Detection for Robot Telemetry
//!
//! Raises early-warning (`Alert`) and critical (`Error`) events when an
//! axis's observed current sustainedly exceeds its learned baseline trend.
//!
//! ## Architecture
//!
//! - **Baseline Fitter**: per-(robot, axis) OLS trend from a historical window
//! - **Residual Analyzer**: data-driven thresholds + persistence duration
//! - **Model Store**: versioned, atomically published models
//! - **Streaming Scorer**: residual per live record
//! - **Episode State Machine**: duration-gated escalation with cooldown
//! - **Event Emitter**: fan-out of finalized events to sinks

pub mod baseline;
pub mod config;
pub mod emitter;
pub mod episode;
pub mod pipeline;
pub mod residual;
pub mod scorer;
pub mod store;
pub mod training;
pub mod types;

// Re-export configuration
pub use config::DetectorConfig;

// Re-export the data model
pub use types::{
    AxisKey, AxisSeries, BaselineModel, Event, EventType, ScoredPoint, Severity,
    TelemetryRecord, ThresholdSet,
};

// Re-export the detection engine
pub use baseline::{fit_baseline, validate_series, FitError};
pub use episode::{Episode, EpisodeTracker, StreamError};
pub use residual::{derive_thresholds, interpolated_percentile, ResidualError};
pub use scorer::{CounterSnapshot, DiagnosticCounters, ScoreError, StreamingScorer};
pub use store::{ModelStore, PairModel, StoreError};

// Re-export orchestration
pub use emitter::{EventEmitter, EventSink, JsonlSink, MemorySink, SledSink, TracingSink};
pub use pipeline::DetectorPipeline;
pub use training::{train_and_publish, train_pairs, TrainingReport};
