//! Detector Configuration - all tuning knobs as operator-editable TOML values
//!
//! Every statistic that controls the false-positive rate (percentiles, the
//! persistence rule, cooldown) is a field here rather than a hardcoded
//! constant. Each struct implements `Default` with the values documented in
//! DESIGN.md, so behavior is identical when no config file is present.
//!
//! ## Loading Order
//!
//! 1. `SENTINEL_CONFIG` environment variable (path to TOML file)
//! 2. `detector_config.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! config::init(DetectorConfig::load());
//! let cooldown = config::get().streaming.cooldown_seconds;
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{info, warn};

/// Global detector configuration, initialized once at startup.
static DETECTOR_CONFIG: OnceLock<DetectorConfig> = OnceLock::new();

/// Initialize the global configuration. Repeated calls are ignored with a
/// warning so tests that share a process don't panic.
pub fn init(config: DetectorConfig) {
    if DETECTOR_CONFIG.set(config).is_err() {
        warn!("config::init() called more than once — ignoring");
    }
}

/// Get the global configuration, falling back to defaults when `init()` was
/// never called (library embedding, unit tests).
pub fn get() -> &'static DetectorConfig {
    DETECTOR_CONFIG.get_or_init(DetectorConfig::default)
}

/// Check whether the config has been explicitly initialized.
pub fn is_initialized() -> bool {
    DETECTOR_CONFIG.get().is_some()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a fleet deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Fleet identification
    #[serde(default)]
    pub fleet: FleetInfo,

    /// Training-time data quality and residual derivation
    #[serde(default)]
    pub training: TrainingConfig,

    /// Threshold and persistence derivation tuning
    #[serde(default)]
    pub thresholds: ThresholdTuning,

    /// Streaming state machine behavior
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Persistence paths
    #[serde(default)]
    pub storage: StorageConfig,
}

impl DetectorConfig {
    /// Load configuration using the standard search order:
    /// 1. `$SENTINEL_CONFIG` environment variable
    /// 2. `./detector_config.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("SENTINEL_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), fleet = %config.fleet.name, "Loaded detector config from SENTINEL_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from SENTINEL_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "SENTINEL_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from("detector_config.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(fleet = %config.fleet.name, "Loaded detector config from ./detector_config.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./detector_config.toml, using defaults");
                }
            }
        }

        info!("No detector_config.toml found — using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate field relationships. Returns human-readable findings; the
    /// caller decides whether to warn or abort. An empty vec means clean.
    pub fn validate(&self) -> Vec<String> {
        let mut findings = Vec::new();

        let t = &self.thresholds;
        if !(0.0..100.0).contains(&t.alert_percentile) {
            findings.push(format!(
                "thresholds.alert_percentile must be in [0, 100), got {}",
                t.alert_percentile
            ));
        }
        if !(0.0..=100.0).contains(&t.error_percentile) {
            findings.push(format!(
                "thresholds.error_percentile must be in [0, 100], got {}",
                t.error_percentile
            ));
        }
        if t.error_percentile <= t.alert_percentile {
            findings.push(format!(
                "thresholds.error_percentile ({}) must exceed alert_percentile ({})",
                t.error_percentile, t.alert_percentile
            ));
        }
        if !(0.0..=100.0).contains(&t.run_length_percentile) {
            findings.push(format!(
                "thresholds.run_length_percentile must be in [0, 100], got {}",
                t.run_length_percentile
            ));
        }
        if t.persistence_multiplier <= 0.0 {
            findings.push("thresholds.persistence_multiplier must be positive".to_string());
        }
        if t.min_persist_seconds <= 0.0 {
            findings.push("thresholds.min_persist_seconds must be positive".to_string());
        }

        if self.training.min_samples < 2 {
            findings.push("training.min_samples must be at least 2 for a line fit".to_string());
        }
        if self.training.valid_current_max <= self.training.valid_current_min {
            findings.push("training.valid_current_max must exceed valid_current_min".to_string());
        }

        if self.streaming.max_sample_gap_seconds <= 0.0 {
            findings.push("streaming.max_sample_gap_seconds must be positive".to_string());
        }
        if self.streaming.cooldown_seconds < 0.0 {
            findings.push("streaming.cooldown_seconds must not be negative".to_string());
        }
        if self.streaming.channel_capacity == 0 {
            findings.push("streaming.channel_capacity must be at least 1".to_string());
        }

        findings
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Fleet / site identification, carried into logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetInfo {
    #[serde(default = "default_fleet_name")]
    pub name: String,
}

fn default_fleet_name() -> String {
    "FLEET-001".to_string()
}

impl Default for FleetInfo {
    fn default() -> Self {
        Self {
            name: default_fleet_name(),
        }
    }
}

/// Training data quality gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Minimum samples a training series needs before fitting is attempted.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Minimum positive residuals required for threshold derivation.
    #[serde(default = "default_min_positive_residuals")]
    pub min_positive_residuals: usize,

    /// Lower bound of the declared valid axis-current range (amps).
    #[serde(default)]
    pub valid_current_min: f64,

    /// Upper bound of the declared valid axis-current range (amps).
    #[serde(default = "default_valid_current_max")]
    pub valid_current_max: f64,
}

fn default_min_samples() -> usize {
    100
}
fn default_min_positive_residuals() -> usize {
    30
}
fn default_valid_current_max() -> f64 {
    250.0
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            min_positive_residuals: default_min_positive_residuals(),
            valid_current_min: 0.0,
            valid_current_max: default_valid_current_max(),
        }
    }
}

/// Threshold derivation tuning. These knobs directly control the
/// false-positive rate; raise the percentiles for fewer events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdTuning {
    /// Positive-residual percentile for the early-warning band `min_c`.
    #[serde(default = "default_alert_percentile")]
    pub alert_percentile: f64,

    /// Positive-residual percentile for the critical band `max_c`.
    #[serde(default = "default_error_percentile")]
    pub error_percentile: f64,

    /// Percentile of training breach run-lengths used as the base for the
    /// persistence duration `T`. 50 = median.
    #[serde(default = "default_run_length_percentile")]
    pub run_length_percentile: f64,

    /// Multiplier applied to the run-length statistic: `T = mult * pctile`.
    /// Keeps T strictly above the typical training spike so transient noise
    /// never satisfies the persistence requirement on its own.
    #[serde(default = "default_persistence_multiplier")]
    pub persistence_multiplier: f64,

    /// Absolute floor for `T` (seconds).
    #[serde(default = "default_min_persist_seconds")]
    pub min_persist_seconds: f64,
}

fn default_alert_percentile() -> f64 {
    95.0
}
fn default_error_percentile() -> f64 {
    99.0
}
fn default_run_length_percentile() -> f64 {
    50.0
}
fn default_persistence_multiplier() -> f64 {
    2.0
}
fn default_min_persist_seconds() -> f64 {
    5.0
}

impl Default for ThresholdTuning {
    fn default() -> Self {
        Self {
            alert_percentile: default_alert_percentile(),
            error_percentile: default_error_percentile(),
            run_length_percentile: default_run_length_percentile(),
            persistence_multiplier: default_persistence_multiplier(),
            min_persist_seconds: default_min_persist_seconds(),
        }
    }
}

/// Streaming state machine behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Maximum inter-sample gap (seconds) an open episode will bridge.
    /// A larger gap closes the episode as if the breach had ended, so a
    /// sensor dropout can never stitch two separate breaches together.
    #[serde(default = "default_max_sample_gap")]
    pub max_sample_gap_seconds: f64,

    /// Minimum time between emitted events of same-or-lower severity for one
    /// pair, measured from the prior emitted event's end_time.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: f64,

    /// Bounded capacity of each per-pair worker channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_max_sample_gap() -> f64 {
    30.0
}
fn default_cooldown_seconds() -> f64 {
    300.0
}
fn default_channel_capacity() -> usize {
    256
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_sample_gap_seconds: default_max_sample_gap(),
            cooldown_seconds: default_cooldown_seconds(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Persistence paths for models and event sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON snapshot of published models + thresholds.
    #[serde(default = "default_model_state_path")]
    pub model_state_path: String,

    /// Sled database for the durable event sink.
    #[serde(default = "default_event_db_path")]
    pub event_db_path: String,

    /// Append-only JSON-lines event log.
    #[serde(default = "default_event_log_path")]
    pub event_log_path: String,
}

fn default_model_state_path() -> String {
    "data/model_state.json".to_string()
}
fn default_event_db_path() -> String {
    "data/events.db".to_string()
}
fn default_event_log_path() -> String {
    "data/events.jsonl".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            model_state_path: default_model_state_path(),
            event_db_path: default_event_db_path(),
            event_log_path: default_event_log_path(),
        }
    }
}
