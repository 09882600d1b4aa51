//! axis-sentinel - baseline-deviation detection for robot axis telemetry
//!
//! # Usage
//!
//! ```bash
//! # Fit baselines and derive thresholds from a historical window
//! axis-sentinel train --csv history.csv
//!
//! # Stream a live replay against the published models
//! axis-sentinel stream --csv live.csv --delay-ms 0
//!
//! # Pipe the simulator in as a live source
//! telemetry-sim --format json | axis-sentinel stream --stdin
//!
//! # Train and replay in one invocation
//! axis-sentinel run --train-csv history.csv --live-csv live.csv
//! ```
//!
//! # Environment Variables
//!
//! - `SENTINEL_CONFIG`: path to a detector_config.toml
//! - `RUST_LOG`: logging level (default: info)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use axis_sentinel::config::{self, DetectorConfig};
use axis_sentinel::emitter::{EventEmitter, EventSink, JsonlSink, SledSink, TracingSink};
use axis_sentinel::pipeline::source::{load_csv, CsvSource, StdinSource, TelemetrySource};
use axis_sentinel::pipeline::DetectorPipeline;
use axis_sentinel::scorer::DiagnosticCounters;
use axis_sentinel::store::ModelStore;
use axis_sentinel::training::train_and_publish;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "axis-sentinel")]
#[command(about = "Baseline-deviation detection engine for robot axis telemetry")]
#[command(version)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit per-pair baselines from a historical CSV and publish thresholds
    Train {
        /// Historical telemetry CSV (robot_id,axis,timestamp,current)
        #[arg(long)]
        csv: PathBuf,

        /// Where to write the model snapshot (default: from config)
        #[arg(long)]
        models: Option<PathBuf>,
    },

    /// Score a live stream against published models and emit events
    Stream {
        /// Replay a telemetry CSV as the live source
        #[arg(long, conflicts_with = "stdin")]
        csv: Option<PathBuf>,

        /// Read JSON telemetry records from stdin
        #[arg(long)]
        stdin: bool,

        /// Model snapshot to load (default: from config)
        #[arg(long)]
        models: Option<PathBuf>,

        /// Delay between replayed CSV records in milliseconds (0 = flat out)
        #[arg(long, default_value = "0")]
        delay_ms: u64,

        /// Disable the durable sled event sink
        #[arg(long)]
        no_event_db: bool,
    },

    /// Train from one CSV, then replay another as the live stream
    Run {
        #[arg(long)]
        train_csv: PathBuf,

        #[arg(long)]
        live_csv: PathBuf,

        #[arg(long, default_value = "0")]
        delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    config::init(DetectorConfig::load());
    for finding in config::get().validate() {
        warn!(%finding, "Config validation finding");
    }

    match args.command {
        Command::Train { csv, models } => {
            let model_path = models
                .unwrap_or_else(|| PathBuf::from(&config::get().storage.model_state_path));
            train(&csv, &model_path)
        }
        Command::Stream {
            csv,
            stdin,
            models,
            delay_ms,
            no_event_db,
        } => {
            let model_path = models
                .unwrap_or_else(|| PathBuf::from(&config::get().storage.model_state_path));
            let store = Arc::new(ModelStore::load_or_new(&model_path));
            if store.is_empty() {
                bail!(
                    "no published models at {} — run `axis-sentinel train` first",
                    model_path.display()
                );
            }

            if stdin {
                stream(store, StdinSource::new(), no_event_db).await
            } else if let Some(path) = csv {
                let source = CsvSource::from_path(&path, delay_ms)?;
                stream(store, source, no_event_db).await
            } else {
                bail!("stream requires --csv or --stdin");
            }
        }
        Command::Run {
            train_csv,
            live_csv,
            delay_ms,
        } => {
            let model_path = PathBuf::from(&config::get().storage.model_state_path);
            train(&train_csv, &model_path)?;
            let store = Arc::new(ModelStore::load_or_new(&model_path));
            let source = CsvSource::from_path(&live_csv, delay_ms)?;
            stream(store, source, false).await
        }
    }
}

/// Training entry point: load, fit, derive, publish, snapshot.
fn train(csv: &Path, model_path: &Path) -> Result<()> {
    let records = load_csv(csv)?;
    if records.is_empty() {
        bail!("no telemetry records in {}", csv.display());
    }
    info!(records = records.len(), "Loaded training window");

    // continue version counters from any existing snapshot
    let store = Arc::new(ModelStore::load_or_new(model_path));
    let report = train_and_publish(&store, &records);
    for (key, reason) in &report.skipped {
        warn!(pair = %key, reason = %reason, "Pair skipped");
    }
    if report.activated.is_empty() {
        bail!("no pair produced a usable baseline — nothing published");
    }

    store
        .save_to_file(model_path)
        .context("saving model snapshot")?;
    info!(
        activated = report.activated.len(),
        skipped = report.skipped.len(),
        path = %model_path.display(),
        "Training complete"
    );
    Ok(())
}

/// Streaming entry point: build sinks, run the pipeline until the source
/// ends or ctrl-c, then drain and report.
async fn stream<S: TelemetrySource>(
    store: Arc<ModelStore>,
    source: S,
    no_event_db: bool,
) -> Result<()> {
    let storage = &config::get().storage;
    let mut sinks: Vec<Box<dyn EventSink>> = vec![Box::new(TracingSink)];
    sinks.push(Box::new(JsonlSink::open(Path::new(&storage.event_log_path))?));
    if !no_event_db {
        sinks.push(Box::new(SledSink::open(Path::new(&storage.event_db_path))?));
    }

    let counters = Arc::new(DiagnosticCounters::new());
    let pipeline = DetectorPipeline::new(store, EventEmitter::new(sinks), counters);

    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C — aborting stream");
            cancel.cancel();
        }
    });

    pipeline.run_source(source).await;
    let snapshot = pipeline.shutdown().await;

    info!(
        events = snapshot.events_emitted,
        suppressed = snapshot.events_suppressed,
        "Stream finished"
    );
    Ok(())
}
