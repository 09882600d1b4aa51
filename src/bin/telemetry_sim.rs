//! Telemetry Simulator
//!
//! Generates synthetic robot axis-current telemetry for exercising the
//! detection engine end to end: a gentle per-axis linear drift plus Gaussian
//! noise, with an optional injected excess-consumption fault that ramps one
//! pair's current above its trend partway through the run.
//!
//! # Usage
//! ```bash
//! # training window
//! telemetry-sim --duration-secs 3600 --format csv > history.csv
//!
//! # live stream with a fault on robot 2 axis 3, piped into the detector
//! telemetry-sim --duration-secs 600 --fault 2:3 --format json \
//!     | axis-sentinel stream --stdin
//! ```

use anyhow::{bail, Result};
use chrono::{Duration, TimeZone, Utc};
use clap::Parser;
use rand::prelude::*;
use rand_distr::Normal;
use std::io::{self, Write};

use axis_sentinel::types::TelemetryRecord;

#[derive(Parser, Debug)]
#[command(name = "telemetry-sim")]
#[command(about = "Synthetic robot axis-current telemetry generator")]
#[command(version)]
struct Args {
    /// Number of robots in the simulated fleet
    #[arg(long, default_value = "4", value_parser = clap::value_parser!(u32).range(1..=64))]
    robots: u32,

    /// Axes per robot
    #[arg(long, default_value = "6", value_parser = clap::value_parser!(u8).range(1..=8))]
    axes: u8,

    /// Simulated duration in seconds
    #[arg(long, default_value = "3600")]
    duration_secs: u64,

    /// Samples per second per pair
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..=10))]
    sample_rate: u32,

    /// Epoch start of the simulated window (seconds)
    #[arg(long, default_value = "1700000000")]
    start_epoch: i64,

    /// Inject an excess-current fault on one pair, e.g. "2:3" (robot:axis).
    /// The fault ramps in over the second half of the run.
    #[arg(long)]
    fault: Option<String>,

    /// Output format: csv or json
    #[arg(short, long, default_value = "csv")]
    format: String,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,
}

/// Per-pair trend parameters, deterministic in (robot, axis) so training and
/// live runs of the same fleet line up.
fn pair_profile(robot_id: u32, axis: u8) -> (f64, f64, f64) {
    let base = 8.0 + f64::from(robot_id) * 1.5 + f64::from(axis) * 0.75;
    let drift_per_hour = 0.02 + f64::from(axis) * 0.005;
    let noise_std = 0.15 + f64::from(axis) * 0.02;
    (base, drift_per_hour / 3600.0, noise_std)
}

fn parse_fault(spec: &str) -> Result<(u32, u8)> {
    let Some((robot, axis)) = spec.split_once(':') else {
        bail!("--fault expects robot:axis, e.g. 2:3");
    };
    Ok((robot.trim().parse()?, axis.trim().parse()?))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let fault = args.fault.as_deref().map(parse_fault).transpose()?;
    let mut rng: StdRng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let Some(start) = Utc.timestamp_opt(args.start_epoch, 0).single() else {
        bail!("invalid --start-epoch {}", args.start_epoch);
    };
    let step_ms = 1000 / i64::from(args.sample_rate);
    let total_steps = args.duration_secs * u64::from(args.sample_rate);
    let fault_onset = total_steps / 2;

    // precompute per-pair profiles and noise distributions
    let mut profiles = Vec::new();
    for robot_id in 1..=args.robots {
        for axis in 1..=args.axes {
            let (base, drift, noise_std) = pair_profile(robot_id, axis);
            profiles.push((robot_id, axis, base, drift, noise_std, Normal::new(0.0, noise_std)?));
        }
    }

    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    if args.format == "csv" {
        writeln!(out, "robot_id,axis,timestamp,current")?;
    } else if args.format != "json" {
        bail!("--format must be csv or json, got {}", args.format);
    }

    for step in 0..total_steps {
        let ts = start + Duration::milliseconds(step as i64 * step_ms);
        let elapsed_secs = step as f64 / f64::from(args.sample_rate);

        for &(robot_id, axis, base, drift, noise_std, normal) in &profiles {
            let mut current = base + drift * elapsed_secs + normal.sample(&mut rng);

            if let Some((fr, fa)) = fault {
                if robot_id == fr && axis == fa && step >= fault_onset {
                    // ramp from 0 to ~8x the noise band over the rest of the run
                    let progress = (step - fault_onset) as f64
                        / (total_steps - fault_onset).max(1) as f64;
                    current += 8.0 * noise_std * progress;
                }
            }

            let record = TelemetryRecord {
                robot_id,
                axis,
                timestamp: ts,
                current,
            };
            if args.format == "json" {
                writeln!(out, "{}", serde_json::to_string(&record)?)?;
            } else {
                writeln!(
                    out,
                    "{},{},{},{:.4}",
                    record.robot_id,
                    record.axis,
                    record.timestamp.to_rfc3339(),
                    record.current
                )?;
            }
        }
    }
    out.flush()?;
    Ok(())
}
