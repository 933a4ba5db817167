use clap::Parser;
use fdlproc::parsing::handle::ParseState;
use fdlproc::parsing::session::CaptureSession;
use fdlproc::signals::calibration::{load_parameters, StaticCalibration};
use fdlproc::signals::catalog::SignalCatalog;
use fdlproc::signals::derivation::SignalDerivationEngine;
use itertools::Itertools;
use log::info;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

pub type BinResult<T, E = Box<dyn std::error::Error + Send + Sync>> = Result<T, E>;

fn main() {
    env_logger::init();
    if let Err(e) = bin_main() {
        eprintln!("error: {e}");
        if let Some(e) = e.source() {
            eprintln!("error: {e}");
        }
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Loops capture file
    #[arg(long)]
    loops: Option<PathBuf>,

    /// Diagnostics capture file
    #[arg(long)]
    diag: Option<PathBuf>,

    /// Calibration parameter file, one `name:value` per line
    #[arg(long)]
    params: Option<PathBuf>,

    /// Beam current in mA, overrides the parameter file
    #[arg(long)]
    beam_current: Option<f64>,

    /// Cancel the parses after this many seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Stop each parse once this many records are complete
    #[arg(long)]
    max_records: Option<usize>,

    /// Derive signals from cancelled parses too
    #[arg(long)]
    allow_partial: bool,
}

fn bin_main() -> BinResult<()> {
    let args = Args::parse();
    if args.loops.is_none() && args.diag.is_none() {
        Err("at least one of --loops or --diag is required")?
    }

    let catalog = SignalCatalog::default_catalog()?;
    let mut calibration = match &args.params {
        Some(path) => load_parameters(path, &catalog)?,
        None => StaticCalibration::new(),
    };
    if let Some(beam_current) = args.beam_current {
        calibration = calibration.with_beam_current(beam_current);
    }

    let mut session = CaptureSession::start(args.loops, args.diag, &catalog)?;
    if let Some(max_records) = args.max_records {
        session.cancel_after(max_records);
    }
    let t0 = Instant::now();
    let mut last_percent = None;
    while session.state() == ParseState::Running {
        let progress = session.progress();
        if last_percent != Some(progress.percent) {
            info!(
                "{}% parsed, {} anomalies (rate {:.4})",
                progress.percent,
                progress.anomaly_count,
                progress.anomaly_rate()
            );
            last_percent = Some(progress.percent);
        }
        if let Some(timeout) = args.timeout {
            if t0.elapsed().as_secs_f64() > timeout {
                session.cancel();
                break;
            }
        }
        thread::sleep(Duration::from_millis(100));
    }
    session.wait();

    let captures = if args.allow_partial {
        session.finish_partial()?
    } else {
        session.finish()?
    };
    for (name, outcome) in captures.outcomes.iter() {
        let distances = outcome
            .anomalies
            .iter()
            .counts()
            .into_iter()
            .sorted()
            .map(|(distance, n)| format!("{distance}x{n}"))
            .join(", ");
        println!(
            "{name}: {} records, {} anomalies (rate {:.4}), first separator at {}, distances [{}]",
            outcome.complete_records,
            outcome.anomalies.len(),
            outcome.anomaly_rate(),
            outcome.first_sentinel,
            distances
        );
    }

    let engine = SignalDerivationEngine::new(catalog);
    let derivation = captures.derive(&engine, &calibration);
    if !derivation.defaulted.is_empty() {
        println!(
            "Neutral coefficients used for: {}",
            derivation.defaulted.iter().join(", ")
        );
    }
    for (name, error) in derivation.failed.iter() {
        println!("{name}: not computed, {error}");
    }
    for (name, values) in derivation.signals.iter() {
        if values.is_empty() {
            println!("{name}: empty");
            continue;
        }
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            });
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        println!("{name}: n={} min={min:.4} mean={mean:.4} max={max:.4}", values.len());
    }
    if let Some(e) = derivation.error() {
        Err(e)?
    }
    Ok(())
}
