//! enose-station - headless acquisition driver
//!
//! Runs one measurement phase against the configured sensor board and prints
//! the countdown, live readings and the final report.
//!
//! # Usage
//!
//! ```bash
//! # Clean-air baseline on the configured port
//! enose-station baseline
//!
//! # Third numbered trial without hardware
//! enose-station --simulate trial 3
//!
//! # Capture an unknown sample, JSON report on stdout
//! enose-station --json classify
//! ```
//!
//! Ctrl+C once skips to finalization (the partial mean is kept); a second
//! Ctrl+C cancels the phase without writing a mean.
//!
//! # Environment Variables
//!
//! - `ENOSE_CONFIG`: Path to the station TOML config
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use enose_station::config::TransportKind;
use enose_station::types::format_countdown;
use enose_station::{
    PhaseKind, PhaseReport, PhaseState, Prediction, ProcessLock, SessionController,
    SessionHandle, StationConfig,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "enose-station")]
#[command(about = "E-Nose gas sensor acquisition station")]
#[command(version)]
struct CliArgs {
    /// Station config file (overrides ENOSE_CONFIG and ./enose_config.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Use the simulated sensor board instead of the serial port
    #[arg(long)]
    simulate: bool,

    /// Override the serial device path
    #[arg(long, value_name = "DEVICE")]
    port: Option<String>,

    /// Override the phase duration in seconds (bench runs)
    #[arg(long, value_name = "SECS")]
    duration: Option<f64>,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Clean-air reference capture
    Baseline,
    /// Numbered sample capture
    Trial {
        /// Trial number (1 or higher), used as the trial log key
        #[arg(value_parser = clap::value_parser!(u32).range(1..))]
        number: u32,
    },
    /// Capture an unknown sample for the classifier
    Classify,
    /// Purge the chamber; nothing is persisted
    Exhaust,
    /// Print the effective configuration as TOML and exit
    ShowConfig,
}

impl Command {
    fn phase(&self) -> Option<PhaseKind> {
        match self {
            Command::Baseline => Some(PhaseKind::Baseline),
            Command::Trial { number } => Some(PhaseKind::Trial(*number)),
            Command::Classify => Some(PhaseKind::Classification),
            Command::Exhaust => Some(PhaseKind::Exhaust),
            Command::ShowConfig => None,
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    let config = build_config(&args)?;

    let Some(phase) = args.command.phase() else {
        print!("{}", config.to_toml().context("Failed to render config")?);
        return Ok(());
    };

    let _lock = ProcessLock::acquire(&config.storage.data_dir)?;

    info!(
        phase = %phase,
        port = %config.serial.port,
        transport = ?config.serial.transport,
        channels = %config.channels.names.join(","),
        data_dir = %config.storage.data_dir,
        "E-Nose station starting"
    );

    let display = config.display_interval();
    let (session, controller) = SessionController::new(config)
        .spawn()
        .context("Failed to start session controller")?;

    let signals = tokio::spawn(forward_interrupts(session.clone()));

    let completion = session
        .start(phase)
        .await
        .context("Phase was not accepted")?;
    let outcome = watch_until_done(&session, completion, display).await;

    signals.abort();
    session.shutdown().await;
    let _ = controller.await;

    let report = outcome?;
    print_report(&report, args.json)?;
    Ok(())
}

/// Load config from `--config` or the standard search order, then apply CLI overrides.
fn build_config(args: &CliArgs) -> Result<StationConfig> {
    let mut config = match &args.config {
        Some(path) => StationConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => StationConfig::load(),
    };

    if args.simulate {
        config.serial.transport = TransportKind::Simulated;
    }
    if let Some(port) = &args.port {
        config.serial.port = port.clone();
    }
    if let Some(secs) = args.duration {
        let phases = &mut config.phases;
        for phase in [
            &mut phases.baseline,
            &mut phases.trial,
            &mut phases.classification,
            &mut phases.exhaust,
        ] {
            phase.duration_secs = secs;
        }
    }

    config.validate()?;
    Ok(config)
}

/// First Ctrl+C skips, the next one cancels.
async fn forward_interrupts(session: SessionHandle) {
    let mut presses = 0u32;
    while tokio::signal::ctrl_c().await.is_ok() {
        presses += 1;
        if presses == 1 {
            info!("Ctrl+C received, skipping to finalization (press again to cancel)");
            if !session.skip().await {
                warn!("No phase was gathering");
            }
        } else {
            info!("Ctrl+C received again, cancelling phase");
            session.cancel().await;
        }
    }
}

/// Log countdown and live values until the phase completes.
async fn watch_until_done(
    session: &SessionHandle,
    completion: enose_station::PhaseCompletion,
    display: std::time::Duration,
) -> Result<PhaseReport> {
    let wait = completion.wait();
    tokio::pin!(wait);
    let mut ticker = tokio::time::interval(display);

    loop {
        tokio::select! {
            outcome = &mut wait => return outcome.map_err(anyhow::Error::from),
            _ = ticker.tick() => {
                if let PhaseState::Gathering { remaining, .. } = session.state() {
                    let live = session.live();
                    let values = live
                        .values
                        .map(|v| v.iter().map(|x| format!("{x:.0}")).collect::<Vec<_>>().join(" "))
                        .unwrap_or_else(|| "-".to_string());
                    info!(
                        remaining = %format_countdown(remaining),
                        frames = live.frames,
                        rejected = live.rejected,
                        values = %values,
                        "Gathering"
                    );
                }
            }
        }
    }
}

fn print_report(report: &PhaseReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    info!(
        phase = %report.phase,
        stop = ?report.stop,
        frames = report.frames,
        rejected = report.rejected,
        "Phase complete"
    );
    if report.recovered_from_raw_log {
        warn!("Mean was recomputed from the raw log");
    }
    match &report.features {
        Some(features) => {
            for (name, mean) in features.iter() {
                println!("{name:>8}  {mean:.3}");
            }
        }
        None => println!("No mean recorded"),
    }
    match &report.prediction {
        Some(Prediction::Label(label)) => println!("Prediction: {label}"),
        Some(Prediction::Error(e)) => println!("Prediction failed: {e}"),
        None => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trial_number_must_be_positive() {
        assert!(CliArgs::try_parse_from(["enose-station", "trial", "0"]).is_err());

        let args = CliArgs::try_parse_from(["enose-station", "--simulate", "trial", "3"]).unwrap();
        assert_eq!(args.command.phase(), Some(PhaseKind::Trial(3)));
    }
}
