//! CLI entry point for `capmon`.
//!
//! ```bash
//! capmon measure --seconds 30          # measure 30 s, then export CSV
//! capmon sequence plan.json            # run a planned step list
//! capmon inspect measurement.csv       # print metadata and a summary
//! capmon identify                      # query *IDN? of the configured instrument
//! capmon config                        # print the effective configuration
//! ```

use anyhow::{bail, Context, Result};
use capmon::actor::MonitorHandle;
use capmon::config::MonitorConfig;
use capmon::data::csv_storage;
use capmon::hardware::{self, InstrumentPort};
use capmon::tools::{ToolCall, ToolNotification};
use capmon::tracing_init;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "capmon")]
#[command(about = "Capacitance/resistance monitor with timed measurement sequences", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure for a fixed duration
    Measure {
        /// Duration in seconds
        #[arg(long)]
        seconds: f64,

        /// Skip the CSV export after stopping
        #[arg(long)]
        no_export: bool,
    },

    /// Execute a JSON step list and wait for it to finish
    Sequence {
        /// File holding `[{"action": ..., "time_offset": ...}, ...]`
        file: PathBuf,
    },

    /// Print metadata and a summary of a saved CSV
    Inspect { file: PathBuf },

    /// Open the configured instrument and print its identification
    Identify,

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MonitorConfig::load_from(path),
        None => MonitorConfig::load(),
    }
    .context("Failed to load configuration")?;
    config.validate()?;
    tracing_init::init_from_config(&config)?;

    match cli.command {
        Commands::Measure { seconds, no_export } => measure(&config, seconds, !no_export).await,
        Commands::Sequence { file } => run_sequence(&config, file).await,
        Commands::Inspect { file } => inspect(file),
        Commands::Identify => identify(&config).await,
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn measure(config: &MonitorConfig, seconds: f64, auto_export: bool) -> Result<()> {
    let handle = MonitorHandle::spawn(config);
    let mut notifications = handle.notifications();

    let scheduled = handle
        .call(ToolCall::ScheduleMeasurement {
            duration_seconds: Some(seconds),
            duration_minutes: None,
            auto_export,
        })
        .await?;
    println!("{}", scheduled.message);
    if !scheduled.success {
        handle.shutdown().await?;
        bail!("measurement was not scheduled");
    }

    let last_tool = if auto_export {
        "export_csv"
    } else {
        "stop_measurement"
    };

    loop {
        tokio::select! {
            notification = notifications.recv() => {
                let Some(notification) = received(notification) else { continue };
                println!("{}", notification.result.message);
                if notification.tool == last_tool {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping measurement");
                let stopped = handle.call(ToolCall::StopMeasurement).await?;
                println!("{}", stopped.message);
                break;
            }
        }
    }

    let status = handle.call(ToolCall::GetStatus).await?;
    println!("{}", status.message);
    handle.shutdown().await?;
    Ok(())
}

async fn run_sequence(config: &MonitorConfig, file: PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let sequence: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;

    let handle = MonitorHandle::spawn(config);
    let mut notifications = handle.notifications();

    let started = handle
        .call(ToolCall::ExecuteMeasurementSequence { sequence })
        .await?;
    println!("{}", started.message);
    if !started.success {
        handle.shutdown().await?;
        bail!("sequence was rejected");
    }

    loop {
        tokio::select! {
            notification = notifications.recv() => {
                let Some(notification) = received(notification) else { continue };
                let marker = if notification.result.success { "ok" } else { "FAILED" };
                println!("[{marker}] {}: {}", notification.tool, notification.result.message);

                let status = handle.call(ToolCall::GetSequenceStatus).await?;
                let active = status
                    .data
                    .as_ref()
                    .and_then(|d| d["active"].as_bool())
                    .unwrap_or(false);
                if !active {
                    println!("{}", status.message);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling sequence");
                handle.call(ToolCall::CancelSequence).await?;
                break;
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}

fn received(
    notification: Result<ToolNotification, broadcast::error::RecvError>,
) -> Option<ToolNotification> {
    match notification {
        Ok(n) => Some(n),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "Missed notifications");
            None
        }
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

fn inspect(file: PathBuf) -> Result<()> {
    let loaded = csv_storage::load(&file)?;
    let meta = &loaded.metadata;

    println!("File:            {}", file.display());
    println!("Mode:            {}", meta.mode);
    println!("Start time:      {}", meta.start_time.to_rfc3339());
    if let Some(end) = meta.end_time {
        println!("End time:        {}", end.to_rfc3339());
    }
    println!("Sample period:   {} ms", meta.sample_period_ms);
    println!("Instrument:      {}", meta.instrument_type);
    if let Some(resource) = &meta.resource {
        println!("Resource:        {resource}");
    }
    println!("Samples:         {}", loaded.samples.len());

    let values: Vec<f64> = loaded.samples.iter().map(|s| s.value.raw()).collect();
    if !values.is_empty() {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let unit = meta.mode.unit();
        println!("Min:             {min:.6e} {unit}");
        println!("Max:             {max:.6e} {unit}");
        println!("Mean:            {mean:.6e} {unit}");
        if let Some(last) = loaded.samples.last() {
            println!("Span:            {:.3} s", last.t_seconds);
        }
    }
    Ok(())
}

async fn identify(config: &MonitorConfig) -> Result<()> {
    let instrument_config = config.instrument.clone();
    let synthetic_config = config.synthetic.clone();
    let mode = config.acquisition.mode;

    let idn = tokio::task::spawn_blocking(move || -> Result<String> {
        let mut instrument = hardware::build_instrument(&instrument_config, &synthetic_config);
        instrument.open(instrument_config.resource.as_deref())?;
        let result = instrument
            .initialize(mode)
            .and_then(|()| instrument.identify());
        if let Err(e) = instrument.close() {
            warn!(error = %e, "Failed to close instrument");
        }
        Ok(result?)
    })
    .await??;

    info!(%idn, "Instrument identified");
    println!("{idn}");
    Ok(())
}
