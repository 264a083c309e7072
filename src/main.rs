//! # MPS Control Plane - Referee Binary
//!
//! Process entry point for the station control plane. The binary performs
//! these key operations:
//! 1. **Initialize logging**: detailed rolling file log plus a clean,
//!    colorized operator surface on stdout
//! 2. **Load configuration**: the typed `mps` section from a JSON file
//! 3. **Build the fleet**: one station per active config entry, transports
//!    connected (PLC, simulation or mockup)
//! 4. **Bridge**: couple the fleet to a fact sink (a logging stand-in when no
//!    rule engine is embedded) and start the status pump
//! 5. **Tick**: drive the periodic coarse-state broadcast until SIGINT
//!
//! Configuration errors abort startup; a station that refuses its initial
//! connection does not (the tick keeps retrying with backoff).

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mps_control::{
    bridge::{Bridge, EngineHandle, LoggingEngine},
    cli::Args,
    config::MpsConfig,
    fleet::Fleet,
};
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;

use logging::OperatorFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Verbosity of both the detailed log and the operator surface.
    // - default: INFO
    // -v: DEBUG
    // -vv and more: TRACE
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Detailed log layer (file or stderr). The guard must stay alive for the
    // duration of the program for file logging.
    let guard;
    let detailed_log_layer;

    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("mps-control.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "mps-control.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false) // No color codes in the file
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // Clean operator-facing layer on stdout, unless --quiet.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(OperatorFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    // Dropping the guard stops file logging; keep it for the process life.
    let _log_guard = guard;

    info!("Starting MPS control plane {}", mps_control::VERSION);
    if args.log_file.as_deref() != Some("stderr") {
        let today = chrono::Local::now().format("%Y-%m-%d");
        let base = args.log_file.as_deref().unwrap_or("mps-control.log");
        info!("Detailed log: {base}.{today}");
    }

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading configuration {}", args.config.display()))?;
    let mut config: MpsConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing configuration {}", args.config.display()))?;

    if let Some(mode) = args.connection {
        info!("Connection mode overridden to {mode} for all stations");
        config.connection = Some(mode);
    }
    if let Some(interval) = args.timer_interval {
        config.timer_interval_ms = interval;
    }

    if !config.enable {
        info!("MPS control disabled in the configuration, nothing to do");
        return Ok(());
    }

    let fleet = Arc::new(
        Fleet::new(&config)
            .await
            .context("building the station fleet")?,
    );
    info!("Fleet up with {} station(s)", fleet.len());

    // No embedded rule engine in the standalone binary; facts go to the log.
    let engine = EngineHandle::new(Arc::new(LoggingEngine));
    let bridge = Bridge::new(Arc::clone(&fleet), engine);

    let mut ticker = tokio::time::interval(config.timer_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => bridge.tick(),
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!("Failed to listen for shutdown signal: {err}");
                }
                break;
            }
        }
    }

    info!("Shutting down");
    fleet.shutdown();
    Ok(())
}
