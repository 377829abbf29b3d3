//! SAP Daemon Binary
//!
//! This is the main entry point for the SAP daemon.
//! It loads the configuration, runs the AP state machine against loopback
//! collaborators and shuts down cleanly on a signal.

use sap_rust::{
    daemon::{DaemonBuilder, DaemonCommand, DaemonConfig, DaemonResponse, DaemonUtils},
    ChannelWidth, Result, SapConfig, SapError,
};
use clap::{Arg, Command};
use std::{path::PathBuf, process};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Default configuration file path
const DEFAULT_CONFIG_PATH: &str = "/etc/sap/daemon.toml";

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("sap-daemon")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Access-point radio lifecycle daemon")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (json, toml or yaml)")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("pid-file")
                .short('p')
                .long("pid-file")
                .value_name("FILE")
                .help("PID file path"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .default_value(DEFAULT_LOG_LEVEL),
        )
        .arg(
            Arg::new("channel")
                .long("channel")
                .value_name("MHZ")
                .help("Start the first interface on a fixed channel")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .value_name("MHZ")
                .help("Channel width for --channel (20, 40, 80, 160)")
                .value_parser(clap::value_parser!(u32))
                .default_value("20"),
        )
        .arg(
            Arg::new("check-config")
                .long("check-config")
                .help("Validate the configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or(DEFAULT_LOG_LEVEL);
    init_logging(log_level)?;

    info!("Starting SAP Daemon v{}", env!("CARGO_PKG_VERSION"));

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = load_configuration(&config_path)?;

    if matches.get_flag("check-config") {
        info!("Configuration {} is valid", config_path.display());
        return Ok(());
    }

    let auto_start = match matches.get_one::<u32>("channel") {
        Some(freq) => {
            let mhz = matches.get_one::<u32>("width").copied().unwrap_or(20);
            Some(SapConfig::fixed(*freq, parse_width(mhz)?))
        }
        None => None,
    };

    let pid_file = matches
        .get_one::<String>("pid-file")
        .map(PathBuf::from)
        .or_else(|| config.general.pid_file.clone());
    if let Some(path) = &pid_file {
        if let Some(pid) = DaemonUtils::read_pid_file(path)? {
            warn!("Replacing stale PID file {} (pid {})", path.display(), pid);
        }
        DaemonUtils::create_pid_file(path)?;
    }

    let result = run_daemon(config, auto_start).await;

    if let Some(path) = &pid_file {
        if let Err(e) = DaemonUtils::remove_pid_file(path) {
            warn!("Failed to remove PID file: {}", e);
        }
    }

    match result {
        Ok(_) => {
            info!("SAP daemon shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("SAP daemon error: {}", e);
            process::exit(1);
        }
    }
}

/// Initialize logging system
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| SapError::Config(format!("Invalid log level '{}': {}", level, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    Ok(())
}

fn parse_width(mhz: u32) -> Result<ChannelWidth> {
    match mhz {
        20 => Ok(ChannelWidth::Bw20),
        40 => Ok(ChannelWidth::Bw40),
        80 => Ok(ChannelWidth::Bw80),
        160 => Ok(ChannelWidth::Bw160),
        other => Err(SapError::InvalidParameter(format!("Unsupported width {} MHz", other))),
    }
}

/// Load daemon configuration from file
fn load_configuration(config_path: &PathBuf) -> Result<DaemonConfig> {
    if !config_path.exists() {
        warn!("Configuration file not found: {}, using defaults", config_path.display());
        return Ok(DaemonConfig::default());
    }

    info!("Loading configuration from: {}", config_path.display());
    let manager = sap_rust::daemon::ConfigManager::load_from_file(config_path)?;
    let validation = manager.validate_config(manager.get_config())?;
    for warning in &validation.warnings {
        warn!("Configuration warning: {}", warning);
    }
    if !validation.valid {
        return Err(SapError::Config(validation.errors.join(", ")));
    }
    Ok(manager.get_config().clone())
}

/// Wait for a shutdown signal
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }

    Ok(())
}

/// Run the main daemon loop
async fn run_daemon(config: DaemonConfig, auto_start: Option<SapConfig>) -> Result<()> {
    let mut daemon = DaemonBuilder::new()
        .with_config(config)
        .with_auto_start(auto_start)
        .build()
        .await?;

    daemon.start().await?;

    if let DaemonResponse::Interfaces(list) =
        daemon.handle_command(DaemonCommand::ListInterfaces).await?
    {
        for summary in list {
            info!("Interface {} {:?} on {:?}", summary.id, summary.state, summary.channel);
        }
    }

    shutdown_signal().await?;

    info!("Shutdown signal received, stopping daemon...");
    daemon.stop().await?;

    Ok(())
}
