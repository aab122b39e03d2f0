//! canflashd - CAN bootloader flashing daemon.
//!
//! Listens on a CAN interface for boot requests and flashes each requesting
//! device with `<firmware-directory>/<ADDRESS>.hex`.
//!
//! ## Features
//!
//! - Read-back verification of every page
//! - Device reset on every session outcome
//! - Configuration file and environment variable support
//! - Clean shutdown on Ctrl-C between sessions

use anyhow::{Context, Result, bail};
use canflash::{BootListener, ListenerConfig, SocketCanConnector};
use clap::Parser;
use env_logger::Env;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

mod config;

use config::Config;

/// canflashd - Flash AVR microcontrollers that request firmware over CAN.
///
/// Environment variables:
///   CANFLASHD_REPLY_TIMEOUT_MS  - Read reply timeout (default: 1000)
///   CANFLASHD_POLL_INTERVAL_MS  - Idle poll interval (default: 500)
#[derive(Parser)]
#[command(name = "canflashd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// CAN interface to listen on (e.g. can0).
    interface: String,

    /// Directory holding one <ADDRESS>.hex file per device.
    firmware_dir: PathBuf,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only warnings and errors).
    #[arg(short, long)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// Time to wait for each read reply, in milliseconds.
    #[arg(long, value_name = "MS", env = "CANFLASHD_REPLY_TIMEOUT_MS")]
    reply_timeout_ms: Option<u64>,

    /// Time to wait for traffic before checking for shutdown, in milliseconds.
    #[arg(long, value_name = "MS", env = "CANFLASHD_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.quiet);

    debug!(
        "canflashd v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    run(&cli, &config)
}

/// Setup logging based on verbosity.
fn init_logging(verbose: u8, quiet: bool) {
    let log_level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(verbose >= 2)
        .format_timestamp(if verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn check_firmware_dir(dir: &Path) -> Result<()> {
    let meta = dir
        .metadata()
        .with_context(|| format!("Cannot open firmware directory {}", dir.display()))?;
    if !meta.is_dir() {
        bail!("Firmware path {} is not a directory", dir.display());
    }
    Ok(())
}

fn run(cli: &Cli, config: &Config) -> Result<()> {
    check_firmware_dir(&cli.firmware_dir)?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || handler_flag.store(false, Ordering::SeqCst))
        .context("Failed to install Ctrl-C handler")?;
    canflash::set_interrupt_checker(move || !running.load(Ordering::SeqCst));

    let connector =
        SocketCanConnector::new(cli.interface.as_str()).with_retry_policy(config.retry_policy());
    let listener_config = ListenerConfig::new(&cli.firmware_dir)
        .with_reply_timeout(config.reply_timeout(cli.reply_timeout_ms))
        .with_poll_interval(config.poll_interval(cli.poll_interval_ms));

    info!("canflashd v{} starting up", env!("CARGO_PKG_VERSION"));
    debug!(
        "Reply timeout {}ms, poll interval {}ms",
        listener_config.reply_timeout.as_millis(),
        listener_config.poll_interval.as_millis()
    );

    let mut listener = BootListener::new(connector, listener_config);
    let stats = listener
        .run()
        .with_context(|| format!("Failed to listen on CAN interface {}", cli.interface))?;

    info!(
        "Shutting down after {} sessions ({} failed)",
        stats.sessions, stats.failed
    );
    Ok(())
}
