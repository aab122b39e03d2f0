//! canflash-dump - Read a device's flash over CAN into a file.
//!
//! The device must be waiting in its bootloader. Bytes are read with the
//! bootloader's `read` command, 8 at a time, starting at `--start`.

use anyhow::{Context, Result, bail};
use canflash::{BusPort, DeviceAddress, DeviceLink, RetryPolicy, SocketCanPort};
use clap::Parser;
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::debug;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Highest flash offset reachable through the 16-bit pointer.
const POINTER_RANGE: usize = 0x1_0000;

/// canflash-dump - Dump the flash of a device in bootloader mode.
#[derive(Parser)]
#[command(name = "canflash-dump")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// CAN interface (e.g. can0).
    interface: String,

    /// Device address in hex (e.g. 0x00001234).
    #[arg(value_parser = parse_address)]
    address: DeviceAddress,

    /// Number of bytes to read.
    length: usize,

    /// Output file for the raw bytes.
    output: PathBuf,

    /// First flash offset to read, in hex.
    #[arg(long, default_value = "0", value_parser = parse_hex_u16)]
    start: u16,

    /// Time to wait for each read reply, in milliseconds.
    #[arg(long, value_name = "MS", default_value = "1000", env = "CANFLASHD_REPLY_TIMEOUT_MS")]
    reply_timeout_ms: u64,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (no progress bar).
    #[arg(short, long)]
    quiet: bool,
}

fn parse_address(s: &str) -> Result<DeviceAddress, String> {
    DeviceAddress::from_hex(s).map_err(|e| e.to_string())
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(s, 16).map_err(|e| format!("Invalid hex offset: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    check_range(cli.start, cli.length)?;
    dump(&cli)
}

fn check_range(start: u16, length: usize) -> Result<()> {
    if length == 0 {
        bail!("Length must be at least one byte");
    }
    let end = usize::from(start).checked_add(length);
    if end.is_none_or(|end| end > POINTER_RANGE) {
        bail!(
            "Range 0x{start:04X}+{length} exceeds the 16-bit flash pointer range"
        );
    }
    Ok(())
}

fn dump(cli: &Cli) -> Result<()> {
    let mut port = SocketCanPort::open(&cli.interface, Some(cli.address), RetryPolicy::default())
        .with_context(|| format!("Failed to attach to CAN interface {}", cli.interface))?;

    let pb = if cli.quiet || !console::Term::stderr().is_term() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(cli.length as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb
    };
    pb.set_message(cli.address.to_string());

    debug!(
        "Reading {} bytes from {} starting at 0x{:04X}",
        cli.length, cli.address, cli.start
    );

    let data = {
        let mut link = DeviceLink::new(&mut port, cli.address)
            .with_reply_timeout(Duration::from_millis(cli.reply_timeout_ms));
        link.read_range(cli.start, cli.length, |done, _| pb.set_position(done as u64))
    };
    pb.finish_and_clear();
    port.close()?;
    let data = data.with_context(|| format!("Reading flash of {} failed", cli.address))?;

    fs::write(&cli.output, &data)
        .with_context(|| format!("Writing {} failed", cli.output.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Read {} bytes from {} into {}",
            style("✓").green(),
            data.len(),
            cli.address,
            cli.output.display()
        );
    }
    Ok(())
}
