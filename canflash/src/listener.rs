//! Boot request listener.
//!
//! The listener waits on an unfiltered bus connection for boot requests.
//! Each request runs one flashing session to completion before the next
//! frame is read:
//!
//! ```text
//!            boot request
//! LISTENING ──────────────> SESSION_ACTIVE
//!     ^                          │
//!     └──── reset + close ───────┘
//! ```
//!
//! A session opens a connection filtered to the requesting device, loads
//! `<firmware_dir>/<ADDRESS>.hex`, programs it and resets the device. The
//! reset and close happen whether the session succeeded or not, so a bad
//! image never leaves a device waiting in its bootloader.

use crate::bus::{BusConnector, BusFrame, BusPort};
use crate::device::DeviceAddress;
use crate::error::Result;
use crate::image::ihex::{ValidatedImage, firmware_path};
use crate::protocol::command::parse_boot_request;
use crate::protocol::link::{DEFAULT_REPLY_TIMEOUT, DeviceLink};
use crate::target::programmer::PageProgrammer;
use log::{debug, error, info, trace, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default time to wait for traffic before checking for interruption.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Directory holding one firmware file per device.
    pub firmware_dir: PathBuf,
    /// Time to wait for each read reply during a session.
    pub reply_timeout: Duration,
    /// Time to wait for a frame before checking for interruption.
    pub poll_interval: Duration,
}

impl ListenerConfig {
    /// Configuration with default timeouts.
    pub fn new(firmware_dir: impl Into<PathBuf>) -> Self {
        Self {
            firmware_dir: firmware_dir.into(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the read reply timeout.
    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the idle poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Counters kept while listening.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Boot requests that started a session.
    pub sessions: u64,
    /// Sessions that programmed and verified the whole image.
    pub succeeded: u64,
    /// Sessions that aborted.
    pub failed: u64,
    /// Frames that were not boot requests.
    pub ignored_frames: u64,
}

/// Waits for boot requests and flashes the requesting devices.
pub struct BootListener<C: BusConnector> {
    connector: C,
    config: ListenerConfig,
    stats: ListenerStats,
}

impl<C: BusConnector> BootListener<C> {
    /// Create a listener.
    pub fn new(connector: C, config: ListenerConfig) -> Self {
        Self {
            connector,
            config,
            stats: ListenerStats::default(),
        }
    }

    /// Listener configuration.
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Counters so far.
    pub fn stats(&self) -> ListenerStats {
        self.stats
    }

    /// Listen until the embedding application requests interruption.
    ///
    /// See [`crate::set_interrupt_checker`].
    pub fn run(&mut self) -> Result<ListenerStats> {
        self.run_until(crate::is_interrupted_requested)
    }

    /// Listen until `stop` returns `true`.
    ///
    /// `stop` is checked before every wait. Session failures are logged and
    /// counted; only a failure of the listening connection itself ends the
    /// loop with an error.
    pub fn run_until<F>(&mut self, mut stop: F) -> Result<ListenerStats>
    where
        F: FnMut() -> bool,
    {
        let mut port = self.connector.open(None)?;
        info!("Listening for boot requests on {}", port.name());

        while !stop() {
            match port.receive(self.config.poll_interval)? {
                Some(frame) => {
                    let _ = self.handle_frame(&frame);
                },
                None => trace!("No traffic on {}", port.name()),
            }
        }

        info!(
            "Stopped listening: {} sessions, {} succeeded, {} failed",
            self.stats.sessions, self.stats.succeeded, self.stats.failed
        );
        port.close()?;
        Ok(self.stats)
    }

    /// Handle one frame from the listening connection.
    ///
    /// Returns `None` if the frame is not a boot request, otherwise the
    /// outcome of the session it started.
    pub fn handle_frame(&mut self, frame: &BusFrame) -> Option<Result<()>> {
        let Some(addr) = parse_boot_request(frame) else {
            self.stats.ignored_frames += 1;
            trace!("Ignoring {frame:?}");
            return None;
        };

        info!("Received boot request from {addr}");
        self.stats.sessions += 1;

        let result = self.run_session(addr);
        match &result {
            Ok(()) => {
                self.stats.succeeded += 1;
                info!("Flashing {addr} succeeded");
            },
            Err(e) => {
                self.stats.failed += 1;
                error!("Flashing {addr} failed: {e}");
            },
        }
        Some(result)
    }

    /// Flash one device over a connection filtered to it.
    ///
    /// The device is reset and the connection closed on every path once the
    /// connection is open.
    pub fn run_session(&self, addr: DeviceAddress) -> Result<()> {
        let mut port = self.connector.open(Some(addr))?;

        let result = {
            let mut link =
                DeviceLink::new(&mut port, addr).with_reply_timeout(self.config.reply_timeout);
            let result = flash_device(&mut link, &self.config.firmware_dir);

            debug!("Resetting {addr}");
            let reset = link.reset();
            if let (Err(_), Err(e)) = (&result, &reset) {
                warn!("Resetting {addr} after failure also failed: {e}");
            }
            result.and(reset)
        };

        let closed = port.close();
        result.and(closed)
    }
}

fn flash_device<P: BusPort>(link: &mut DeviceLink<'_, P>, firmware_dir: &Path) -> Result<()> {
    let addr = link.address();
    let path = firmware_path(firmware_dir, addr);
    info!("Using firmware file {}", path.display());

    let image = ValidatedImage::from_file(&path)?;
    info!(
        "{addr}: {} image, {} data bytes",
        image.profile().name,
        image.data_len()
    );

    PageProgrammer::new(link).program_image(&image, |done, total| {
        debug!("{addr}: page {done}/{total} verified");
    })
}
