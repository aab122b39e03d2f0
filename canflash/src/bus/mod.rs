//! Bus abstraction for CAN frame transport.
//!
//! The flashing engine never talks to a socket directly. It sees two traits:
//!
//! - [`BusConnector`] opens connections, optionally filtered to one device;
//! - [`BusPort`] sends and receives single frames on an open connection.
//!
//! ```text
//! +--------------------+     +--------------------+
//! |   Boot Listener    |     |  Page Programmer   |
//! +---------+----------+     +---------+----------+
//!           |                          |
//!           v                          v
//! +---------+----------+     +---------+----------+
//! |   BusConnector     | --> |      BusPort       |
//! +---------+----------+     +---------+----------+
//!           |                          |
//!           v                          v
//! +---------+--------------------------+----------+
//! |         SocketCAN (CAN_RAW, Linux only)       |
//! +-----------------------------------------------+
//! ```
//!
//! Every receive takes an explicit timeout, and the native transport retries
//! transient transmit-queue exhaustion with a bounded [`RetryPolicy`].

#[cfg(all(feature = "native", target_os = "linux"))]
pub mod native;

#[cfg(test)]
pub(crate) mod sim;

use crate::device::{DeviceAddress, EXTENDED_ID_MASK};
use crate::error::{Error, Result};
use log::trace;
use std::fmt;
use std::io;
use std::thread;
use std::time::Duration;

/// Maximum payload of a classic CAN frame.
pub const MAX_FRAME_DATA: usize = 8;

/// A single classic CAN frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BusFrame {
    id: u32,
    extended: bool,
    remote: bool,
    data: [u8; MAX_FRAME_DATA],
    len: u8,
}

impl BusFrame {
    /// Create an extended (29-bit) data frame.
    pub fn extended(id: u32, data: &[u8]) -> Result<Self> {
        if id > EXTENDED_ID_MASK {
            return Err(Error::MalformedFrame(format!(
                "identifier 0x{id:08X} does not fit in 29 bits"
            )));
        }
        Self::build(id, true, data)
    }

    /// Create a standard (11-bit) data frame.
    pub fn standard(id: u16, data: &[u8]) -> Result<Self> {
        if id > 0x7FF {
            return Err(Error::MalformedFrame(format!(
                "identifier 0x{id:03X} does not fit in 11 bits"
            )));
        }
        Self::build(u32::from(id), false, data)
    }

    // Safe cast: length checked against MAX_FRAME_DATA
    #[allow(clippy::cast_possible_truncation)]
    fn build(id: u32, extended: bool, data: &[u8]) -> Result<Self> {
        if data.len() > MAX_FRAME_DATA {
            return Err(Error::MalformedFrame(format!(
                "{} payload bytes exceed the {MAX_FRAME_DATA}-byte frame limit",
                data.len()
            )));
        }
        let mut buf = [0u8; MAX_FRAME_DATA];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            extended,
            remote: false,
            data: buf,
            len: data.len() as u8,
        })
    }

    /// Mark this frame as a remote transmission request.
    #[must_use]
    pub fn into_remote(mut self) -> Self {
        self.remote = true;
        self
    }

    /// Frame identifier (without format flags).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the frame uses a 29-bit identifier.
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Whether the frame is a remote transmission request.
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Payload bytes (`len` of them).
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }
}

impl fmt::Debug for BusFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "{:08X}", self.id)?;
        } else {
            write!(f, "{:03X}", self.id)?;
        }
        if self.remote {
            write!(f, " RTR")?;
        }
        write!(f, " [{}]", self.len)?;
        for b in self.data() {
            write!(f, " {b:02X}")?;
        }
        Ok(())
    }
}

/// Bounded exponential backoff for transient transmit failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of send attempts before giving up.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Run a send operation, retrying while the transmit queue is full.
    ///
    /// Any other I/O error is returned immediately. When every attempt hits a
    /// full queue the result is [`Error::TransportSaturated`].
    pub fn run<F>(&self, mut op: F) -> Result<()>
    where
        F: FnMut() -> io::Result<()>,
    {
        let attempts = self.max_attempts.max(1);

        for attempt in 1..=attempts {
            match op() {
                Ok(()) => return Ok(()),
                Err(e) if is_buffer_exhausted(&e) => {
                    if attempt < attempts {
                        let delay = self.delay_for(attempt);
                        trace!(
                            "Transmit queue full (attempt {attempt}/{attempts}), retrying in {}ms",
                            delay.as_millis()
                        );
                        thread::sleep(delay);
                    }
                },
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Err(Error::TransportSaturated { attempts })
    }
}

/// Returns `true` if the error means the kernel transmit queue is full.
pub fn is_buffer_exhausted(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOBUFS)
}

/// A connection to the bus that carries whole frames.
pub trait BusPort {
    /// Send one frame.
    fn send(&mut self, frame: &BusFrame) -> Result<()>;

    /// Wait up to `timeout` for the next frame.
    ///
    /// Returns `Ok(None)` when the timeout elapses without traffic.
    fn receive(&mut self, timeout: Duration) -> Result<Option<BusFrame>>;

    /// Get the interface name.
    fn name(&self) -> &str;

    /// Close the connection and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;
}

/// Opens bus connections.
///
/// This is separated from `BusPort` because the listener needs a fresh,
/// differently-filtered connection for every session.
pub trait BusConnector {
    /// Port type produced by this connector.
    type Port: BusPort;

    /// Open a connection.
    ///
    /// With `filter` set, only frames sent by that device are delivered.
    fn open(&self, filter: Option<DeviceAddress>) -> Result<Self::Port>;
}

#[cfg(all(feature = "native", target_os = "linux"))]
pub use self::native::{SocketCanConnector, SocketCanPort};
