//! Error types for canflash.

use crate::device::DeviceAddress;
use crate::image::ihex::ImageError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for canflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for canflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (CAN socket, firmware file).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No reply arrived from the device within the reply timeout.
    #[error("Device {address} unresponsive: no reply within {}ms", timeout.as_millis())]
    DeviceUnresponsive {
        /// Device that was expected to answer.
        address: DeviceAddress,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The transmit queue stayed full after every retry.
    #[error("Transport saturated: frame not accepted after {attempts} attempts")]
    TransportSaturated {
        /// Number of send attempts made.
        attempts: u32,
    },

    /// A frame was received with an unexpected shape or length.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A load or read chunk violates the protocol limits.
    ///
    /// This is a caller bug and is raised before anything is sent.
    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    /// The firmware description file is malformed or unsafe to program.
    #[error("Invalid image: {0}")]
    Image(#[from] ImageError),

    /// Read-back verification found a byte that differs from the image.
    #[error(
        "Verify mismatch at 0x{address:04X}: expected 0x{expected:02X}, read 0x{actual:02X}"
    )]
    VerifyMismatch {
        /// Flash byte address of the first differing byte.
        address: u32,
        /// Byte from the image.
        expected: u8,
        /// Byte read back from the device.
        actual: u8,
    },

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns `true` for errors caused by the image rather than the bus.
    pub fn is_image_error(&self) -> bool {
        matches!(self, Self::Image(_))
    }
}
