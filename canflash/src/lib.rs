//! # canflash
//!
//! A library for flashing AVR microcontrollers through a CAN bootloader.
//!
//! Devices announce that they wait for firmware by broadcasting a boot
//! request. This crate provides the pieces needed to answer it:
//!
//! - Bootloader command codec (set pointer, read, erase, load, write, reset)
//! - Intel HEX firmware files with controller geometry validation
//! - Page programming with read-back verification
//! - A boot listener that runs one flashing session per request
//!
//! ## Supported Controllers
//!
//! - ATmega88, ATmega168, ATmega328P
//!
//! ## Features
//!
//! - `native` (default): Linux SocketCAN transport via the `socketcan` crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use canflash::{BootListener, ListenerConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let connector = canflash::bus::SocketCanConnector::new("can0");
//!         let mut listener = BootListener::new(connector, ListenerConfig::new("/srv/firmware"));
//!
//!         // Runs until the interrupt checker fires
//!         let stats = listener.run()?;
//!         println!("{} sessions, {} failed", stats.sessions, stats.failed);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod bus;
pub mod device;
pub mod error;
pub mod image;
pub mod listener;
pub mod protocol;
pub mod target;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). The boot
/// listener consults it between frames; a running session is always driven
/// to completion.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(all(feature = "native", target_os = "linux"))]
pub use bus::{SocketCanConnector, SocketCanPort};
pub use {
    bus::{BusConnector, BusFrame, BusPort, RetryPolicy},
    device::DeviceAddress,
    error::{Error, Result},
    image::{ImageError, ValidatedImage, firmware_path},
    listener::{BootListener, ListenerConfig, ListenerStats},
    protocol::{BOOT_MAGIC, Command, DeviceLink, Opcode},
    target::{ControllerProfile, PageBuffer, PageProgrammer},
};
