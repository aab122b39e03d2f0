//! Bootloader protocol implementation.

pub mod command;
pub mod link;

// Re-export common types
pub use command::{BOOT_MAGIC, Command, Opcode, parse_boot_request};
pub use link::DeviceLink;
