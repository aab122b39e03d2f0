//! Firmware image formats.

pub mod ihex;

pub use ihex::{DataRecord, ImageError, Record, ValidatedImage, firmware_path};
