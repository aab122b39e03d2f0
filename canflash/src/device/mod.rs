//! Device addressing on the CAN bus.
//!
//! Every bootloader-capable node owns a 28-bit address. The address occupies
//! the low bits of a 29-bit extended identifier; bit 28 separates the host's
//! command traffic from the traffic a device sends itself (boot requests and
//! read replies):
//!
//! ```text
//!  28   27                                0
//! +---+-----------------------------------+
//! | C |          device address           |
//! +---+-----------------------------------+
//!   C = 1: host -> device command
//!   C = 0: device -> host (boot request, read reply)
//! ```

use crate::error::{Error, Result};
use std::fmt;

/// Mask of all valid 29-bit extended identifier bits.
pub const EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;

/// Identifier bit set on every host-to-device command frame.
pub const COMMAND_FLAG: u32 = 1 << 28;

/// Mask of the address bits inside an extended identifier.
pub const ADDRESS_MASK: u32 = COMMAND_FLAG - 1;

/// Bus address of a bootloader node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(u32);

impl DeviceAddress {
    /// Largest valid device address.
    pub const MAX: u32 = ADDRESS_MASK;

    /// Create an address, rejecting values that do not fit in 28 bits.
    pub fn new(raw: u32) -> Result<Self> {
        if raw > Self::MAX {
            return Err(Error::Config(format!(
                "device address 0x{raw:08X} exceeds 0x{:08X}",
                Self::MAX
            )));
        }
        Ok(Self(raw))
    }

    /// Extract the address from an extended identifier, ignoring the command bit.
    pub fn from_identifier(id: u32) -> Self {
        Self(id & ADDRESS_MASK)
    }

    /// Parse a hexadecimal address (supports 0x prefix and underscores).
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s.trim_start_matches("0x").trim_start_matches("0X");
        let s: String = s.chars().filter(|c| *c != '_').collect();
        let raw = u32::from_str_radix(&s, 16)
            .map_err(|e| Error::Config(format!("invalid device address '{s}': {e}")))?;
        Self::new(raw)
    }

    /// Raw address value.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Identifier used for frames sent by the host to this device.
    pub fn command_id(self) -> u32 {
        self.0 | COMMAND_FLAG
    }

    /// Identifier used by this device for its own frames.
    pub fn device_id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// Returns `true` if an extended identifier carries host command traffic.
pub fn is_command_id(id: u32) -> bool {
    id & COMMAND_FLAG != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_range() {
        assert!(DeviceAddress::new(0).is_ok());
        assert!(DeviceAddress::new(ADDRESS_MASK).is_ok());
        assert!(DeviceAddress::new(COMMAND_FLAG).is_err());
    }

    #[test]
    fn test_identifier_spaces_are_disjoint() {
        let addr = DeviceAddress::new(0x0123_4567).unwrap();
        assert!(is_command_id(addr.command_id()));
        assert!(!is_command_id(addr.device_id()));
        assert_ne!(addr.command_id(), addr.device_id());
        assert_eq!(DeviceAddress::from_identifier(addr.command_id()), addr);
        assert!(addr.command_id() <= EXTENDED_ID_MASK);
    }

    #[test]
    fn test_from_hex() {
        assert_eq!(DeviceAddress::from_hex("0x1F").unwrap().raw(), 0x1F);
        assert_eq!(DeviceAddress::from_hex("00_00_01_00").unwrap().raw(), 0x100);
        assert!(DeviceAddress::from_hex("zz").is_err());
        assert!(DeviceAddress::from_hex("1FFFFFFF").is_err());
    }

    #[test]
    fn test_display_is_fixed_width_uppercase() {
        let addr = DeviceAddress::new(0xab).unwrap();
        assert_eq!(addr.to_string(), "000000AB");
    }
}
