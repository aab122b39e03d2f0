//! Controller memory geometry.
//!
//! A firmware file names the controller it was built for; the profile tells
//! the programmer how large a flash page is and where the bootloader starts.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

/// Flash geometry of one controller type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerProfile {
    /// Registry name (lowercase).
    pub name: &'static str,
    /// Byte offset of the bootloader region.
    pub bootloader_start: u32,
    /// Flash page size in bytes.
    pub page_size: u32,
}

impl ControllerProfile {
    /// Round `address` down to the start of its page.
    #[must_use]
    pub fn page_floor(&self, address: u32) -> u32 {
        address - address % self.page_size
    }

    /// First byte an image may not touch.
    ///
    /// This is the start of the page holding the bootloader, so a partially
    /// shared page is never erased.
    #[must_use]
    pub fn boundary(&self) -> u32 {
        self.page_floor(self.bootloader_start)
    }

    /// Look up a profile by name.
    ///
    /// Matching ignores case. An exact name wins; otherwise the name may be an
    /// unambiguous prefix of one registered name.
    pub fn lookup(name: &str) -> Option<&'static Self> {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return None;
        }

        let registry = registry();
        if let Some(profile) = registry.get(name.as_str()) {
            return Some(profile);
        }

        let mut matches = registry
            .iter()
            .filter(|(key, _)| key.starts_with(&name))
            .map(|(_, profile)| profile);
        match (matches.next(), matches.next()) {
            (Some(profile), None) => Some(profile),
            _ => None,
        }
    }

    /// Every registered profile, ordered by name.
    pub fn all() -> impl Iterator<Item = &'static Self> {
        registry().values()
    }
}

impl fmt::Display for ControllerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (page {} bytes, bootloader at 0x{:04X})",
            self.name, self.page_size, self.bootloader_start
        )
    }
}

const PROFILES: &[ControllerProfile] = &[
    ControllerProfile {
        name: "atmega88",
        bootloader_start: 0x1E00,
        page_size: 64,
    },
    ControllerProfile {
        name: "atmega168",
        bootloader_start: 0x3E00,
        page_size: 128,
    },
    ControllerProfile {
        name: "atmega328p",
        bootloader_start: 0x7E00,
        page_size: 128,
    },
];

fn registry() -> &'static BTreeMap<&'static str, ControllerProfile> {
    static REGISTRY: OnceLock<BTreeMap<&'static str, ControllerProfile>> = OnceLock::new();
    REGISTRY.get_or_init(|| PROFILES.iter().map(|p| (p.name, *p)).collect())
}
