//! Memory tiers addressable by the explicit indicator.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Physical memory class an allocation is drawn from.
///
/// The discriminants are part of the C ABI: `GetMemoryMode` reports
/// `0` for HOST and `1` for CXL.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MemoryTier {
    /// Conventional host-attached DRAM.
    #[default]
    Host = 0,
    /// Pooled memory reached over a CXL interconnect.
    Cxl = 1,
}

impl MemoryTier {
    /// Number of tiers.
    pub const COUNT: usize = 2;

    /// Every tier, in discriminant order.
    pub const ALL: [MemoryTier; Self::COUNT] = [MemoryTier::Host, MemoryTier::Cxl];

    /// Raw register encoding.
    #[must_use]
    pub const fn as_raw(self) -> u8 {
        self as u8
    }

    /// Decode a raw register value.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Host),
            1 => Some(Self::Cxl),
            _ => None,
        }
    }

    /// Index into per-tier arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Lowercase name used in logs and config.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Cxl => "cxl",
        }
    }

    /// Parse from string (case-insensitive). Accepts names and raw digits.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" | "dram" | "local" | "0" => Some(Self::Host),
            "cxl" | "remote" | "far" | "1" => Some(Self::Cxl),
            _ => None,
        }
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
