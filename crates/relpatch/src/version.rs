//! Four-component host build version.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A `major.minor.patch.build` version, ordered component by component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version([u16; 4]);

impl Version {
    pub const fn new(major: u16, minor: u16, patch: u16, build: u16) -> Self {
        Self([major, minor, patch, build])
    }

    pub const fn from_array(parts: [u16; 4]) -> Self {
        Self(parts)
    }

    pub const fn major(&self) -> u16 {
        self.0[0]
    }

    pub const fn minor(&self) -> u16 {
        self.0[1]
    }

    pub const fn patch(&self) -> u16 {
        self.0[2]
    }

    pub const fn build(&self) -> u16 {
        self.0[3]
    }

    pub fn parts(&self) -> [u16; 4] {
        self.0
    }

    /// Packed form used in the loader's plugin metadata block.
    ///
    /// Components are truncated to 8, 8, 12 and 4 bits respectively.
    pub const fn pack(&self) -> u32 {
        ((self.0[0] as u32 & 0x0FF) << 24)
            | ((self.0[1] as u32 & 0x0FF) << 16)
            | ((self.0[2] as u32 & 0xFFF) << 4)
            | (self.0[3] as u32 & 0x00F)
    }

    pub const fn unpack(packed: u32) -> Self {
        Self([
            ((packed >> 24) & 0x0FF) as u16,
            ((packed >> 16) & 0x0FF) as u16,
            ((packed >> 4) & 0xFFF) as u16,
            (packed & 0x00F) as u16,
        ])
    }

    pub fn to_string_with(&self, delim: char) -> String {
        self.0
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(&delim.to_string())
    }

    /// Parse up to four components separated by `.` or `-`.
    ///
    /// Missing trailing components default to zero, matching how product version
    /// resources are read.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim().trim_end_matches('\0');
        if s.is_empty() {
            return Err(Error::InvalidVersion(s.to_string()));
        }

        let mut parts = [0u16; 4];
        for (i, token) in s.split(['.', '-']).enumerate() {
            if i >= 4 {
                return Err(Error::InvalidVersion(s.to_string()));
            }
            parts[i] = token
                .trim()
                .parse()
                .map_err(|_| Error::InvalidVersion(s.to_string()))?;
        }

        Ok(Self(parts))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_with('-'))
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string_with('.'))
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
