use serde::{Deserialize, Serialize};
use strum::{Display, EnumCount, EnumIter, EnumString, FromRepr, IntoStaticStr};

use super::pe::{IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_WRITE};

/// Named regions the engine looks for in the host image.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumCount,
    EnumIter,
    EnumString,
    FromRepr,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
#[repr(usize)]
pub enum SegmentName {
    /// `.text` mapped executable
    TextX = 0,
    IData = 1,
    RData = 2,
    Data = 3,
    PData = 4,
    Tls = 5,
    /// `.text` mapped writable
    TextW = 6,
    Gfids = 7,
}

impl SegmentName {
    /// Section name prefix and characteristic bits a section needs to match.
    pub fn expected(&self) -> (&'static [u8], u32) {
        match self {
            Self::TextX => (b".text", IMAGE_SCN_MEM_EXECUTE),
            Self::IData => (b".idata", 0),
            Self::RData => (b".rdata", 0),
            Self::Data => (b".data", 0),
            Self::PData => (b".pdata", 0),
            Self::Tls => (b".tls", 0),
            Self::TextW => (b".text", IMAGE_SCN_MEM_WRITE),
            Self::Gfids => (b".gfids", 0),
        }
    }

    /// Whether a raw section header name and characteristics satisfy this segment.
    ///
    /// Only the first `min(prefix len, 8)` bytes are compared, so `.textbss` also
    /// satisfies `.text` when the characteristic bits line up.
    pub fn matches(&self, name: &[u8; 8], characteristics: u32) -> bool {
        let (prefix, required) = self.expected();
        let len = prefix.len().min(name.len());
        name[..len] == prefix[..len] && characteristics & required == required
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// One named region of the host image.
///
/// A zero-valued segment means the section was not found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Segment {
    base: usize,
    address: usize,
    size: usize,
}

impl Segment {
    pub fn new(base: usize, address: usize, size: usize) -> Self {
        Self {
            base,
            address,
            size,
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn offset(&self) -> usize {
        self.address.wrapping_sub(self.base)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> usize {
        self.address + self.size
    }

    pub fn is_present(&self) -> bool {
        self.address != 0
    }

    pub fn contains(&self, address: usize) -> bool {
        self.is_present() && (self.address..self.end()).contains(&address)
    }

    pub fn as_ptr<T>(&self) -> *const T {
        self.address as *const T
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    fn name(s: &str) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..s.len()].copy_from_slice(s.as_bytes());
        out
    }

    #[test]
    fn test_segment_name_strings() {
        assert_eq!(SegmentName::TextX.to_string(), "textx");
        assert_eq!(SegmentName::from_str("GFIDS").unwrap(), SegmentName::Gfids);
        assert_eq!(SegmentName::iter().count(), SegmentName::COUNT);
        assert_eq!(SegmentName::from_repr(6), Some(SegmentName::TextW));
    }

    #[test]
    fn test_text_requires_characteristics() {
        let text = name(".text");
        assert!(SegmentName::TextX.matches(&text, IMAGE_SCN_MEM_EXECUTE));
        assert!(!SegmentName::TextX.matches(&text, IMAGE_SCN_MEM_WRITE));
        assert!(SegmentName::TextW.matches(&text, IMAGE_SCN_MEM_WRITE));
    }

    #[test]
    fn test_prefix_comparison() {
        assert!(SegmentName::Data.matches(&name(".data"), 0));
        assert!(!SegmentName::Data.matches(&name(".rdata"), 0));
        assert!(SegmentName::TextX.matches(&name(".textbss"), IMAGE_SCN_MEM_EXECUTE));
    }

    #[test]
    fn test_segment_geometry() {
        let seg = Segment::new(0x1000, 0x1000, 0x1000);
        assert_eq!(seg.offset(), 0);
        assert_eq!(seg.end(), 0x2000);
        assert!(seg.contains(0x1020));
        assert!(!seg.contains(0x2000));
        assert!(!Segment::default().is_present());
        assert!(!Segment::default().contains(0));
    }
}
