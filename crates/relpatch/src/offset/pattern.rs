use std::fmt;
use std::str::FromStr;

use memchr::memchr_iter;
use tracing::debug;

use crate::error::{Error, Result};
use crate::fatal::report_and_fail;

/// Expected instruction bytes at a patch site, `None` marking a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    bytes: Vec<Option<u8>>,
}

impl Pattern {
    /// Parse `"E8 ?? ?? ?? ??"`; `?` and `??` are wildcards.
    pub fn parse(pattern: &str) -> Result<Self> {
        parse_pattern(pattern).map(|bytes| Self { bytes })
    }

    pub fn from_bytes(bytes: &[Option<u8>]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    /// A pattern with no wildcards.
    pub fn exact(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.iter().copied().map(Some).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[Option<u8>] {
        &self.bytes
    }

    /// Compare against the start of `haystack`.
    pub fn matches_bytes(&self, haystack: &[u8]) -> bool {
        haystack.len() >= self.bytes.len()
            && self
                .bytes
                .iter()
                .zip(haystack)
                .all(|(expected, actual)| expected.is_none_or(|b| b == *actual))
    }

    /// Read `len()` bytes at `address` and compare. A null address never matches.
    ///
    /// # Safety
    ///
    /// `address..address + len()` must be readable.
    pub unsafe fn matches(&self, address: usize) -> bool {
        if address == 0 {
            return false;
        }
        // SAFETY: forwarded to the caller.
        self.matches_bytes(unsafe { self.read_at(address) })
    }

    /// Like [`Pattern::matches`], reporting what was found on mismatch.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Pattern::matches`].
    pub unsafe fn verify(&self, address: usize) -> Result<()> {
        if address == 0 {
            return Err(Error::NullAddress("pattern target"));
        }
        // SAFETY: forwarded to the caller.
        let found = unsafe { self.read_at(address) };
        if self.matches_bytes(found) {
            debug!("Pattern [{}] matched at {:#x}", self, address);
            return Ok(());
        }

        Err(Error::PatternMismatch {
            address,
            expected: self.to_string(),
            found: format_bytes(found),
        })
    }

    /// Check the pattern and end the process on mismatch.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Pattern::matches`].
    #[track_caller]
    pub unsafe fn match_or_fail(&self, address: usize) {
        // SAFETY: forwarded to the caller.
        if let Err(e) = unsafe { self.verify(address) } {
            report_and_fail(e.to_string());
        }
    }

    /// Offset of the first match inside `haystack`.
    pub fn find_in(&self, haystack: &[u8]) -> Option<usize> {
        if self.bytes.len() > haystack.len() {
            return None;
        }

        // Anchor the scan on the first concrete byte.
        let Some((anchor, needle)) = self
            .bytes
            .iter()
            .enumerate()
            .find_map(|(i, b)| b.map(|b| (i, b)))
        else {
            return Some(0);
        };

        let last_start = haystack.len() - self.bytes.len();
        memchr_iter(needle, haystack)
            .filter_map(|pos| pos.checked_sub(anchor))
            .take_while(|&start| start <= last_start)
            .find(|&start| self.matches_bytes(&haystack[start..]))
    }

    unsafe fn read_at(&self, address: usize) -> &[u8] {
        // SAFETY: the caller guarantees the range is readable.
        unsafe { std::slice::from_raw_parts(address as *const u8, self.bytes.len()) }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_pattern(&self.bytes))
    }
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

pub fn parse_pattern(pattern: &str) -> Result<Vec<Option<u8>>> {
    let mut bytes = Vec::new();
    for token in pattern.split_whitespace() {
        if token == "??" || token == "?" {
            bytes.push(None);
            continue;
        }

        let value = u8::from_str_radix(token, 16)
            .map_err(|e| Error::InvalidPattern(format!("invalid token '{}': {}", token, e)))?;
        bytes.push(Some(value));
    }

    if bytes.is_empty() {
        return Err(Error::InvalidPattern("pattern is empty".to_string()));
    }

    Ok(bytes)
}

pub fn format_pattern(bytes: &[Option<u8>]) -> String {
    bytes
        .iter()
        .map(|b| match b {
            Some(value) => format!("{:02X}", value),
            None => "??".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pattern_with_wildcards() {
        let bytes = parse_pattern("48 8D 0D ?? ? ?? ??").unwrap();
        assert_eq!(bytes.len(), 7);
        assert_eq!(bytes[0], Some(0x48));
        assert_eq!(bytes[2], Some(0x0D));
        assert_eq!(bytes[3], None);
        assert_eq!(bytes[4], None);
    }

    #[test]
    fn test_parse_rejects_bad_tokens() {
        assert!(matches!(parse_pattern("E8 ZZ"), Err(Error::InvalidPattern(_))));
        assert!(matches!(parse_pattern("   "), Err(Error::InvalidPattern(_))));
        assert!(parse_pattern("100").is_err());
    }

    #[test]
    fn test_format_pattern() {
        let pattern = Pattern::parse("c6 43 08 ?").unwrap();
        assert_eq!(pattern.to_string(), "C6 43 08 ??");
    }

    #[test]
    fn test_call_pattern_scenario() {
        let pattern = Pattern::parse("E8 ?? ?? ?? ??").unwrap();
        assert!(pattern.matches_bytes(&[0xE8, 0x01, 0x02, 0x03, 0x04]));
        assert!(!pattern.matches_bytes(&[0xE9, 0x01, 0x02, 0x03, 0x04]));
        assert!(!pattern.matches_bytes(&[0xE8, 0x01]));
    }

    #[test]
    fn test_every_concrete_byte_matters() {
        let data = [0xC6, 0x43, 0x08, 0x01];
        let pattern = Pattern::exact(&data);
        assert!(pattern.matches_bytes(&data));
        for i in 0..data.len() {
            let mut changed = data;
            changed[i] ^= 0xFF;
            assert!(!pattern.matches_bytes(&changed), "byte {} ignored", i);
        }
    }

    #[test]
    fn test_all_wildcards_always_match() {
        let pattern = Pattern::parse("?? ?? ??").unwrap();
        assert!(pattern.matches_bytes(&[0x00, 0xFF, 0x7F]));
        assert!(pattern.matches_bytes(&[0xAB, 0xCD, 0xEF, 0x01]));
        assert_eq!(pattern.find_in(&[1, 2, 3]), Some(0));
    }

    #[test]
    fn test_matches_live_memory() {
        let code = vec![0x90u8, 0xE8, 0x11, 0x22, 0x33, 0x44];
        let pattern = Pattern::parse("E8").unwrap();
        let base = code.as_ptr() as usize;
        unsafe {
            assert!(pattern.matches(base + 1));
            assert!(!pattern.matches(base));
            assert!(!pattern.matches(0));
        }
    }

    #[test]
    fn test_verify_reports_found_bytes() {
        let code = [0xC6u8, 0x43, 0x08, 0x00];
        let pattern = Pattern::parse("C6 43 08 01").unwrap();
        let err = unsafe { pattern.verify(code.as_ptr() as usize) }.unwrap_err();
        match err {
            Error::PatternMismatch {
                expected, found, ..
            } => {
                assert_eq!(expected, "C6 43 08 01");
                assert_eq!(found, "C6 43 08 00");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_find_in() {
        let haystack = [0x00, 0xE8, 0x00, 0x48, 0x8B, 0x05, 0x10, 0x20, 0x30, 0x40, 0xC3];
        let pattern = Pattern::parse("?? 8B 05 ?? ?? ?? ?? C3").unwrap();
        assert_eq!(pattern.find_in(&haystack), Some(3));

        let missing = Pattern::parse("FF 15").unwrap();
        assert_eq!(missing.find_in(&haystack), None);

        let too_long = Pattern::parse("00 E8 00 48 8B 05 10 20 30 40 C3 00").unwrap();
        assert_eq!(too_long.find_in(&haystack), None);
    }
}
