//! Hex address arguments.

use anyhow::{Context, Result};

/// Parse an address or RVA written in hex, with or without a `0x` prefix.
pub fn parse_hex_address(s: &str) -> Result<usize> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    usize::from_str_radix(digits, 16).with_context(|| format!("invalid hex address {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_address_prefixes() {
        assert_eq!(parse_hex_address("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_hex_address("0X1000").unwrap(), 0x1000);
        assert_eq!(parse_hex_address("DEADBEEF").unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_parse_hex_address_image_base() {
        assert_eq!(parse_hex_address("0x140000000").unwrap(), 0x1_4000_0000);
    }

    #[test]
    fn test_parse_hex_address_invalid() {
        assert!(parse_hex_address("GHIJK").is_err());
        assert!(parse_hex_address("0xZZZ").is_err());
        assert!(parse_hex_address("0x").is_err());
        assert!(parse_hex_address("0x0x10").is_err());
    }
}
