//! Effective partition keys
//!
//! An effective partition key (EPK) is a position in the hashed key space,
//! written as uppercase hex of at most 16 bytes. `""` is the minimum and
//! `"FF"` the exclusive maximum. Internally keys are right-padded to 128
//! bits so that ordering is plain integer ordering.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Number of hex digits in a fully padded key
const KEY_HEX_DIGITS: usize = 32;

/// Smallest key (`""`)
pub const MIN_EPK: u128 = 0;

/// Exclusive upper bound of the key space (`"FF"`)
pub const MAX_EPK: u128 = 0xFF << 120;

/// Parse a hex key into its padded integer form
pub fn parse_epk(key: &str) -> Result<u128, String> {
    if key.len() > KEY_HEX_DIGITS {
        return Err(format!("key '{}' longer than {} hex digits", key, KEY_HEX_DIGITS));
    }
    if key.len() % 2 != 0 {
        return Err(format!("key '{}' has an odd number of hex digits", key));
    }
    if !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("key '{}' is not hexadecimal", key));
    }
    if key.is_empty() {
        return Ok(MIN_EPK);
    }

    let padded = format!("{:0<width$}", key, width = KEY_HEX_DIGITS);
    let value = u128::from_str_radix(&padded, 16).map_err(|e| e.to_string())?;
    if value > MAX_EPK {
        return Err(format!("key '{}' is beyond the end of the key space", key));
    }
    Ok(value)
}

/// Format a padded key back into its shortest hex form
pub fn format_epk(key: u128) -> String {
    let mut hex = format!("{:032X}", key);
    while hex.ends_with("00") {
        hex.truncate(hex.len() - 2);
    }
    hex
}

/// Hash a logical partition key value onto the key space
pub fn partition_key_epk(value: &Value) -> u128 {
    let canonical = serde_json::to_string(value).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    u128::from_be_bytes(bytes) % MAX_EPK
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bounds() {
        assert_eq!(parse_epk("").unwrap(), MIN_EPK);
        assert_eq!(parse_epk("FF").unwrap(), MAX_EPK);
        assert_eq!(format_epk(MIN_EPK), "");
        assert_eq!(format_epk(MAX_EPK), "FF");
    }

    #[test]
    fn test_padding_and_trimming() {
        assert_eq!(parse_epk("7F").unwrap(), parse_epk("7F0000").unwrap());
        assert_eq!(format_epk(parse_epk("7f80").unwrap()), "7F80");
        assert_eq!(format_epk(parse_epk("0A0B00").unwrap()), "0A0B");
    }

    #[test]
    fn test_rejects_invalid_keys() {
        assert!(parse_epk("XYZ1").is_err());
        assert!(parse_epk("ABC").is_err());
        assert!(parse_epk("FF01").is_err());
        assert!(parse_epk(&"0".repeat(34)).is_err());
    }

    #[test]
    fn test_ordering_matches_hex_ordering() {
        assert!(parse_epk("05").unwrap() < parse_epk("05C1").unwrap());
        assert!(parse_epk("05C1").unwrap() < parse_epk("06").unwrap());
    }

    #[test]
    fn test_partition_key_hash_is_stable_and_in_space() {
        let a = partition_key_epk(&json!("tenant-1"));
        assert_eq!(a, partition_key_epk(&json!("tenant-1")));
        assert_ne!(a, partition_key_epk(&json!("tenant-2")));
        assert!(a < MAX_EPK);
    }
}
