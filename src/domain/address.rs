//! Bluetooth MAC address validation.

use crate::domain::error::{LinkError, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

const BLUETOOTH_PATTERN: &str = "^([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})$";

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(BLUETOOTH_PATTERN).expect("static regex"))
}

/// Returns true if `address` looks like `XX:XX:XX:XX:XX:XX` (colon or dash separated).
pub fn is_valid_address(address: &str) -> bool {
    pattern().is_match(address)
}

/// A validated Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BluetoothAddress([u8; 6]);

impl BluetoothAddress {
    pub fn parse(address: &str) -> Result<Self> {
        if !is_valid_address(address) {
            return Err(LinkError::InvalidAddress(address.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in address.split([':', '-']).enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| LinkError::InvalidAddress(address.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Bytes in display order (most significant first).
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// BlueZ `bdaddr_t` layout, least significant byte first.
    pub fn to_bdaddr(&self) -> [u8; 6] {
        let mut b = self.0;
        b.reverse();
        b
    }
}

impl fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl std::str::FromStr for BluetoothAddress {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_addresses() {
        assert!(is_valid_address("A4:93:40:A0:87:57"));
        assert!(is_valid_address("a4-93-40-a0-87-57"));
        assert!(is_valid_address("00:11:22:33:44:55"));
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(!is_valid_address(""));
        assert!(!is_valid_address("not-an-address"));
        assert!(!is_valid_address("A4:93:40:A0:87"));
        assert!(!is_valid_address("A4:93:40:A0:87:XX"));
        assert!(!is_valid_address("A4:93:40:A0:87:57:00"));
        assert!(!is_valid_address("A493:40:A0:87:57:00"));
        assert!(!is_valid_address(" A4:93:40:A0:87:57"));
    }

    #[test]
    fn test_parse_bdaddr() {
        let addr = BluetoothAddress::parse("A4:93:40:A0:87:57").unwrap();
        assert_eq!(addr.to_bdaddr(), [0x57, 0x87, 0xA0, 0x40, 0x93, 0xA4]);
        assert_eq!(addr.to_string(), "A4:93:40:A0:87:57");
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert_eq!(
            BluetoothAddress::parse("A4:93:40:A0:87"),
            Err(LinkError::InvalidAddress("A4:93:40:A0:87".to_string()))
        );
    }
}
