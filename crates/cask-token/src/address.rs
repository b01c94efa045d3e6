//! Account addresses.
//!
//! An address is 32 raw bytes, rendered and parsed as base58.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TokenError};

/// Length of an address in bytes.
pub const ADDRESS_LEN: usize = 32;

/// A 32-byte account address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// Create an address from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a random address from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; ADDRESS_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Deterministic address for a human-readable label.
    ///
    /// Used by simulations and tests to name accounts ("client", "host-1").
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        Self(*blake3::hash(label.as_bytes()).as_bytes())
    }

    /// Create an address from a base58-encoded string.
    ///
    /// # Errors
    ///
    /// Returns error if the string is not valid base58 or not 32 bytes.
    pub fn from_base58(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| TokenError::invalid_address(format!("invalid base58: {e}")))?;
        Self::from_slice(&bytes)
    }

    /// Create an address from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns error if the slice is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; ADDRESS_LEN] = bytes.try_into().map_err(|_| {
            TokenError::invalid_address(format!(
                "address must be {ADDRESS_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Raw address bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// Base58 rendering.
    #[must_use]
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_base58())
    }
}

impl FromStr for Address {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_base58(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base58(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_addresses_differ() {
        assert_ne!(Address::generate(), Address::generate());
    }

    #[test]
    fn test_label_is_deterministic() {
        assert_eq!(Address::from_label("host"), Address::from_label("host"));
        assert_ne!(Address::from_label("host"), Address::from_label("client"));
    }

    #[test]
    fn test_base58_parse() {
        let address = Address::from_label("client");
        let parsed: Address = address.to_string().parse().expect("parse");
        assert_eq!(parsed, address);
    }

    #[test]
    fn test_invalid_base58() {
        assert!(Address::from_base58("0OIl").is_err());
    }

    #[test]
    fn test_wrong_length() {
        let short = bs58::encode([1u8; 8]).into_string();
        let err = Address::from_base58(&short).expect_err("should fail");
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn test_serializes_as_base58_string() {
        let address = Address::new([7u8; ADDRESS_LEN]);
        let json = serde_json::to_string(&address).expect("serialize");
        assert_eq!(json, format!("\"{}\"", address.to_base58()));
        let parsed: Address = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, address);
    }
}
