//! Request and slot identifiers.
//!
//! Both are 32-byte blake3 digests: a request id over the request's canonical
//! JSON encoding, a slot id over `(request id, slot index)`.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{MarketError, Result};
use crate::requests::Request;

macro_rules! digest_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Wrap raw digest bytes.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Raw digest bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Parse from a hex string.
            ///
            /// # Errors
            ///
            /// Returns error if the string is not 64 hex characters.
            pub fn from_hex(s: &str) -> Result<Self> {
                let bytes = hex::decode(s).map_err(|e| {
                    MarketError::InvalidRequest(format!("invalid id hex: {e}"))
                })?;
                let array: [u8; 32] = bytes.try_into().map_err(|_| {
                    MarketError::InvalidRequest("id must be 32 bytes".to_string())
                })?;
                Ok(Self(array))
            }

            /// Lowercase hex rendering.
            #[must_use]
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..12])
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(de::Error::custom)
            }
        }
    };
}

digest_id!(
    /// Identifier of a storage request, derived from its full content.
    RequestId
);

digest_id!(
    /// Identifier of one slot of a request.
    SlotId
);

impl RequestId {
    /// Derive the id of a request.
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be encoded.
    pub fn derive(request: &Request) -> Result<Self> {
        let encoded = serde_json::to_vec(request)
            .map_err(|e| MarketError::InvalidRequest(format!("cannot encode request: {e}")))?;
        Ok(Self(*blake3::hash(&encoded).as_bytes()))
    }
}

impl SlotId {
    /// Derive the id of slot `index` of `request_id`.
    #[must_use]
    pub fn derive(request_id: &RequestId, index: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(request_id.as_bytes());
        hasher.update(&index.to_be_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}
