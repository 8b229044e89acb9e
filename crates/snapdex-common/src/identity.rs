//! Content-derived image identity
//!
//! An image is named only by the SHA-256 digest of its final, canonical bytes.
//! Filenames, URLs, and capture timestamps never take part in identity.

use crate::error::{Result, SnapdexError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of an identity digest in bytes
pub const IDENTITY_LEN: usize = 32;

/// SHA-256 digest of an image's canonical bytes.
///
/// Serialized as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageIdentity([u8; IDENTITY_LEN]);

impl ImageIdentity {
    /// Compute the identity of an in-memory image
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    /// Full lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 16 hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for ImageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ImageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageIdentity({})", self.short())
    }
}

impl FromStr for ImageIdentity {
    type Err = SnapdexError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| SnapdexError::InvalidIdentity {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        if s.len() != IDENTITY_LEN * 2 {
            return Err(invalid("expected 64 hex characters"));
        }
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(invalid("identity must be lowercase hex"));
        }

        let mut digest = [0u8; IDENTITY_LEN];
        hex::decode_to_slice(s, &mut digest).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self(digest))
    }
}

impl Serialize for ImageIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ImageIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
