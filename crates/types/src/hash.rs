//! Blake3 content hashes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 32-byte blake3 digest.
///
/// Identifies gossip events by content, and chains state-root versions
/// together: each version's hash covers its predecessor's.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Predecessor of the first state-root version.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Digest of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).into())
    }

    /// Digest of the concatenation of `parts`, without allocating it.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        parts
            .iter()
            .fold(blake3::Hasher::new(), |mut hasher, part| {
                hasher.update(part);
                hasher
            })
            .finalize()
            .into()
    }

    /// Adopt a digest computed elsewhere.
    pub const fn from_raw(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<blake3::Hash> for Hash {
    fn from(digest: blake3::Hash) -> Self {
        Self(digest.into())
    }
}

impl FromStr for Hash {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut digest = [0u8; 32];
        match hex::decode_to_slice(s, &mut digest) {
            Ok(()) => Ok(Self(digest)),
            Err(hex::FromHexError::InvalidStringLength | hex::FromHexError::OddLength) => {
                Err(HexError::Length(s.len()))
            }
            Err(_) => Err(HexError::Digit),
        }
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First four bytes are plenty to tell events apart in logs.
        write!(f, "Hash({}..)", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A hash string that is not 64 hex digits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HexError {
    #[error("hash must be 64 hex digits, got {0} characters")]
    Length(usize),

    #[error("hash contains a non-hex character")]
    Digit,
}
