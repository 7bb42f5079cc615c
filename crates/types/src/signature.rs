//! Opaque event signatures.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signature attached to a gossip event.
///
/// Signature verification happens elsewhere; intake only compares
/// signatures byte-for-byte. Backed by [`Bytes`] so clones are cheap.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(Bytes);

impl Signature {
    /// Wrap signature bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the signature is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&'static [u8]> for Signature {
    fn from(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }
}

impl From<Vec<u8>> for Signature {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<Bytes> for Signature {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = &self.0[..self.0.len().min(4)];
        write!(f, "Signature({}.., {} bytes)", hex::encode(shown), self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_bytewise() {
        let a = Signature::from(&b"sig-a"[..]);
        let b = Signature::from(b"sig-a".to_vec());
        let c = Signature::from(&b"sig-b"[..]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
