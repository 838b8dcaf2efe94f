//! Content digests.

use sha2::{Digest as _, Sha256};
use std::fmt;

/// A 32-byte SHA-256 digest naming a request or an application state.
///
/// Digests are the protocol's content addresses: requests are referred to by
/// digest in every agreement message, and checkpoints carry a digest of the
/// application state.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sbor::prelude::BasicSbor)]
pub struct Digest([u8; 32]);

impl Digest {
    /// The all-zero digest. Names the null request and the empty state.
    pub const NULL: Digest = Digest([0u8; 32]);

    /// Hash arbitrary bytes.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest(hasher.finalize().into())
    }

    /// Construct from raw bytes, zero-padding or truncating to 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut out = [0u8; 32];
        let n = bytes.len().min(32);
        out[..n].copy_from_slice(&bytes[..n]);
        Digest(out)
    }

    /// Raw byte view.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the null digest.
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs; Display prints the full digest.
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        let a = Digest::of(b"hello");
        let b = Digest::of(b"hello");
        let c = Digest::of(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn null_digest() {
        assert!(Digest::NULL.is_null());
        assert!(!Digest::of(b"x").is_null());
        assert_eq!(Digest::default(), Digest::NULL);
    }

    #[test]
    fn display_is_hex() {
        let d = Digest::from_bytes(&[0xab; 32]);
        assert_eq!(d.to_string(), "ab".repeat(32));
    }
}
