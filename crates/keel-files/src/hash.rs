//! Content hashing.
//!
//! Every [`FileHandle`](crate::FileHandle) carries the SHA-256 digest of its
//! content. Two handles with equal hashes are interchangeable for reads, which
//! is what lets snapshot caches be keyed by content rather than by time.

use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 digest of a file's content (or of any other hashed payload).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash a byte slice.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// The hash assigned to files that could not be read.
    ///
    /// It is distinct from the hash of every real content, so an unreadable
    /// file never compares equal to an empty one.
    #[must_use]
    pub fn missing() -> Self {
        Self::of(b"\0keel:missing-file\0")
    }

    /// Wrap a raw digest.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Combine another hash into this one with XOR.
    ///
    /// XOR is order independent, so folding a set of hashes yields the same
    /// value regardless of iteration order.
    pub fn xor_with(&mut self, other: &ContentHash) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a ^= b;
        }
    }

    /// First eight hex digits, for log output.
    #[must_use]
    pub fn short(&self) -> String {
        self.to_string()[..8].to_string()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_content_hashes_equal() {
        assert_eq!(ContentHash::of(b"abc"), ContentHash::of(b"abc"));
        assert_ne!(ContentHash::of(b"abc"), ContentHash::of(b"abd"));
    }

    #[test]
    fn missing_differs_from_empty() {
        assert_ne!(ContentHash::missing(), ContentHash::of(b""));
    }

    #[test]
    fn xor_is_order_independent() {
        let a = ContentHash::of(b"a");
        let b = ContentHash::of(b"b");

        let mut ab = ContentHash::default();
        ab.xor_with(&a);
        ab.xor_with(&b);

        let mut ba = ContentHash::default();
        ba.xor_with(&b);
        ba.xor_with(&a);

        assert_eq!(ab, ba);

        // XOR-ing the same hash twice cancels out
        ab.xor_with(&a);
        assert_eq!(ab, b);
    }

    #[test]
    fn display_is_lowercase_hex() {
        let hash = ContentHash::of(b"");
        let text = hash.to_string();
        assert_eq!(text.len(), 64);
        assert!(text.starts_with("e3b0c442"));
        assert_eq!(hash.short(), "e3b0c442");
    }
}
