//! Keyed 64-bit hashing, treated as an opaque external collaborator.
//!
//! The index only ever needs "a keyed 64-bit hash of these bytes"; which
//! algorithm provides it is not this crate's concern. [`SipHashKey`] uses
//! libstd's own `DefaultHasher` (SipHash-1-3); [`AHashKey`] is available for
//! callers who don't need DoS resistance and want the faster alternative.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

/// A keyed 64-bit hash function over byte strings.
pub trait HashKey {
    fn hash(&self, bytes: &[u8]) -> u64;
}

/// The default: libstd's SipHash-1-3 via `DefaultHasher`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SipHashKey;

impl HashKey for SipHashKey {
    #[inline]
    fn hash(&self, bytes: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        hasher.write(bytes);
        hasher.finish()
    }
}

/// A faster, non-adversarial-resistant alternative backed by `ahash`.
#[derive(Clone, Debug, Default)]
pub struct AHashKey(ahash::RandomState);

impl HashKey for AHashKey {
    #[inline]
    fn hash(&self, bytes: &[u8]) -> u64 {
        use std::hash::BuildHasher;
        let mut hasher = self.0.build_hasher();
        hasher.write(bytes);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn siphash_is_deterministic() {
        let h = SipHashKey;
        assert_eq!(h.hash(b"hello"), h.hash(b"hello"));
        assert_ne!(h.hash(b"hello"), h.hash(b"world"));
    }

    #[test]
    fn ahash_is_deterministic_within_instance() {
        let h = AHashKey::default();
        assert_eq!(h.hash(b"hello"), h.hash(b"hello"));
    }
}
