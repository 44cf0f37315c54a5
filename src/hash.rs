//! Fixed-seed hashing for the engine's internal maps.
//!
//! Subscription tables, dependency sets and the pending-reaction set are all
//! keyed by engine-internal ids or keys, so HashDoS resistance is not needed
//! and a zero-sized deterministic hasher keeps the collections lean.

use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};

/// Zero-sized `BuildHasher` over foldhash with a fixed seed.
///
/// Every instance hashes identically, which makes it usable as the `S`
/// parameter of collections stored inside shared metadata without carrying
/// per-collection seed state.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHash;

impl BuildHasher for FastHash {
    type Hasher = FoldHasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x6b5f_c3a1_9e24_7d08).build_hasher()
    }
}

pub(crate) type FastIndexMap<K, V> = indexmap::IndexMap<K, V, FastHash>;
pub(crate) type FastIndexSet<T> = indexmap::IndexSet<T, FastHash>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_hash_is_zero_sized_and_deterministic() {
        assert_eq!(std::mem::size_of::<FastHash>(), 0);
        assert_eq!(FastHash.hash_one("watch"), FastHash.hash_one("watch"));
    }
}
