//! Zero-sized hash builder for the crate's internal hash collections.
//!
//! Internal maps and sets are keyed by arena indices, so HashDoS
//! resistance buys nothing here; a fixed-seed foldhash keeps every
//! collection allocation-free on the hasher side and deterministic
//! across instances.

use std::hash::BuildHasher;

pub use foldhash::fast::{FixedState, FoldHasher};

/// A zero-sized `BuildHasher` backed by foldhash with a fixed seed.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x9e3779b97f4a7c15).build_hasher()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_is_zero_sized() {
        assert_eq!(std::mem::size_of::<FastHashBuilder>(), 0);
    }

    #[test]
    fn hashing_is_deterministic() {
        let a = FastHashBuilder;
        let b = FastHashBuilder;
        assert_eq!(a.hash_one(7u64), b.hash_one(7u64));
    }
}
