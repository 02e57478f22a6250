//! Deterministic key hashing.
//!
//! Hashes are persisted implicitly (as bucket positions and tags in `index.dat`), so the
//! function must be stable across processes. `DefaultHasher` is not.

#[cfg(not(any(feature = "hash-xxh3", feature = "hash-xxh64")))]
compile_error!("Enable a hash feature: `hash-xxh3` (default) or `hash-xxh64`.");

/// Hash encoded key bytes to 64 bits.
#[inline]
pub fn hash64(bytes: &[u8]) -> u64 {
    #[cfg(feature = "hash-xxh3")]
    {
        xxhash_rust::xxh3::xxh3_64(bytes)
    }

    #[cfg(all(not(feature = "hash-xxh3"), feature = "hash-xxh64"))]
    {
        xxhash_rust::xxh64::xxh64(bytes, 0)
    }
}
