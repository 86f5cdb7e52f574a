//! Hash primitives for placement
//!
//! Every layout the engine computes flows through these functions, and the
//! layouts are durable: an object placed today must resolve to the same
//! targets tomorrow under the same pool map. The mixing constants below are
//! therefore a compatibility contract. Do not change them, and do not swap
//! these functions for a third-party hash.

/// Golden-ratio prime for 64-bit multiplicative hashing
pub const GOLDEN_RATIO_PRIME_64: u64 = 0xcbf2_9ce4_8422_2325;

/// Golden-ratio prime for 32-bit multiplicative hashing
pub const GOLDEN_RATIO_PRIME_32: u32 = 0x9e37_0001;

/// MurmurHash2-64A multiplier
const MUR_PRIME: u64 = 0xc6a4_a793_5bd1_e995;

/// MurmurHash2-64A rotation
const MUR_ROTATE: u32 = 47;

/// Default seed for [`murmur64`], used for dkey-based parity rotation
pub const MUR_DEFAULT_SEED: u32 = 5731;

/// Hash a 64-bit value down to `bits` bits (1..=64)
///
/// Multiplicative hash keeping the top `bits` bits of the product.
#[inline]
#[must_use]
pub const fn u64_hash(val: u64, bits: u32) -> u64 {
    val.wrapping_mul(GOLDEN_RATIO_PRIME_64) >> (64 - bits)
}

/// Hash the low 32 bits of a key down to `bits` bits (1..=32)
///
/// The 32-bit variant used for rim selection. The key is narrowed to 32
/// bits before the multiply so the result is always `bits` wide.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn u32_hash(key: u64, bits: u32) -> u32 {
    (key as u32).wrapping_mul(GOLDEN_RATIO_PRIME_32) >> (32 - bits)
}

/// MurmurHash2, 64-bit version, over a byte string
///
/// Word loads are native-endian, matching the layouts produced on the
/// platforms the engine runs on.
#[must_use]
pub fn murmur64(key: &[u8], seed: u32) -> u64 {
    let mut mur = u64::from(seed) ^ (key.len() as u64).wrapping_mul(MUR_PRIME);

    let (body, tail) = key.as_chunks::<8>();
    for chunk in body {
        let mut k = u64::from_ne_bytes(*chunk);
        k = k.wrapping_mul(MUR_PRIME);
        k ^= k >> MUR_ROTATE;
        k = k.wrapping_mul(MUR_PRIME);

        mur ^= k;
        mur = mur.wrapping_mul(MUR_PRIME);
    }

    if !tail.is_empty() {
        for (i, &byte) in tail.iter().enumerate() {
            mur ^= u64::from(byte) << (8 * i);
        }
        mur = mur.wrapping_mul(MUR_PRIME);
    }

    mur ^= mur >> MUR_ROTATE;
    mur = mur.wrapping_mul(MUR_PRIME);
    mur ^= mur >> MUR_ROTATE;
    mur
}

/// Consistent-hash search over a sorted ring
///
/// Returns the index of the smallest element `>= key`, wrapping to 0 when
/// `key` is beyond the last element. The ring must be non-empty and sorted
/// ascending.
#[inline]
#[must_use]
pub fn chash_search(ring: &[u64], key: u64) -> usize {
    debug_assert!(!ring.is_empty());
    let idx = ring.partition_point(|&h| h < key);
    if idx == ring.len() { 0 } else { idx }
}

/// Number of bits needed to represent values in `[0, val)` rounded up to a
/// power of two; `ceil(log2(val))`, with 0 and 1 mapping to 0
#[inline]
#[must_use]
pub const fn power2_nbits(val: u32) -> u32 {
    if val <= 1 {
        0
    } else {
        32 - (val - 1).leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u64_hash_width() {
        for bits in [1, 8, 23, 37, 45, 63] {
            for val in [0u64, 1, 42, u64::MAX, 0xdead_beef_cafe_f00d] {
                assert!(u64_hash(val, bits) < 1u64 << bits);
            }
        }
    }

    #[test]
    fn test_u64_hash_fixed_points() {
        // Durability contract: these values must never change.
        assert_eq!(u64_hash(0, 37), 0);
        assert_eq!(u64_hash(1, 64), GOLDEN_RATIO_PRIME_64);
        assert_eq!(u64_hash(1, 37), GOLDEN_RATIO_PRIME_64 >> 27);
    }

    #[test]
    fn test_u32_hash_width() {
        for bits in [1, 16, 23, 32] {
            for val in [0u64, 7, u64::from(u32::MAX), u64::MAX] {
                assert!(u64::from(u32_hash(val, bits)) < 1u64 << bits);
            }
        }
    }

    #[test]
    fn test_u32_hash_narrows_key() {
        // Only the low 32 bits of the key participate.
        assert_eq!(u32_hash(0x1234_5678, 23), u32_hash(0xffff_0000_1234_5678, 23));
    }

    #[test]
    fn test_murmur64_deterministic() {
        let a = murmur64(b"dkey-0", MUR_DEFAULT_SEED);
        let b = murmur64(b"dkey-0", MUR_DEFAULT_SEED);
        assert_eq!(a, b);
        assert_ne!(a, murmur64(b"dkey-1", MUR_DEFAULT_SEED));
        assert_ne!(a, murmur64(b"dkey-0", 1));
    }

    #[test]
    fn test_murmur64_tail_bytes_matter() {
        // 9 bytes exercises the one-byte tail path.
        let a = murmur64(b"abcdefghi", MUR_DEFAULT_SEED);
        let b = murmur64(b"abcdefghj", MUR_DEFAULT_SEED);
        assert_ne!(a, b);
    }

    #[test]
    fn test_chash_search_matches_linear_scan() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let ring: Vec<u64> = (0..64u64).map(|i| i * 1000).collect();
        for _ in 0..1000 {
            let key = rng.gen_range(0..70_000u64);
            let expect = ring.iter().position(|&h| h >= key).unwrap_or(0);
            assert_eq!(chash_search(&ring, key), expect);
        }
    }

    #[test]
    fn test_chash_search() {
        let ring = [0u64, 100, 200, 300];
        assert_eq!(chash_search(&ring, 0), 0);
        assert_eq!(chash_search(&ring, 1), 1);
        assert_eq!(chash_search(&ring, 100), 1);
        assert_eq!(chash_search(&ring, 250), 3);
        assert_eq!(chash_search(&ring, 300), 3);
        // Beyond the last element wraps to the start of the ring.
        assert_eq!(chash_search(&ring, 301), 0);
    }

    #[test]
    fn test_power2_nbits() {
        assert_eq!(power2_nbits(0), 0);
        assert_eq!(power2_nbits(1), 0);
        assert_eq!(power2_nbits(2), 1);
        assert_eq!(power2_nbits(5), 3);
        assert_eq!(power2_nbits(8), 3);
        assert_eq!(power2_nbits(9), 4);
        assert_eq!(power2_nbits(1024), 10);
    }
}
