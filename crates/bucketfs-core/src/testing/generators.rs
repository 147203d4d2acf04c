//! Payload generators.

use rand::Rng;

/// Payload lengths that straddle the default size classes
/// (4 KiB, 16 KiB, 64 KiB, 256 KiB, 1 MiB) and their boundaries.
pub const SIZE_CLASS_SAMPLES: &[usize] = &[
    1,
    100,
    4 * 1024 - 1,
    4 * 1024,
    4 * 1024 + 1,
    10 * 1024,
    64 * 1024,
    100 * 1024,
    256 * 1024 + 7,
    1024 * 1024,
    3 * 1024 * 1024 + 11,
];

/// Generate random bytes of specified size.
pub fn random_bytes(size: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    (0..size).map(|_| rng.random()).collect()
}

/// Deterministic content where every byte depends on its offset and a seed.
///
/// Corruption shows up as a mismatch at a specific, reproducible offset.
pub fn patterned(size: usize, seed: u8) -> Vec<u8> {
    (0..size)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed).wrapping_add((i >> 8) as u8))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterned_is_deterministic_and_seeded() {
        assert_eq!(patterned(1000, 3), patterned(1000, 3));
        assert_ne!(patterned(1000, 3), patterned(1000, 4));
    }

    #[test]
    fn test_random_bytes_length() {
        assert_eq!(random_bytes(4097).len(), 4097);
    }
}
