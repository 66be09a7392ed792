//! Hash functions for registry slots and mapped-file names.

/// Jenkins one-at-a-time hash over the bytes of a path.
///
/// Used to reject non-matching mapped cells before comparing full paths.
#[must_use]
pub fn path_hash(key: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &byte in key {
        hash = hash.wrapping_add(u32::from(byte));
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

/// Home slot for `address` in a table of `capacity` slots.
///
/// Heap addresses share their low alignment bits, so they are dropped and the
/// rest is spread with a Fibonacci multiplier before reduction.
#[must_use]
pub fn slot_hash(address: usize, capacity: usize) -> usize {
    debug_assert!(capacity > 0);
    let mixed = ((address as u64) >> 4).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    ((mixed >> 32) as usize) % capacity
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_at_a_time_reference_values() {
        assert_eq!(path_hash(b""), 0);
        assert_eq!(path_hash(b"a"), 0xca2e_9442);
        assert_eq!(
            path_hash(b"The quick brown fox jumps over the lazy dog"),
            0x519e_91f5
        );
    }

    #[test]
    fn slot_hash_stays_in_range() {
        for capacity in [1_usize, 7, 64, 200_000] {
            for addr in (0x1000_usize..0x2_0000).step_by(0x130) {
                assert!(slot_hash(addr, capacity) < capacity);
            }
        }
    }

    #[test]
    fn aligned_addresses_spread_over_slots() {
        let capacity = 64;
        let mut used = [false; 64];
        for i in 0..64_usize {
            used[slot_hash(0x7f00_0000_0000 + i * 16, capacity)] = true;
        }
        let distinct = used.iter().filter(|u| **u).count();
        assert!(distinct > 32, "only {distinct} distinct slots");
    }
}
