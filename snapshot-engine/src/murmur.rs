/// Murmur2-64 (the 64-bit-on-64-bit variant) over a byte slice, seed 0.
/// Used to hash a thread's pc array so identical stack shapes across
/// threads share one `stack_hash` and only the first emits `stack_pcs`.
pub fn murmur2_64(data: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xc6a4_a793_5bd1_e995;
    const R: u32 = 47;

    let mut h: u64 = seed ^ (data.len() as u64).wrapping_mul(M);

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut buf = [0u8; 8];
        buf[..tail.len()].copy_from_slice(tail);
        h ^= u64::from_le_bytes(buf);
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

/// Hashes a thread's pc array directly, word by word, with seed 0. The
/// original hashes a `[]uint64` rather than its byte encoding, so the
/// initial mix uses the pc *count* as the length term (`len(stack) * m`),
/// not the byte length `murmur2_64` would use for a flattened byte slice --
/// pcs are always whole 8-byte words so the per-word loop is the same
/// either way, but the seed mix is not, and `stack_hash` must reproduce the
/// original's value for the same stack.
pub fn hash_stack(pcs: &[u64]) -> u64 {
    const M: u64 = 0xc6a4_a793_5bd1_e995;
    const R: u32 = 47;

    let mut h: u64 = (pcs.len() as u64).wrapping_mul(M);

    for &pc in pcs {
        let mut k = pc;
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_stack_hashes_the_same() {
        let a = [1u64, 2, 3, 4];
        let b = [1u64, 2, 3, 4];
        assert_eq!(hash_stack(&a), hash_stack(&b));
    }

    #[test]
    fn different_stacks_hash_differently() {
        let a = hash_stack(&[1u64, 2, 3]);
        let b = hash_stack(&[1u64, 2, 4]);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_stack_is_stable() {
        let empty: [u64; 0] = [];
        assert_eq!(hash_stack(&empty), hash_stack(&empty));
    }

    #[test]
    fn matches_known_vector_for_empty_input_seed_zero() {
        // Murmur2-64 over zero bytes with seed 0 reduces to avalanching
        // the seed alone; pin the result so future refactors can't
        // silently change the hash law the wire format depends on.
        assert_eq!(murmur2_64(&[], 0), murmur2_64(&[], 0));
        let h = murmur2_64(&[], 0);
        // h ^= h >> 47 twice with h starting at 0 stays 0.
        assert_eq!(h, 0);
    }
}
