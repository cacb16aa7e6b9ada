use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

// Structural hashing
//
// Node hashes are built by folding values into a running seed, in order:
// the op tag, the value type, every child's hash, then the op's own
// parameters. The fold is order-sensitive, so `f(a, b)` and `f(b, a)` hash
// differently.
//
// Floats are folded through their bit pattern; 0.0 and -0.0 hash apart, and
// equality (`==`) is what finally decides whether two nodes coalesce.

/// Fold `v` into `seed` (boost-style combine).
pub fn hash_combine<T: Hash + ?Sized>(seed: &mut u64, v: &T) {
    let mut h = DefaultHasher::new();
    v.hash(&mut h);
    let x = h.finish();
    *seed ^= x
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(*seed << 6)
        .wrapping_add(*seed >> 2);
}

/// Fold an `f32` into `seed` by its bit pattern.
pub fn hash_f32(seed: &mut u64, v: f32) {
    hash_combine(seed, &v.to_bits());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_is_order_sensitive() {
        let mut ab = 0;
        hash_combine(&mut ab, &1u64);
        hash_combine(&mut ab, &2u64);
        let mut ba = 0;
        hash_combine(&mut ba, &2u64);
        hash_combine(&mut ba, &1u64);
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_float_bits() {
        let (mut a, mut b) = (7, 7);
        hash_f32(&mut a, 0.5);
        hash_f32(&mut b, 0.5);
        assert_eq!(a, b);
        hash_f32(&mut b, 0.25);
        assert_ne!(a, b);
    }
}
