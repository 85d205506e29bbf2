//! Keyed 64-bit fingerprinting for training keys.
//!
//! The fingerprint only needs to behave like a strong, keyed hash over the
//! combination of a key's index and its feature vector; it does not need to
//! be cryptographically secure, and (matching the rest of this crate's
//! dependency-light style) is implemented here without pulling in an
//! external hashing crate.
//!
//! The mixer is a SplitMix64-style finalizer, which is a well known
//! avalanche-complete 64-bit bijection; features are folded in by XOR-ing
//! their bit pattern into the running state before each mix step.

/// Computes the fingerprint `hash(seed, key_index, features)`.
///
/// Two invocations with the same `seed` are guaranteed to produce the same
/// fingerprint for the same `(key_index, features)`, which is all
/// [`Invariant 1`](crate) of the data model requires. Different `seed`s
/// produce independent-looking fingerprint families, which is what lets the
/// filter and correction ribbons avoid correlated hash collisions.
pub fn fingerprint(seed: u64, key_index: u64, features: &[f32]) -> u64 {
    let mut state = seed ^ splitmix64(key_index.wrapping_add(0x9E3779B97F4A7C15));
    for &f in features {
        state = splitmix64(state ^ (f.to_bits() as u64));
    }
    splitmix64(state)
}

/// A second, independent mix of an already-computed fingerprint, used by the
/// ribbon to derive a key's band start and xor-pattern from the same
/// fingerprint without re-hashing the original key material.
pub fn remix(h: u64, salt: u64) -> u64 {
    splitmix64(h ^ salt)
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
