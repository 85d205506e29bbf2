//! Filter+correction encoding: splits a coder's code into a *filter
//! string* (cheap, skippable at query time once it disagrees with a
//! prediction) and a *correction string* (the minimal bits actually needed
//! once the filter is known).
//!
//! At every level the coder reports a branching probability `p` for the
//! less-likely child (§[`crate::coder`]); a [`FilterPolicy`] turns that
//! probability into a bit count `k`. The encoder appends `k` ones when the
//! walk took the predicted branch and `k` zeros when it didn't, so "all
//! ones at level `l`" in the filter means "the prediction at level `l` was
//! wrong" -- the correction string then only needs to carry the true bit
//! for levels where that happened.
//!
//! `encode_filter`, `encode_correction` and `decode` all thread the same
//! running bit budget (`consumed`, capped at 63) through the walk, so a
//! build that clamps `k` at some level clamps it identically at decode
//! time, as long as the same policy and the same coder are used.

use crate::coder::Coder;
use crate::Error;

/// Maximum combined length, in bits, of a filter or correction string.
pub const MAX_CODE_LENGTH: u16 = 63;

/// A packed bit string, least-significant-bit first: bit at level `k` is
/// `(bits >> k) & 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterCode {
    pub bits: u64,
    pub length: u16,
}

impl FilterCode {
    pub fn new(bits: u64, length: u16) -> Result<Self, Error> {
        if length > MAX_CODE_LENGTH {
            return Err(Error::CodeTooLong { length });
        }
        Ok(FilterCode { bits, length })
    }
}

/// Same shape as [`FilterCode`]; holds only the bits that correct filter
/// mispredictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CorrectionCode {
    pub bits: u64,
    pub length: u16,
}

impl CorrectionCode {
    pub fn new(bits: u64, length: u16) -> Result<Self, Error> {
        if length > MAX_CODE_LENGTH {
            return Err(Error::CodeTooLong { length });
        }
        Ok(CorrectionCode { bits, length })
    }
}

fn mask_of(k: u8) -> u64 {
    if k == 0 {
        0
    } else {
        (1u64 << k) - 1
    }
}

/// Clamps a policy's requested bit count so the running total across the
/// whole walk never exceeds [`MAX_CODE_LENGTH`].
fn clamp_k(k: u8, consumed: u16) -> u8 {
    let remaining = MAX_CODE_LENGTH.saturating_sub(consumed);
    (k as u16).min(remaining) as u8
}

/// Turns a branching probability (and the depth it occurs at) into a
/// filter bit count.
pub trait FilterPolicy {
    fn k(&self, p: f32, depth: u16) -> u8;
}

/// Threshold table `T[k] = 1 / (2^(k+1) + 1)`: `k` is the largest index
/// `<= k_max` with `T[k] > p`. This is the default policy used by builds.
#[derive(Debug, Clone, Copy)]
pub struct OptPolicy {
    pub k_max: u8,
}

impl OptPolicy {
    pub const fn new(k_max: u8) -> Self {
        OptPolicy { k_max }
    }
}

impl Default for OptPolicy {
    fn default() -> Self {
        OptPolicy::new(20)
    }
}

impl FilterPolicy for OptPolicy {
    fn k(&self, p: f32, _depth: u16) -> u8 {
        let mut best = 0u8;
        for k in 0..=self.k_max {
            let threshold = 1.0f32 / ((1u64 << (k as u32 + 1)) as f32 + 1.0);
            if threshold > p {
                best = k;
            } else {
                break;
            }
        }
        best
    }
}

/// Degenerates the scheme to a plain retrieval of the raw code: no filter
/// bits are ever allocated. Kept for testing symmetry against `OptPolicy`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFilterPolicy;

impl FilterPolicy for NoFilterPolicy {
    fn k(&self, _p: f32, _depth: u16) -> u8 {
        0
    }
}

/// Delegates to an inner policy only at the root (depth 0); every deeper
/// level gets zero filter bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct RootOnlyPolicy<P> {
    pub inner: P,
}

impl<P> RootOnlyPolicy<P> {
    pub const fn new(inner: P) -> Self {
        RootOnlyPolicy { inner }
    }
}

impl<P: FilterPolicy> FilterPolicy for RootOnlyPolicy<P> {
    fn k(&self, p: f32, depth: u16) -> u8 {
        if depth == 0 {
            self.inner.k(p, depth)
        } else {
            0
        }
    }
}

/// Runs `coder` (already constructed in encode mode for the target symbol)
/// to completion, producing the filter string.
pub fn encode_filter<C: Coder>(coder: &mut C, policy: &dyn FilterPolicy) -> FilterCode {
    let mut bits: u64 = 0;
    let mut length: u16 = 0;
    let mut depth: u16 = 0;
    while !coder.has_finished() {
        let p = coder.rel_probability_and_advance();
        let k = clamp_k(policy.k(p, depth), length);
        coder.next_encode_bit();
        let predicted = !coder.bit();
        if k > 0 {
            let chunk = if predicted { mask_of(k) } else { 0 };
            bits |= chunk << length;
        }
        log::trace!("filter level {depth}: p={p}, k={k}, predicted={predicted}");
        length += k as u16;
        depth += 1;
    }
    FilterCode { bits, length }
}

/// Runs `coder` (encode mode) again, consuming `filter` the way the
/// filter ribbon will return it at query time, emitting only the bits
/// needed to correct levels where the filter was all-ones.
pub fn encode_correction<C: Coder>(
    coder: &mut C,
    policy: &dyn FilterPolicy,
    filter: &FilterCode,
) -> CorrectionCode {
    let mut remaining_filter = filter.bits;
    let mut consumed: u16 = 0;
    let mut depth: u16 = 0;
    let mut correction_bits: u64 = 0;
    let mut correction_len: u16 = 0;
    while !coder.has_finished() {
        let p = coder.rel_probability_and_advance();
        let k = clamp_k(policy.k(p, depth), consumed);
        coder.next_encode_bit();
        let b = coder.bit();
        let mask = mask_of(k);
        let f = remaining_filter & mask;
        remaining_filter >>= k;
        consumed += k as u16;
        if f == mask {
            if b {
                correction_bits |= 1u64 << correction_len;
            }
            correction_len += 1;
        }
        log::trace!("correction level {depth}: k={k}, f==mask={}", f == mask);
        depth += 1;
    }
    CorrectionCode { bits: correction_bits, length: correction_len }
}

/// Runs `coder` (decode mode) to completion, consulting `filter` and
/// `correction` at each level, returning the decoded symbol.
pub fn decode<C: Coder>(
    coder: &mut C,
    policy: &dyn FilterPolicy,
    filter: &FilterCode,
    correction: &CorrectionCode,
) -> u16 {
    let mut remaining_filter = filter.bits;
    let remaining_correction = correction.bits;
    let mut correction_pos: u16 = 0;
    let mut consumed: u16 = 0;
    let mut depth: u16 = 0;
    while !coder.has_finished() {
        let p = coder.rel_probability_and_advance();
        let k = clamp_k(policy.k(p, depth), consumed);
        let mask = mask_of(k);
        let f = remaining_filter & mask;
        remaining_filter >>= k;
        consumed += k as u16;
        let bit = if f == mask {
            let b = (remaining_correction >> correction_pos) & 1 == 1;
            correction_pos += 1;
            b
        } else {
            false
        };
        coder.next_bit(bit);
        log::trace!("decode level {depth}: k={k}, trusted_predicted={}", f != mask);
        depth += 1;
    }
    coder.result()
}
