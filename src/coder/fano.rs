//! Bucketed Fano-like coder.
//!
//! Symbols are bucketed by the magnitude of their probability (bucket `b`
//! covers roughly `[2^-(b+1), 2^-b)`, `B = 10` buckets), then sorted by
//! bucket. Each symbol in that order is assigned a monotone, saturating
//! code in an 11-bit (`B + 1`) space, proportional to its bucket's
//! quantized width. The walk narrows a `[left, right]` window over that
//! sorted order by repeatedly finding, from the current bit position
//! downward, where the window's assigned codes transition from clear to
//! set -- a cheaper, coarser alternative to rebuilding a Huffman tree per
//! call.
//!
//! Because the per-symbol code is only an approximate (power-of-two
//! quantized) stand-in for its probability, a window can fail to split at
//! a given bit position (every remaining code agrees there); the walk
//! retries at the next bit position down. If probability mass is spread
//! across enough symbols that all `B + 1` bit positions are exhausted
//! before the window narrows to one symbol (only possible when very many
//! symbols compete for the coarse low-probability buckets), the walk falls
//! back to bisecting the window by rank -- still fully determined by the
//! static sorted order, so encode and decode remain in lock-step.

use super::{clamp_prob, Coder};

const NUM_BUCKETS: i32 = 10;

fn bucket_of(p: f32) -> usize {
    let p = p.max(1e-12);
    let b = (-(p.log2())).ceil() as i32 - 1;
    b.clamp(0, NUM_BUCKETS - 1) as usize
}

/// Static, probability-derived layout shared by encode and decode walks.
struct Layout {
    /// `order[rank]` = original symbol index at that rank.
    order: Vec<u16>,
    /// `rank_of[symbol]` = rank of that symbol in `order`.
    rank_of: Vec<u16>,
    /// `codes[rank]` = saturating monotone code assigned to that rank.
    codes: Vec<u64>,
    /// `p[symbol]` = original probability (used for mass summation).
    p: Vec<f32>,
}

impl Layout {
    fn build(p: &[f32]) -> Self {
        let c = p.len();
        let mut order: Vec<u16> = (0..c as u16).collect();
        order.sort_by_key(|&sym| (bucket_of(p[sym as usize]), sym));

        let max_code: u64 = (1u64 << (NUM_BUCKETS + 1)) - 1;
        let mut codes = vec![0u64; c];
        let mut running: u64 = 0;
        for (rank, &sym) in order.iter().enumerate() {
            let bucket = bucket_of(p[sym as usize]) as i32;
            let step = 1u64 << (NUM_BUCKETS - bucket);
            codes[rank] = running.min(max_code);
            running = running.saturating_add(step).min(max_code + 1);
        }

        let mut rank_of = vec![0u16; c];
        for (rank, &sym) in order.iter().enumerate() {
            rank_of[sym as usize] = rank as u16;
        }

        Layout { order, rank_of, codes, p: p.to_vec() }
    }

    fn mass(&self, left: usize, right: usize) -> f32 {
        self.order[left..=right].iter().map(|&s| self.p[s as usize]).sum()
    }

    fn code_bit_set(&self, rank: usize, bit_pos: i32) -> bool {
        (self.codes[rank] >> bit_pos) & 1 == 1
    }
}

pub struct FanoCoder {
    layout: Layout,
    left: usize,
    right: usize,
    bit_pos: i32,
    target_rank: Option<u16>,
    pending_center: usize,
    pending_flip: bool,
    last_bit: bool,
}

impl FanoCoder {
    pub fn new_decode(p: &[f32]) -> Self {
        let layout = Layout::build(p);
        let right = layout.order.len() - 1;
        FanoCoder {
            layout,
            left: 0,
            right,
            bit_pos: NUM_BUCKETS,
            target_rank: None,
            pending_center: 0,
            pending_flip: false,
            last_bit: false,
        }
    }

    pub fn new_encode(p: &[f32], symbol: u16) -> Self {
        let layout = Layout::build(p);
        let right = layout.order.len() - 1;
        let target_rank = layout.rank_of[symbol as usize];
        FanoCoder {
            layout,
            left: 0,
            right,
            bit_pos: NUM_BUCKETS,
            target_rank: Some(target_rank),
            pending_center: 0,
            pending_flip: false,
            last_bit: false,
        }
    }

    /// Finds the next valid split point starting from `self.bit_pos`,
    /// decrementing `self.bit_pos` past positions that do not split the
    /// current window. Falls back to a plain rank bisection once bit
    /// positions are exhausted.
    fn find_split(&mut self) -> usize {
        while self.bit_pos >= 0 {
            let mut split = None;
            for rank in self.left..=self.right {
                if self.layout.code_bit_set(rank, self.bit_pos) {
                    split = Some(rank);
                    break;
                }
            }
            match split {
                None => {
                    // all-zero in this window: no split at this bit.
                    self.bit_pos -= 1;
                }
                Some(rank) if rank == self.left => {
                    // all-one: no split at this bit either.
                    self.bit_pos -= 1;
                }
                Some(rank) => return rank - 1,
            }
        }
        // Bit budget exhausted with ties remaining: bisect by rank so the
        // walk still terminates deterministically.
        self.left + (self.right - self.left) / 2
    }
}

impl Coder for FanoCoder {
    fn rel_probability_and_advance(&mut self) -> f32 {
        let center = self.find_split();
        let total = self.layout.mass(self.left, self.right);
        let left_mass = self.layout.mass(self.left, center);
        let ratio = if total > 0.0 { left_mass / total } else { 0.5 };
        let (prob, flip) = if ratio <= 0.5 { (ratio, true) } else { (1.0 - ratio, false) };
        self.pending_center = center;
        self.pending_flip = flip;
        clamp_prob(prob)
    }

    fn has_finished(&self) -> bool {
        self.left == self.right
    }

    fn next_encode_bit(&mut self) {
        let target = self.target_rank.expect("next_encode_bit requires encode mode");
        let raw_bit = target as usize > self.pending_center;
        let bit = raw_bit ^ self.pending_flip;
        if raw_bit {
            self.left = self.pending_center + 1;
        } else {
            self.right = self.pending_center;
        }
        self.bit_pos -= 1;
        self.last_bit = bit;
    }

    fn next_bit(&mut self, bit: bool) {
        let raw_bit = bit ^ self.pending_flip;
        if raw_bit {
            self.left = self.pending_center + 1;
        } else {
            self.right = self.pending_center;
        }
        self.bit_pos -= 1;
        self.last_bit = bit;
    }

    fn bit(&self) -> bool {
        self.last_bit
    }

    fn result(&self) -> u16 {
        self.layout.order[self.left]
    }
}
