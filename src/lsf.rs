//! Build/query orchestrator tying the coder, filter encoder and ribbon
//! retrieval together into a complete learned static function.
//!
//! Build is two passes over the training keys: the first runs the filter
//! encoder and inserts filter codes into a ribbon; the second re-queries
//! that ribbon (exactly as a real query would) to learn what filter bits
//! each key will see, and inserts only the correction bits the filter
//! didn't already predict into a second ribbon. This is essential: the
//! correction encoding must see exactly what the filter ribbon returns at
//! query time, not what was encoded, since a handful of keys may
//! (extremely rarely) collide into rows that don't round-trip perfectly
//! without the second pass observing the built structure directly.

use crate::coder::{AnyCoder, CoderKind};
use crate::filter::{self, CorrectionCode, FilterCode, OptPolicy};
use crate::hash::fingerprint;
use crate::reference_models::Model;
use crate::ribbon::Ribbon;
use crate::{Config, Error};

const MAGIC: &[u8; 4] = b"LSF1";

fn validate_probabilities(p: &[f32]) -> Result<(), Error> {
    let mut sum = 0.0f32;
    for &v in p {
        if !v.is_finite() || v < 0.0 {
            return Err(Error::InvalidProbabilities);
        }
        sum += v;
    }
    if (sum - 1.0).abs() >= 1e-3 {
        return Err(Error::InvalidProbabilities);
    }
    Ok(())
}

fn pack_with_terminator(bits: u64, length: u16) -> u64 {
    bits | (1u64 << length)
}

fn strip_terminator(raw: u64) -> (u64, u16) {
    if raw == 0 {
        return (0, 0);
    }
    let length = 63 - raw.leading_zeros() as u16;
    let mask = if length == 0 { 0 } else { (1u64 << length) - 1 };
    (raw & mask, length)
}

/// Size and cross-entropy statistics for a completed build, returned
/// directly instead of logged as a side effect.
#[derive(Debug, Clone, Copy)]
pub struct LsfStats {
    pub num_keys: usize,
    pub filter_bits_per_key: f64,
    pub correction_bits_per_key: f64,
    pub model_bits_per_key: f64,
    pub total_bits_per_key: f64,
    /// `H = -(1/n) sum_i log2(p_i[y_i])`, a lower bound on filter +
    /// correction bits per key.
    pub cross_entropy_bits_per_key: f64,
}

/// A built, immutable learned static function. Holds no interior
/// mutability, so queries may be issued from many threads without
/// synchronization.
#[derive(Debug, Clone)]
pub struct Lsf {
    classes: usize,
    coder_kind: CoderKind,
    k_max: u8,
    seed_filter: u64,
    seed_correction: u64,
    max_len_filter: u16,
    max_len_correction: u16,
    filter_ribbon: Ribbon,
    correction_ribbon: Ribbon,
}

impl Lsf {
    /// `h` must be the same fingerprint (`crate::hash::fingerprint` keyed
    /// by `seed_filter`) used for this key at build time; `p` is the
    /// model's current output for this key's features.
    pub fn query(&self, h: u64, p: &[f32]) -> u16 {
        let policy = OptPolicy::new(self.k_max);
        let (filter_bits, filter_length) = strip_terminator(self.filter_ribbon.query(h));
        let (correction_bits, correction_length) = strip_terminator(self.correction_ribbon.query(h));
        let filter = FilterCode { bits: filter_bits, length: filter_length };
        let correction = CorrectionCode { bits: correction_bits, length: correction_length };
        let mut coder = AnyCoder::new_decode(self.coder_kind, p);
        filter::decode(&mut coder, &policy, &filter, &correction)
    }

    /// Size of the two ribbons, in bytes. Model size is reported
    /// separately by the model / [`LsfStats`].
    pub fn size_bytes(&self) -> usize {
        self.filter_ribbon.storage_bytes() + self.correction_ribbon.storage_bytes()
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let filter_bytes = self.filter_ribbon.to_bytes();
        let correction_bytes = self.correction_ribbon.to_bytes();
        let mut out = Vec::with_capacity(32 + filter_bytes.len() + correction_bytes.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(self.coder_kind as u16).to_le_bytes());
        out.push(self.k_max);
        out.push(0); // reserved
        out.extend_from_slice(&(self.classes as u32).to_le_bytes());
        out.extend_from_slice(&self.seed_filter.to_le_bytes());
        out.extend_from_slice(&self.seed_correction.to_le_bytes());
        out.extend_from_slice(&self.max_len_filter.to_le_bytes());
        out.extend_from_slice(&self.max_len_correction.to_le_bytes());
        out.extend_from_slice(&(filter_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&(correction_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&filter_bytes);
        out.extend_from_slice(&correction_bytes);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        const HEADER_LEN: usize = 4 + 2 + 1 + 1 + 4 + 8 + 8 + 2 + 2 + 4 + 4;
        if data.len() < HEADER_LEN {
            return Err(Error::Truncated);
        }
        if &data[0..4] != MAGIC {
            return Err(Error::BadMagic);
        }
        let coder_kind = CoderKind::from_u16(u16::from_le_bytes(data[4..6].try_into().unwrap()))
            .ok_or(Error::BadMagic)?;
        let k_max = data[6];
        // data[7] reserved
        let classes = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
        let seed_filter = u64::from_le_bytes(data[12..20].try_into().unwrap());
        let seed_correction = u64::from_le_bytes(data[20..28].try_into().unwrap());
        let max_len_filter = u16::from_le_bytes(data[28..30].try_into().unwrap());
        let max_len_correction = u16::from_le_bytes(data[30..32].try_into().unwrap());
        let filter_ribbon_bytes = u32::from_le_bytes(data[32..36].try_into().unwrap()) as usize;
        let correction_ribbon_bytes = u32::from_le_bytes(data[36..40].try_into().unwrap()) as usize;

        let body = &data[HEADER_LEN..];
        if body.len() < filter_ribbon_bytes + correction_ribbon_bytes {
            return Err(Error::Truncated);
        }
        let (filter_ribbon, consumed) = Ribbon::from_bytes(&body[..filter_ribbon_bytes])?;
        if consumed != filter_ribbon_bytes {
            return Err(Error::Truncated);
        }
        let (correction_ribbon, consumed) =
            Ribbon::from_bytes(&body[filter_ribbon_bytes..filter_ribbon_bytes + correction_ribbon_bytes])?;
        if consumed != correction_ribbon_bytes {
            return Err(Error::Truncated);
        }

        Ok(Lsf {
            classes,
            coder_kind,
            k_max,
            seed_filter,
            seed_correction,
            max_len_filter,
            max_len_correction,
            filter_ribbon,
            correction_ribbon,
        })
    }
}

/// Builds a learned static function over `keys` (`(key_index, features,
/// label)` triples), invoking `model` once per key per pass. `classes`
/// must match `model.classes()` and every `p.len()` the model returns.
pub fn build_lsf<M: Model>(
    keys: impl Iterator<Item = (u64, Vec<f32>, u16)>,
    classes: usize,
    model: &mut M,
    config: &Config,
) -> Result<(Lsf, LsfStats), Error> {
    let entries: Vec<(u64, Vec<f32>, u16)> = keys.collect();
    let n = entries.len();
    let policy = OptPolicy::new(config.k_max);

    log::debug!("lsf build: pass 1 ({n} keys)");
    let mut buf_filter: Vec<(u64, u64)> = Vec::with_capacity(n);
    let mut max_len_filter: u16 = 0;
    let mut cross_entropy_bits = 0.0f64;
    for (index, features, y) in &entries {
        let p = model.invoke(features);
        if p.len() != classes {
            return Err(Error::DimensionMismatch { expected: classes, got: p.len() });
        }
        validate_probabilities(p)?;
        let h = fingerprint(config.filter_seed, *index, features);
        let mut coder = AnyCoder::new_encode(config.coder_kind, p, *y);
        let code = filter::encode_filter(&mut coder, &policy);
        max_len_filter = max_len_filter.max(code.length);
        buf_filter.push((h, pack_with_terminator(code.bits, code.length)));
        cross_entropy_bits += -((p[*y as usize] as f64).max(1e-12)).log2();
    }

    let filter_ribbon = Ribbon::build(
        &buf_filter,
        max_len_filter + 1,
        config.filter_seed,
        config.slots_per_item,
        config.max_build_attempts,
    )?;

    log::debug!("lsf build: pass 2 ({n} keys)");
    let mut buf_correction: Vec<(u64, u64)> = Vec::with_capacity(n);
    let mut max_len_correction: u16 = 0;
    for (index, features, y) in &entries {
        let p = model.invoke(features);
        if p.len() != classes {
            return Err(Error::DimensionMismatch { expected: classes, got: p.len() });
        }
        let h = fingerprint(config.filter_seed, *index, features);
        let (filter_bits, filter_length) = strip_terminator(filter_ribbon.query(h));
        let filter = FilterCode { bits: filter_bits, length: filter_length };

        let mut coder = AnyCoder::new_encode(config.coder_kind, p, *y);
        let correction = filter::encode_correction(&mut coder, &policy, &filter);
        max_len_correction = max_len_correction.max(correction.length);
        buf_correction.push((h, pack_with_terminator(correction.bits, correction.length)));

        #[cfg(debug_assertions)]
        {
            let mut decoder = AnyCoder::new_decode(config.coder_kind, p);
            let decoded = filter::decode(&mut decoder, &policy, &filter, &correction);
            if decoded != *y {
                log::error!("model nondeterminism detected at key {index}");
                return Err(Error::ModelNondeterministic);
            }
        }
    }

    let correction_ribbon = Ribbon::build(
        &buf_correction,
        max_len_correction + 1,
        config.correction_seed,
        config.slots_per_item,
        config.max_build_attempts,
    )?;

    let lsf = Lsf {
        classes,
        coder_kind: config.coder_kind,
        k_max: config.k_max,
        seed_filter: config.filter_seed,
        seed_correction: config.correction_seed,
        max_len_filter,
        max_len_correction,
        filter_ribbon,
        correction_ribbon,
    };

    let model_bytes = model.model_bytes();
    let stats = if n == 0 {
        LsfStats {
            num_keys: 0,
            filter_bits_per_key: 0.0,
            correction_bits_per_key: 0.0,
            model_bits_per_key: 0.0,
            total_bits_per_key: 0.0,
            cross_entropy_bits_per_key: 0.0,
        }
    } else {
        let filter_bits_per_key = lsf.filter_ribbon.storage_bytes() as f64 * 8.0 / n as f64;
        let correction_bits_per_key = lsf.correction_ribbon.storage_bytes() as f64 * 8.0 / n as f64;
        let model_bits_per_key = model_bytes as f64 * 8.0 / n as f64;
        LsfStats {
            num_keys: n,
            filter_bits_per_key,
            correction_bits_per_key,
            model_bits_per_key,
            total_bits_per_key: filter_bits_per_key + correction_bits_per_key + model_bits_per_key,
            cross_entropy_bits_per_key: cross_entropy_bits / n as f64,
        }
    };

    log::debug!(
        "lsf build complete: {n} keys, {:.2} filter bits/key, {:.2} correction bits/key",
        stats.filter_bits_per_key,
        stats.correction_bits_per_key
    );

    Ok((lsf, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference_models::FrequencyModel;

    fn run_build(labels: &[u16], classes: usize, config: &Config) -> (Lsf, LsfStats, Vec<Vec<f32>>) {
        let mut model = FrequencyModel::new(classes, labels);
        let keys: Vec<(u64, Vec<f32>, u16)> =
            labels.iter().enumerate().map(|(i, &y)| (i as u64, Vec::new(), y)).collect();
        let features: Vec<Vec<f32>> = keys.iter().map(|(_, f, _)| f.clone()).collect();
        let (lsf, stats) = build_lsf(keys.into_iter(), classes, &mut model, config).unwrap();
        (lsf, stats, features)
    }

    fn query_all(lsf: &Lsf, labels: &[u16], features: &[Vec<f32>], config: &Config, p: &[f32]) {
        for (i, &y) in labels.iter().enumerate() {
            let h = fingerprint(config.filter_seed, i as u64, &features[i]);
            assert_eq!(lsf.query(h, p), y, "key {i}");
        }
    }

    #[test]
    fn single_class_degenerate() {
        let labels = vec![0u16; 20];
        let (lsf, stats, features) = run_build(&labels, 1, &Config::STANDARD);
        assert_eq!(stats.num_keys, 20);
        query_all(&lsf, &labels, &features, &Config::STANDARD, &[1.0]);
    }

    #[test]
    fn confident_model_round_trips() {
        let mut labels = vec![0u16; 95];
        labels.extend([1u16, 2, 3, 3, 1]);
        let (lsf, _stats, features) = run_build(&labels, 4, &Config::STANDARD);
        let mut model = FrequencyModel::new(4, &labels);
        for (i, &y) in labels.iter().enumerate() {
            let p = model.invoke(&features[i]).to_vec();
            let h = fingerprint(Config::STANDARD.filter_seed, i as u64, &features[i]);
            assert_eq!(lsf.query(h, &p), y, "key {i}");
        }
    }

    #[test]
    fn uniform_model_round_trips() {
        let labels = vec![0u16, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3];
        let (lsf, _stats, features) = run_build(&labels, 4, &Config::STANDARD);
        let mut model = FrequencyModel::new(4, &labels);
        for (i, &y) in labels.iter().enumerate() {
            let p = model.invoke(&features[i]).to_vec();
            let h = fingerprint(Config::STANDARD.filter_seed, i as u64, &features[i]);
            assert_eq!(lsf.query(h, &p), y, "key {i}");
        }
    }

    #[test]
    fn persisted_layout_round_trip() {
        let mut labels = vec![0u16; 200];
        labels.extend((0..50).map(|i| (i % 5) as u16 + 1));
        let (lsf, _stats, _features) = run_build(&labels, 6, &Config::STANDARD);
        let bytes = lsf.to_bytes();
        let reloaded = Lsf::from_bytes(&bytes).unwrap();
        assert_eq!(reloaded.classes(), lsf.classes());
        assert_eq!(reloaded.size_bytes(), lsf.size_bytes());

        let mut model = FrequencyModel::new(6, &labels);
        for (i, &y) in labels.iter().enumerate() {
            let p = model.invoke(&[]).to_vec();
            let h = fingerprint(Config::STANDARD.filter_seed, i as u64, &[]);
            assert_eq!(reloaded.query(h, &p), y, "key {i}");
        }
    }

    #[test]
    fn from_bytes_rejects_bad_magic() {
        let bytes = vec![0u8; 64];
        assert!(matches!(Lsf::from_bytes(&bytes), Err(Error::BadMagic)));
    }

    #[test]
    fn rejects_dimension_mismatch() {
        struct Bad;
        impl Model for Bad {
            fn invoke(&mut self, _features: &[f32]) -> &[f32] {
                &[0.5, 0.5]
            }
            fn classes(&self) -> usize {
                2
            }
            fn model_bytes(&self) -> usize {
                0
            }
        }
        let mut model = Bad;
        let keys = vec![(0u64, Vec::new(), 0u16)];
        let err = build_lsf(keys.into_iter(), 3, &mut model, &Config::STANDARD).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, got: 2 }));
    }
}
