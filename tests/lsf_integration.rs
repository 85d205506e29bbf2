//! End-to-end scenarios driven through the public API: the coder + filter
//! layer directly for the single-key scenarios, and `build_lsf`/`Lsf::query`
//! for the full-scale and persisted-layout scenarios.

use lsf::coder::{AnyCoder, Coder, CoderKind};
use lsf::filter::{self, OptPolicy};
use lsf::hash::{fingerprint, remix};
use lsf::reference_models::{FrequencyModel, Model};
use lsf::{build_lsf, Config, Lsf};

/// Enables `RUST_LOG`-controlled output for whichever test calls it;
/// harmless if another test already initialized the logger first.
fn init_logging() {
    let _ = env_logger::try_init();
}

fn round_trip_single(p: &[f32], y: u16, policy: &OptPolicy) -> (u16, u16, u16) {
    let mut enc = AnyCoder::new_encode(CoderKind::ArmedFano, p, y);
    let filter_code = filter::encode_filter(&mut enc, policy);

    let mut enc2 = AnyCoder::new_encode(CoderKind::ArmedFano, p, y);
    let correction_code = filter::encode_correction(&mut enc2, policy, &filter_code);

    let mut dec = AnyCoder::new_decode(CoderKind::ArmedFano, p);
    let decoded = filter::decode(&mut dec, policy, &filter_code, &correction_code);

    (decoded, filter_code.length, correction_code.length)
}

#[test]
fn s1_single_class_degenerate() {
    init_logging();
    let policy = OptPolicy::default();
    for y in [0u16] {
        let (decoded, flen, clen) = round_trip_single(&[1.0], y, &policy);
        assert_eq!(decoded, 0);
        assert_eq!(flen, 0);
        assert_eq!(clen, 0);
    }
}

#[test]
fn s2_confident_model_correct() {
    init_logging();
    let policy = OptPolicy::default();
    let p = [0.9f32, 0.05, 0.03, 0.02];
    let (decoded, flen, clen) = round_trip_single(&p, 0, &policy);
    assert_eq!(decoded, 0);
    let expected_k = policy.k(1.0 - 0.9, 0);
    assert_eq!(flen, expected_k as u16);
    assert_eq!(clen, 0);
}

#[test]
fn s3_wrong_confident_model() {
    init_logging();
    let policy = OptPolicy::default();
    let p = [0.9f32, 0.05, 0.03, 0.02];
    let (decoded, _flen, clen) = round_trip_single(&p, 2, &policy);
    assert_eq!(decoded, 2);
    assert!(clen >= 2, "expected correction length >= 2, got {clen}");
}

#[test]
fn s4_uniform_model() {
    init_logging();
    let policy = OptPolicy::default();
    let p = [0.25f32, 0.25, 0.25, 0.25];
    let (decoded, flen, clen) = round_trip_single(&p, 3, &policy);
    assert_eq!(decoded, 3);
    assert_eq!(flen, 0);
    assert_eq!(clen, 2);
}

#[test]
fn s5_extreme_tail() {
    init_logging();
    let policy = OptPolicy::default();
    let mut p = vec![0.999999f32];
    p.extend(std::iter::repeat(0.0000005f32).take(6));
    let (decoded, flen, clen) = round_trip_single(&p, 1, &policy);
    assert_eq!(decoded, 1);
    assert!(flen + clen <= 63);
}

/// A deterministic stand-in for a trained classifier: `features` carries
/// `[true_label, key_index]`, and the model derives a fixed pseudo-random
/// perturbation from those two numbers via the crate's own hash mixer, so
/// repeated calls with the same features always agree (required of any
/// `Model` implementation) without the test needing real training data.
struct NoisyOneHotModel {
    classes: usize,
    scratch: Vec<f32>,
}

impl NoisyOneHotModel {
    fn new(classes: usize) -> Self {
        NoisyOneHotModel { classes, scratch: vec![0.0; classes] }
    }

    fn gaussian(seed: u64, class: u64) -> f32 {
        let h1 = remix(seed, class);
        let h2 = remix(h1, 0xABCD_EF01);
        let u1 = ((h1 >> 11) as f64 / (1u64 << 53) as f64).max(1e-12);
        let u2 = h2 >> 11;
        let u2 = u2 as f64 / (1u64 << 53) as f64;
        let r = (-2.0 * u1.ln()).sqrt();
        (r * (2.0 * std::f64::consts::PI * u2).cos()) as f32
    }
}

impl Model for NoisyOneHotModel {
    fn invoke(&mut self, features: &[f32]) -> &[f32] {
        let y = features[0] as usize;
        let seed = features[1].to_bits() as u64;
        let mut logits = vec![0.0f32; self.classes];
        for (c, logit) in logits.iter_mut().enumerate() {
            let base = if c == y { 1.0 } else { 0.0 };
            *logit = base + Self::gaussian(seed, c as u64);
        }
        let max = logits.iter().cloned().fold(f32::MIN, f32::max);
        let mut sum = 0.0f32;
        for l in logits.iter_mut() {
            *l = (*l - max).exp();
            sum += *l;
        }
        for (i, &l) in logits.iter().enumerate() {
            self.scratch[i] = l / sum;
        }
        &self.scratch
    }

    fn classes(&self) -> usize {
        self.classes
    }

    fn model_bytes(&self) -> usize {
        self.classes * std::mem::size_of::<f32>()
    }
}

fn build_noisy_lsf(n: usize, classes: usize) -> (Lsf, Vec<u16>, Vec<Vec<f32>>, lsf::LsfStats) {
    let mut state = 0x1234_5678_9ABC_DEF0u64;
    let mut labels = Vec::with_capacity(n);
    let mut features = Vec::with_capacity(n);
    for i in 0..n {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let y = (state >> 32) as u16 % classes as u16;
        labels.push(y);
        features.push(vec![y as f32, i as f32]);
    }
    let mut model = NoisyOneHotModel::new(classes);
    let keys: Vec<(u64, Vec<f32>, u16)> = (0..n).map(|i| (i as u64, features[i].clone(), labels[i])).collect();
    let (lsf, stats) = build_lsf(keys.into_iter(), classes, &mut model, &Config::STANDARD).unwrap();
    (lsf, labels, features, stats)
}

#[test]
fn s6_full_lsf_ten_thousand_keys() {
    init_logging();
    let classes = 8;
    let (lsf, labels, features, stats) = build_noisy_lsf(10_000, classes);
    let mut model = NoisyOneHotModel::new(classes);

    for i in 0..labels.len() {
        let p = model.invoke(&features[i]).to_vec();
        let h = fingerprint(Config::STANDARD.filter_seed, i as u64, &features[i]);
        assert_eq!(lsf.query(h, &p), labels[i], "key {i}");
    }

    assert!(
        stats.total_bits_per_key <= stats.cross_entropy_bits_per_key + 0.3,
        "total_bits_per_key={} exceeds cross_entropy+0.3={}",
        stats.total_bits_per_key,
        stats.cross_entropy_bits_per_key + 0.3
    );
}

#[test]
fn persisted_layout_round_trip_at_scale() {
    init_logging();
    let classes = 5;
    let (lsf, labels, features, _stats) = build_noisy_lsf(2_000, classes);
    let bytes = lsf.to_bytes();
    let reloaded = Lsf::from_bytes(&bytes).expect("round trip should parse");

    let mut model = NoisyOneHotModel::new(classes);
    for i in 0..labels.len() {
        let p = model.invoke(&features[i]).to_vec();
        let h = fingerprint(Config::STANDARD.filter_seed, i as u64, &features[i]);
        assert_eq!(reloaded.query(h, &p), labels[i], "key {i}");
    }
}

#[test]
fn frequency_model_end_to_end() {
    init_logging();
    let labels: Vec<u16> = (0..500).map(|i| (i % 4) as u16).collect();
    let mut model = FrequencyModel::new(4, &labels);
    let keys: Vec<(u64, Vec<f32>, u16)> =
        labels.iter().enumerate().map(|(i, &y)| (i as u64, Vec::new(), y)).collect();
    let (lsf, stats) = build_lsf(keys.into_iter(), 4, &mut model, &Config::STANDARD).unwrap();
    assert_eq!(stats.num_keys, 500);
    for (i, &y) in labels.iter().enumerate() {
        let p = model.invoke(&[]).to_vec();
        let h = fingerprint(Config::STANDARD.filter_seed, i as u64, &[]);
        assert_eq!(lsf.query(h, &p), y);
    }
}
