//! # lsf
//!
//! A **learned static function**: a compact, immutable retrieval structure
//! that maps each key in a known training set to its previously assigned
//! label, exploiting an auxiliary probabilistic model to approach the
//! cross-entropy bound on retrieval size rather than paying `log2(C)` bits
//! per key.
//!
//! * [`coder`] -- prefix-free symbol coders (Huffman-like, bucketed Fano,
//!   and an "armed" wrapper for the confident-correct case) whose
//!   branching probabilities come from the model at walk time.
//! * [`filter`] -- splits a coder's code into a skippable filter string
//!   and a minimal correction string.
//! * [`ribbon`] -- a banded `GF(2)` static function storing one
//!   variable-length bit string per key with constant-time lookup.
//! * [`lsf`] -- the build/query orchestrator composing the above.
//! * [`bits`] / [`hash`] -- bit-level I/O and keyed fingerprinting.
//! * [`reference_models`] -- in-memory `Model` fixtures used by tests.
//!
//! ## Example
//!
//! ```
//! use lsf::{build_lsf, Config};
//! use lsf::reference_models::FrequencyModel;
//!
//! let labels = vec![0u16, 1, 0, 2, 1, 0];
//! let mut model = FrequencyModel::new(3, &labels);
//! let keys: Vec<(u64, Vec<f32>, u16)> = labels
//!     .iter()
//!     .enumerate()
//!     .map(|(i, &y)| (i as u64, Vec::new(), y))
//!     .collect();
//!
//! let (built, _stats) = build_lsf(keys.into_iter(), 3, &mut model, &Config::STANDARD)
//!     .expect("build should succeed");
//!
//! for (i, &y) in labels.iter().enumerate() {
//!     let p = model.invoke(&[]).to_vec();
//!     assert_eq!(built.query(lsf::hash::fingerprint(Config::STANDARD.filter_seed, i as u64, &[]), &p), y);
//! }
//! ```

pub mod bits;
pub mod coder;
pub mod filter;
pub mod hash;
pub mod lsf;
pub mod reference_models;
pub mod ribbon;

pub use lsf::{build_lsf, Lsf, LsfStats};

/// Errors surfaced by this crate. No I/O happens inside the core (coder
/// and filter functions are total); `BuildFailed` comes from ribbon
/// construction, the rest from malformed inputs or a corrupt persisted
/// layout.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("coder produced a code longer than 63 bits (length {length})")]
    CodeTooLong { length: u16 },
    #[error("ribbon construction failed after {attempts} attempt(s)")]
    BuildFailed { attempts: u32 },
    #[error("probability vector is invalid (NaN, negative, or does not sum to ~1)")]
    InvalidProbabilities,
    #[error("probability vector has {got} entries, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("model produced different probabilities for the same key across build passes")]
    ModelNondeterministic,
    #[error("input truncated while parsing persisted layout")]
    Truncated,
    #[error("bad magic bytes in persisted layout")]
    BadMagic,
}

/// Build-time parameters with no single obviously-correct default,
/// bundled together behind one `STANDARD` constant rather than scattered
/// across function arguments.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Which built-in coder a build should use.
    pub coder_kind: coder::CoderKind,
    /// Seed for the filter ribbon's hash parameters.
    pub filter_seed: u64,
    /// Seed for the correction ribbon's hash parameters. Must differ from
    /// `filter_seed` so the two ribbons' hash dependencies don't
    /// correlate.
    pub correction_seed: u64,
    /// Cap on the number of filter bits a single level may allocate.
    pub k_max: u8,
    /// Ribbon overhead factor `f`; `rows = ceil(n / f) + band_width - 1`.
    pub slots_per_item: f32,
    /// Bounded retry budget for ribbon construction.
    pub max_build_attempts: u32,
}

impl Config {
    pub const STANDARD: Config = Config {
        coder_kind: coder::CoderKind::ArmedFano,
        filter_seed: 0x5EED_F17E_2024_0001,
        correction_seed: 0x5EED_F17E_2024_0002,
        k_max: 20,
        slots_per_item: 0.95,
        max_build_attempts: 32,
    };
}
