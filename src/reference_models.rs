//! In-memory reference implementations of [`Model`], used only by tests
//! and doctests to exercise the build/query pipeline end to end. Real
//! consumers may implement `Model` however they like, including wrapping
//! an external TFLite runtime -- this crate never depends on one.

/// The interface the core retrieval pipeline requires from a model.
///
/// `invoke` takes `&mut self` (not `&self`) because a real model may keep
/// a reused scratch output buffer, the way the reference implementations
/// here do; callers must treat the returned slice as valid only until the
/// next `invoke` call.
pub trait Model {
    /// Returns the probability distribution over `[0, classes())` for
    /// `features`. Must be deterministic: the same `features` must
    /// produce the same distribution on every call, including across a
    /// build's two encoding passes.
    fn invoke(&mut self, features: &[f32]) -> &[f32];

    fn classes(&self) -> usize;

    /// Approximate serialized size of the model itself, for size
    /// reporting alongside the ribbons (`LsfStats::model_bytes`).
    fn model_bytes(&self) -> usize;
}

/// Ignores features entirely; always returns the marginal label-frequency
/// distribution observed at construction. Degenerate by design -- useful
/// for exercising the "uniform-ish model" scenarios, not a real predictor.
#[derive(Debug, Clone)]
pub struct FrequencyModel {
    probs: Vec<f32>,
}

impl FrequencyModel {
    pub fn new(classes: usize, labels: &[u16]) -> Self {
        let mut counts = vec![0u64; classes];
        for &y in labels {
            counts[y as usize] += 1;
        }
        let total: u64 = counts.iter().sum();
        let probs = if total == 0 {
            vec![1.0 / classes as f32; classes]
        } else {
            counts.iter().map(|&c| c as f32 / total as f32).collect()
        };
        FrequencyModel { probs }
    }
}

impl Model for FrequencyModel {
    fn invoke(&mut self, _features: &[f32]) -> &[f32] {
        &self.probs
    }

    fn classes(&self) -> usize {
        self.probs.len()
    }

    fn model_bytes(&self) -> usize {
        self.probs.len() * std::mem::size_of::<f32>()
    }
}

/// Welford's online mean/variance accumulator.
#[derive(Debug, Clone, Copy, Default)]
struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    fn variance(&self) -> f64 {
        if self.count < 2 {
            // No spread observed yet; a unit floor keeps the density
            // finite instead of dividing by zero.
            1.0
        } else {
            (self.m2 / (self.count - 1) as f64).max(1e-9)
        }
    }

    fn log_density(&self, x: f64) -> f64 {
        let var = self.variance();
        let diff = x - self.mean;
        -0.5 * (diff * diff / var + var.ln() + (2.0 * std::f64::consts::PI).ln())
    }
}

/// One 1-D Gaussian per `(class, feature dimension)`, combined under the
/// naive-Bayes conditional-independence assumption. Fit incrementally via
/// Welford's algorithm.
#[derive(Debug, Clone)]
pub struct GaussianNaiveBayesModel {
    classes: usize,
    dims: usize,
    stats: Vec<Vec<RunningStats>>,
    class_counts: Vec<u64>,
    scratch: Vec<f32>,
}

impl GaussianNaiveBayesModel {
    pub fn new(classes: usize, dims: usize) -> Self {
        GaussianNaiveBayesModel {
            classes,
            dims,
            stats: vec![vec![RunningStats::default(); dims]; classes],
            class_counts: vec![0u64; classes],
            scratch: vec![0.0f32; classes],
        }
    }

    /// Incorporates one `(features, label)` training pair.
    pub fn observe(&mut self, features: &[f32], label: u16) {
        debug_assert_eq!(features.len(), self.dims);
        let class = label as usize;
        self.class_counts[class] += 1;
        for (dim, &x) in features.iter().enumerate() {
            self.stats[class][dim].push(x as f64);
        }
    }

    pub fn fit(classes: usize, dims: usize, rows: impl IntoIterator<Item = (Vec<f32>, u16)>) -> Self {
        let mut model = Self::new(classes, dims);
        for (features, label) in rows {
            model.observe(&features, label);
        }
        model
    }
}

impl Model for GaussianNaiveBayesModel {
    fn invoke(&mut self, features: &[f32]) -> &[f32] {
        let total: u64 = self.class_counts.iter().sum();
        let mut log_probs = vec![0.0f64; self.classes];
        for class in 0..self.classes {
            let prior = if total == 0 {
                1.0 / self.classes as f64
            } else {
                (self.class_counts[class] as f64 + 1.0) / (total as f64 + self.classes as f64)
            };
            let mut log_p = prior.ln();
            for (dim, &x) in features.iter().enumerate() {
                log_p += self.stats[class][dim].log_density(x as f64);
            }
            log_probs[class] = log_p;
        }
        let max_log = log_probs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut sum = 0.0f64;
        for lp in log_probs.iter_mut() {
            *lp = (*lp - max_log).exp();
            sum += *lp;
        }
        for (i, &lp) in log_probs.iter().enumerate() {
            self.scratch[i] = (lp / sum) as f32;
        }
        log::trace!("gaussian model invoked over {} dims -> {:?}", features.len(), self.scratch);
        &self.scratch
    }

    fn classes(&self) -> usize {
        self.classes
    }

    fn model_bytes(&self) -> usize {
        self.classes * self.dims * std::mem::size_of::<f64>() * 2
    }
}
