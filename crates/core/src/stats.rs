//! Per-stratum running statistics (C1) and the cross-round estimator (C6).

use std::collections::HashMap;

const OUTLIER_SIGMA_MULT: f64 = 2.0;
const VAR_FLOOR: f64 = 1e-4;
const VAR_FLOOR_SUBSTITUTE: f64 = 0.01;

/// Two-pass accumulator: a first pass over raw samples computes `avg`/`var`
/// used only to decide which samples are outliers; the kept samples feed a
/// second-pass `StratumStats` that downstream consumers actually read.
#[derive(Debug, Clone, Default)]
pub struct RawSamples {
    values: Vec<f64>,
}

impl RawSamples {
    pub fn push(&mut self, v: f64) {
        self.values.push(v);
    }

    fn first_pass(&self) -> Option<(f64, f64)> {
        if self.values.is_empty() {
            return None;
        }
        let n = self.values.len() as f64;
        let avg = self.values.iter().sum::<f64>() / n;
        if self.values.len() < 2 {
            return Some((avg, 0.0));
        }
        let var = self.values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (n - 1.0);
        Some((avg, var))
    }

    /// Reject samples with `|v - avg| >= 2*sqrt(var)` using the first-pass
    /// `avg`/`var`, then build a fresh [`StratumStats`] from the survivors.
    pub fn into_stratum_stats(self) -> StratumStats {
        let mut stats = StratumStats::default();
        let Some((avg, var)) = self.first_pass() else {
            return stats;
        };
        let sigma = var.sqrt();
        for v in self.values {
            if sigma > 0.0 && (v - avg).abs() >= OUTLIER_SIGMA_MULT * sigma {
                continue;
            }
            stats.add_value(v);
        }
        stats
    }
}

/// Per-stratum running stats: `count`, `sum_t`/`sumsq_t` (sufficient
/// statistics for per-record time), and `var_v` (variance of the reduced
/// value contributed in the most recent round, supplied externally by C6).
#[derive(Debug, Clone, Default)]
pub struct StratumStats {
    pub count: u64,
    pub sum_t: f64,
    pub sumsq_t: f64,
    pub var_v: f64,
}

impl StratumStats {
    pub fn add_value(&mut self, v: f64) {
        self.count += 1;
        self.sum_t += v;
        self.sumsq_t += v * v;
    }

    /// Computable only when `count >= 1`.
    pub fn avg_t(&self) -> Option<f64> {
        if self.count < 1 {
            return None;
        }
        Some(self.sum_t / self.count as f64)
    }

    /// Computable only when `count >= 2`.
    pub fn var_t(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        let n = self.count as f64;
        let mean = self.sum_t / n;
        let var = (self.sumsq_t - n * mean * mean) / (n - 1.0);
        Some(var.max(0.0))
    }
}

/// Apply the variance floor across every stratum's `var_v`: a stratum whose
/// `var_v < 1e-4` is substituted with the cross-stratum mean of positive
/// `var_v` values, or `0.01` if that mean is itself below the floor.
pub fn apply_variance_floor(stats: &mut HashMap<String, StratumStats>) {
    let positive_mean = {
        let positive: Vec<f64> = stats
            .values()
            .map(|s| s.var_v)
            .filter(|v| *v > 0.0)
            .collect();
        if positive.is_empty() {
            None
        } else {
            Some(positive.iter().sum::<f64>() / positive.len() as f64)
        }
    };

    for (stratum, s) in stats.iter_mut() {
        if s.var_v < VAR_FLOOR {
            let substitute = match positive_mean {
                Some(mean) if mean >= VAR_FLOOR => mean,
                _ => VAR_FLOOR_SUBSTITUTE,
            };
            tracing::debug!(stratum = %stratum, from = s.var_v, to = substitute, "applied var_v floor");
            s.var_v = substitute;
        }
    }
}

/// A reducer's contribution for one stratum in one round: `(value,
/// variance)`.
pub type ReduceResult = (f64, f64);

/// Final point estimate with its 95%-confidence half-width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub value: f64,
    pub error: f64,
}

/// Aggregates per-stratum reducer results into the stratified-sum estimate
/// and its 95% CI. `sampled_count(s)` is how many reducer results this
/// round contributed for stratum `s` (used in the variance denominator).
pub fn estimate(reduce_results: &HashMap<String, Vec<ReduceResult>>) -> Estimate {
    let mut sum = 0.0;
    let mut variance = 0.0;

    for results in reduce_results.values() {
        if results.is_empty() {
            continue;
        }
        let n = results.len() as f64;
        let mean_v = results.iter().map(|(v, _)| v).sum::<f64>() / n;
        let mean_var = results.iter().map(|(_, var)| var).sum::<f64>() / n;
        sum += mean_v;
        variance += mean_var / n;
    }

    Estimate {
        value: sum,
        error: 1.96 * variance.sqrt(),
    }
}
