//! Stratified sample selection (C3): uniform-per-stratum, proportional-to-σ,
//! and Metropolis–Hastings draws, under either a fixed-count or an
//! expected-time budget.

use crate::catalog::Catalog;
use crate::config::SamplingStrategy;
use crate::stats::StratumStats;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy)]
pub enum Budget {
    Count(usize),
    TimeMs(f64),
}

#[derive(Debug, Clone, Default)]
pub struct SampleSelection {
    pub paths: Vec<PathBuf>,
    pub total_bytes: u64,
}

/// Per-stratum distribution the previous round produced, as input to
/// Strategy B/C. Empty on round 1.
pub type Distribution = HashMap<String, StratumStats>;

pub struct Sampler;

impl Sampler {
    /// Strategy A — uniform-per-stratum (first round): every stratum gets
    /// `var_t := 1`, then falls through to Strategy B with `target =
    /// size_per_folder * |strata|`.
    pub fn draw_uniform(
        catalog: &Catalog,
        size_per_folder: usize,
        rng: &mut ChaCha8Rng,
    ) -> SampleSelection {
        let strata = catalog.strata();
        let uniform_distribution: Distribution = strata
            .iter()
            .map(|s| {
                (
                    s.clone(),
                    StratumStats {
                        var_v: 1.0,
                        ..Default::default()
                    },
                )
            })
            .collect();
        let target = size_per_folder * strata.len().max(1);
        draw_proportional(catalog, &uniform_distribution, Budget::Count(target), rng)
    }

    /// Strategy B — proportional-to-σ.
    pub fn draw_proportional(
        catalog: &Catalog,
        distribution: &Distribution,
        budget: Budget,
        rng: &mut ChaCha8Rng,
    ) -> SampleSelection {
        draw_proportional(catalog, distribution, budget, rng)
    }

    /// Strategy C — Metropolis–Hastings (default for rounds >= 2).
    pub fn draw_mh(
        catalog: &Catalog,
        distribution: &Distribution,
        budget: Budget,
        rng: &mut ChaCha8Rng,
    ) -> SampleSelection {
        draw_mh(catalog, distribution, budget, rng)
    }

    /// Dispatch on a configured [`SamplingStrategy`] — a polymorphic
    /// capability chosen by configuration, never by inspecting a runtime
    /// type.
    pub fn draw(
        catalog: &Catalog,
        distribution: &Distribution,
        budget: Budget,
        strategy: SamplingStrategy,
        rng: &mut ChaCha8Rng,
    ) -> SampleSelection {
        match strategy {
            SamplingStrategy::EqualPerFolder => {
                // Equal weight per stratum, whatever the budget's actual
                // magnitude (count or time) -- unlike `draw_uniform`, which
                // only knows how to translate a fixed per-folder count into
                // a budget, this has to honor a `Budget::TimeMs` as-is so a
                // round >= 2 under this policy isn't silently capped at one
                // file per stratum.
                let uniform_distribution: Distribution = catalog
                    .strata()
                    .into_iter()
                    .map(|s| {
                        // Keep each stratum's measured `avg_t` (needed to
                        // track accumulated time against a `Budget::TimeMs`)
                        // but flatten `var_v` to 1 so every stratum gets an
                        // equal quota regardless of its measured variance.
                        let stats = distribution.get(&s).cloned().unwrap_or_default();
                        (
                            s,
                            StratumStats {
                                var_v: 1.0,
                                ..stats
                            },
                        )
                    })
                    .collect();
                draw_proportional(catalog, &uniform_distribution, budget, rng)
            }
            SamplingStrategy::Proportional => {
                Self::draw_proportional(catalog, distribution, budget, rng)
            }
            SamplingStrategy::MetropolisHastings => Self::draw_mh(catalog, distribution, budget, rng),
        }
    }
}

fn budget_target_count(catalog: &Catalog, budget: Budget) -> usize {
    match budget {
        Budget::Count(n) => n,
        // A count upper bound for the rejection caps when running in
        // time-budget mode; actual exit is driven by the accumulated time.
        Budget::TimeMs(_) => catalog.len(),
    }
}

fn budget_exhausted(
    budget: Budget,
    accepted: usize,
    accumulated_time_ms: f64,
) -> bool {
    match budget {
        Budget::Count(n) => accepted >= n,
        Budget::TimeMs(t) => accumulated_time_ms >= t,
    }
}

fn sqrt_weights(distribution: &Distribution) -> HashMap<String, f64> {
    distribution
        .iter()
        .map(|(s, stats)| (s.clone(), stats.var_v.max(0.0).sqrt()))
        .collect()
}

fn quotas(distribution: &Distribution, target: f64) -> HashMap<String, f64> {
    let weights = sqrt_weights(distribution);
    let total: f64 = weights.values().sum();
    if total <= 0.0 {
        let n = weights.len().max(1) as f64;
        return weights.keys().map(|s| (s.clone(), target / n)).collect();
    }
    weights
        .into_iter()
        .map(|(s, w)| (s, target * w / total))
        .collect()
}

fn draw_proportional(
    catalog: &Catalog,
    distribution: &Distribution,
    budget: Budget,
    rng: &mut ChaCha8Rng,
) -> SampleSelection {
    let by_stratum = catalog.by_stratum();
    if by_stratum.is_empty() {
        return SampleSelection::default();
    }

    let target_count = budget_target_count(catalog, budget);
    let mut remaining_quota = quotas(distribution, target_count as f64);

    let mut selected = Vec::new();
    let mut total_bytes = 0u64;
    let mut accumulated_time_ms = 0.0;
    let mut rejections = 0usize;
    let soft_accept_after = 5 * target_count.max(1);
    let terminate_after = 10 * target_count.max(1);

    while !budget_exhausted(budget, selected.len(), accumulated_time_ms) {
        if selected.is_empty() && catalog.is_empty() {
            break;
        }
        let idx = rng.random_range(0..catalog.len());
        let file = &catalog.files[idx];
        let stratum = file.stratum();

        let quota = remaining_quota.get(&stratum).copied().unwrap_or(0.0);
        let force_accept = rejections > soft_accept_after && distribution.contains_key(&stratum);

        if quota >= 1.0 || force_accept {
            if let Some(q) = remaining_quota.get_mut(&stratum) {
                *q -= 1.0;
            }
            selected.push(file.clone());
            total_bytes += file.size_bytes;
            if let Some(avg) = distribution.get(&stratum).and_then(|s| s.avg_t()) {
                accumulated_time_ms += avg;
            }
            rejections = 0;
        } else {
            rejections += 1;
            if rejections > terminate_after {
                tracing::warn!(
                    rejections,
                    "sampler starvation: terminating early with a short selection"
                );
                break;
            }
        }
    }

    SampleSelection {
        paths: selected.into_iter().map(|f| f.path).collect(),
        total_bytes,
    }
}

fn draw_mh(
    catalog: &Catalog,
    distribution: &Distribution,
    budget: Budget,
    rng: &mut ChaCha8Rng,
) -> SampleSelection {
    if catalog.is_empty() || distribution.is_empty() {
        return draw_proportional(catalog, distribution, budget, rng);
    }

    let by_stratum = catalog.by_stratum();
    let known_strata: Vec<String> = distribution.keys().cloned().collect();
    let target_count = budget_target_count(catalog, budget);
    let soft_accept_after = 5 * target_count.max(1);
    let terminate_after = 10 * target_count.max(1);

    let mut selected = Vec::new();
    let mut total_bytes = 0u64;
    let mut accumulated_time_ms = 0.0;
    let mut rejections = 0usize;
    let mut cur: Option<String> = None;
    let mut next_variable: Option<String> = None;

    while !budget_exhausted(budget, selected.len(), accumulated_time_ms) {
        let idx = rng.random_range(0..catalog.len());
        let file = &catalog.files[idx];
        let nxt = file.stratum();

        let accept = match &next_variable {
            None => true,
            Some(target) => target == &nxt,
        };

        if !accept {
            rejections += 1;
            if rejections > terminate_after {
                tracing::warn!(
                    rejections,
                    "sampler starvation: terminating MH draw early"
                );
                break;
            }
            if rejections > soft_accept_after && by_stratum.contains_key(&nxt) {
                // fall through to accept anyway
            } else {
                continue;
            }
        }
        rejections = 0;

        selected.push(file.clone());
        total_bytes += file.size_bytes;
        if let Some(avg) = distribution.get(&nxt).and_then(|s| s.avg_t()) {
            accumulated_time_ms += avg;
        }
        cur = Some(nxt.clone());

        // Propose a new `next_variable`.
        if !known_strata.is_empty() {
            let y = known_strata[rng.random_range(0..known_strata.len())].clone();
            let lambda = mh_acceptance_ratio(distribution, cur.as_deref().unwrap(), &y);
            if rng.random::<f64>() < lambda.min(1.0) {
                next_variable = Some(y);
            } else {
                next_variable = cur.clone();
            }
        }
    }

    SampleSelection {
        paths: selected.into_iter().map(|f| f.path).collect(),
        total_bytes,
    }
}

/// `λ = sqrt( α_y·β_cur / (β_y·(α_cur − 1)) )`, guarded against the
/// undefined case where `count_cur <= 2` makes `α_cur - 1 <= -0.5`: per the
/// recommended fix, fall back to always accepting (`λ = 1`).
fn mh_acceptance_ratio(distribution: &Distribution, cur: &str, y: &str) -> f64 {
    let (Some(cur_stats), Some(y_stats)) = (distribution.get(cur), distribution.get(y)) else {
        return 1.0;
    };
    if cur_stats.count <= 2 {
        return 1.0;
    }
    let alpha = |count: u64| (count as f64 - 1.0) / 2.0;
    let beta = |count: u64, var: f64| {
        if var <= 0.0 {
            return 0.0;
        }
        (count as f64 - 1.0) / (2.0 * var)
    };

    let alpha_cur = alpha(cur_stats.count);
    let alpha_y = alpha(y_stats.count);
    let beta_cur = beta(cur_stats.count, cur_stats.var_v);
    let beta_y = beta(y_stats.count, y_stats.var_v);

    let denom = beta_y * (alpha_cur - 1.0);
    if denom <= 0.0 || beta_y == 0.0 {
        return 1.0;
    }
    let ratio = (alpha_y * beta_cur) / denom;
    if ratio <= 0.0 {
        return 1.0;
    }
    ratio.sqrt()
}
