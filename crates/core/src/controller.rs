//! The deadline state machine (C5): INIT → ROUND(r) → FINAL.
//!
//! The Controller owns the deadline, the round counter, and the
//! distribution handed to the [`crate::sampler::Sampler`]. Everything that
//! talks to the outside world is behind the [`RoundRuntime`] and
//! [`InputCatalog`] traits so the real distributed runtime and a test fake
//! share the same call site.

use crate::catalog::Catalog;
use crate::collector::{RoundAggregates, StatsCollector, StatsServer};
use crate::config::Config;
use crate::error::ControllerError;
use crate::planner::{Planner, PlannerDecision, PlannerInput};
use crate::rng::new_rng;
use crate::sampler::{Budget, Distribution, SampleSelection, Sampler};
use crate::stats::{self, Estimate, RawSamples, ReduceResult};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What the Controller learns once a round's external job finishes.
#[derive(Debug, Clone, Copy)]
pub struct RoundReport {
    pub wall_time_ms: f64,
    pub avg_record_time_ms: f64,
    pub samples_processed: u64,
}

/// The external collaborator that actually runs a round on the cluster.
/// `submit_round` blocks until the round completes.
pub trait RoundRuntime {
    fn submit_round(
        &self,
        inputs: &[PathBuf],
        output_dir: &Path,
        split_size_bytes: u64,
        overrides: &HashMap<String, String>,
    ) -> Result<RoundReport, ControllerError>;
}

/// How the input catalog is obtained is out of scope; the controller only
/// needs the file list.
pub trait InputCatalog {
    fn files(&self) -> Catalog;
}

impl InputCatalog for Catalog {
    fn files(&self) -> Catalog {
        self.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunReport {
    pub estimate: Estimate,
    pub rounds_run: u32,
    /// `now - deadline` at the moment the loop exited, in milliseconds.
    /// Positive means the run overran; this is informational, not an error.
    pub deadline_overrun_ms: i64,
}

pub struct Controller<R: RoundRuntime> {
    config: Config,
    runtime: R,
    base_output_dir: PathBuf,
    collector: Arc<StatsCollector>,
    _stats_server: Option<StatsServer>,
    /// Explicit controller-owned state for the "don't report empty
    /// folders after round 1" behavior, instead of mutating global config.
    report_empty_strata: bool,
    deadline: Instant,
    run_count: u32,
    rng: ChaCha8Rng,
    distribution: Distribution,
    accumulated_reduce: HashMap<String, Vec<ReduceResult>>,
    last_round_wall_time_ms: f64,
    last_avg_record_time_ms: f64,
    last_samples_processed: u64,
}

impl<R: RoundRuntime> Controller<R> {
    /// `runtime_factory` receives the collector the controller's stats
    /// ingestion server writes into (for a runtime that pushes in-process)
    /// and the port that server bound to, `0` if it failed to bind (for a
    /// runtime that pushes over HTTP, e.g. an external worker process).
    pub fn new<F>(
        config: Config,
        runtime_factory: F,
        base_output_dir: impl Into<PathBuf>,
    ) -> Result<Self, ControllerError>
    where
        F: FnOnce(Arc<StatsCollector>, u16) -> R,
    {
        config.validate()?;
        let collector = Arc::new(StatsCollector::new());
        let stats_server = StatsServer::start(collector.clone(), config.stats_server_port);
        let port = stats_server.as_ref().map(|s| s.port()).unwrap_or(0);
        let runtime = runtime_factory(collector.clone(), port);
        let rng = new_rng(config.seed);
        let report_empty_strata = config.print_empty_folder;
        Ok(Self {
            deadline: Instant::now() + Duration::from_secs(config.deadline_seconds),
            report_empty_strata,
            config,
            runtime,
            base_output_dir: base_output_dir.into(),
            collector,
            _stats_server: stats_server,
            run_count: 0,
            rng,
            distribution: Distribution::new(),
            accumulated_reduce: HashMap::new(),
            last_round_wall_time_ms: 0.0,
            last_avg_record_time_ms: 0.0,
            last_samples_processed: 0,
        })
    }

    pub fn stats_collector(&self) -> Arc<StatsCollector> {
        self.collector.clone()
    }

    fn remaining_ms(&self) -> f64 {
        self.deadline
            .checked_duration_since(Instant::now())
            .map(|d| d.as_millis() as f64)
            .unwrap_or(0.0)
    }

    fn output_dir(&self, round_index: u32) -> PathBuf {
        let mut dir = self.base_output_dir.clone();
        let file_name = dir
            .file_name()
            .map(|n| format!("{}_{round_index}", n.to_string_lossy()))
            .unwrap_or_else(|| format!("round_{round_index}"));
        dir.set_file_name(file_name);
        dir
    }

    fn config_overrides(&self) -> HashMap<String, String> {
        let mut overrides = HashMap::new();
        overrides.insert(
            "filter.startTimeOfDay".to_string(),
            self.config.filter_start_hour.to_string(),
        );
        overrides.insert(
            "filter.endTimeOfDay".to_string(),
            self.config.filter_end_hour.to_string(),
        );
        overrides.insert(
            "sample.printEmptyFolder".to_string(),
            self.report_empty_strata.to_string(),
        );
        overrides
    }

    pub fn run<C: InputCatalog>(&mut self, catalog_source: &C) -> Result<RunReport, ControllerError> {
        let catalog = catalog_source.files();
        self.run_with_catalog(&catalog)
    }

    #[tracing::instrument(skip(self, catalog))]
    fn run_with_catalog(&mut self, catalog: &Catalog) -> Result<RunReport, ControllerError> {
        if self.config.ground_truth {
            self.run_round_1(catalog)?;
            return Ok(self.finalize());
        }

        self.run_round_1(catalog)?;

        loop {
            if Instant::now() >= self.deadline {
                break;
            }

            let input = self.planner_input();

            // The loop's stop gate is `next_n <= 0`, independent of whichever
            // time-budget value round 2 / round >= 3 hands the sampler.
            if matches!(Planner::next_count(&input), PlannerDecision::Stop) {
                tracing::info!("planner signaled next_n <= 0, stopping");
                break;
            }

            let decision = if self.run_count == 1 {
                Planner::round_two_time_budget(&input, self.config.sample_time_pctg)
            } else {
                Planner::later_round_time_budget(&input)
            };

            let budget: Option<Budget> = decision.into();
            let Some(budget) = budget else {
                tracing::info!("planner signaled infeasible next round, stopping");
                break;
            };

            let selection = Sampler::draw(
                catalog,
                &self.distribution,
                budget,
                self.config.policy,
                &mut self.rng,
            );
            if selection.paths.is_empty() {
                tracing::warn!("sampler returned an empty selection, stopping");
                break;
            }

            self.run_round(&selection)?;
        }

        Ok(self.finalize())
    }

    fn planner_input(&self) -> PlannerInput {
        PlannerInput {
            round_wall_time_ms: self.last_round_wall_time_ms,
            avg_record_time_ms: self.last_avg_record_time_ms,
            samples_processed: self.last_samples_processed,
            parallel_slots: self.config.parallel_slots(),
            remaining_ms: self.remaining_ms(),
        }
    }

    fn run_round_1(&mut self, catalog: &Catalog) -> Result<(), ControllerError> {
        let selection =
            Sampler::draw_uniform(catalog, self.config.size_per_folder as usize, &mut self.rng);
        self.run_round(&selection)
    }

    fn run_round(&mut self, selection: &SampleSelection) -> Result<(), ControllerError> {
        let round_index = self.run_count + 1;
        let output_dir = self.output_dir(round_index);
        let overrides = self.config_overrides();

        let report = self.runtime.submit_round(
            &selection.paths,
            &output_dir,
            selection.total_bytes,
            &overrides,
        )?;

        self.run_count = round_index;
        self.last_round_wall_time_ms = report.wall_time_ms;
        self.last_avg_record_time_ms = report.avg_record_time_ms;
        self.last_samples_processed = report.samples_processed;
        if self.run_count == 1 {
            self.report_empty_strata = false;
        }

        let aggregates = self.collector.snapshot_and_clear();
        self.harvest(aggregates);
        Ok(())
    }

    /// Build this round's `Distribution` from raw timing samples (outlier
    /// filter applied per stratum), merge reduce results into the
    /// cross-round accumulator, and apply the variance floor.
    fn harvest(&mut self, aggregates: RoundAggregates) {
        let mut raw: HashMap<String, RawSamples> = HashMap::new();
        for (stratum, micros) in aggregates.ev_stats {
            raw.entry(stratum).or_default().push(micros / 1000.0);
        }

        let mut distribution: Distribution = raw
            .into_iter()
            .map(|(stratum, samples)| (stratum, samples.into_stratum_stats()))
            .collect();

        for (stratum, results) in &aggregates.reduce_results {
            if results.is_empty() {
                continue;
            }
            let mean_var =
                results.iter().map(|(_, var)| var).sum::<f64>() / results.len() as f64;
            distribution.entry(stratum.clone()).or_default().var_v = mean_var;
        }

        if self.report_empty_strata {
            for stratum in self.distribution.keys() {
                if !distribution.contains_key(stratum) {
                    tracing::info!(stratum = %stratum, "stratum produced zero contribution this round");
                }
            }
        }

        stats::apply_variance_floor(&mut distribution);
        self.distribution = distribution;

        for (stratum, results) in aggregates.reduce_results {
            self.accumulated_reduce
                .entry(stratum)
                .or_default()
                .extend(results);
        }
    }

    fn finalize(&self) -> RunReport {
        let estimate = stats::estimate(&self.accumulated_reduce);
        let overrun_ms = Instant::now()
            .checked_duration_since(self.deadline)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_else(|| {
                -(self
                    .deadline
                    .checked_duration_since(Instant::now())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0))
            });
        tracing::info!(
            "RESULT ESTIMATION: sum(avg(Loc)) = {} \u{00b1} {} (95% confidence)",
            estimate.value,
            estimate.error
        );
        RunReport {
            estimate,
            rounds_run: self.run_count,
            deadline_overrun_ms: overrun_ms,
        }
    }
}
