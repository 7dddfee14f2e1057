//! Thread-safe ingestion of per-round stats, plus the stats ingestion
//! server workers push into.
//!
//! The three round-scoped collections (timing samples, reduce results,
//! task times) live behind one mutex, matching the "one mutex for all
//! three" option: the Controller always reads and clears them together at
//! a round boundary, so splitting the lock would buy nothing.

use crate::stats::ReduceResult;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct RoundAggregates {
    pub ev_stats: Vec<(String, f64)>,
    pub reduce_results: HashMap<String, Vec<ReduceResult>>,
    pub mapper_times: Vec<(u64, u64)>,
    pub reducer_times: Vec<(u64, u64)>,
}

impl RoundAggregates {
    fn is_empty(&self) -> bool {
        self.ev_stats.is_empty()
            && self.reduce_results.is_empty()
            && self.mapper_times.is_empty()
            && self.reducer_times.is_empty()
    }
}

/// Ingestion endpoint shapes from workers. A malformed or empty submission
/// is logged and dropped (`StatsIngestError`, recovered locally — it never
/// reaches [`crate::error::ControllerError`]).
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestMessage {
    AddTime {
        stratum: String,
        #[allow(dead_code)]
        record_key: String,
        micros: f64,
    },
    AddReduce {
        strata: Vec<String>,
        values: Vec<f64>,
        variances: Vec<f64>,
    },
    AddMapperTime {
        start_ms: u64,
        duration_ms: u64,
    },
    AddReducerTime {
        start_ms: u64,
        duration_ms: u64,
    },
}

#[derive(Default)]
pub struct StatsCollector {
    inner: Mutex<RoundAggregates>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_time(&self, stratum: &str, micros: f64) {
        if stratum.is_empty() {
            tracing::warn!("dropping timing sample with empty stratum");
            return;
        }
        let mut guard = self.inner.lock().expect("stats mutex poisoned");
        guard.ev_stats.push((stratum.to_string(), micros));
    }

    pub fn add_reduce(&self, strata: &[String], values: &[f64], variances: &[f64]) {
        if strata.is_empty() || strata.len() != values.len() || values.len() != variances.len() {
            tracing::warn!(
                strata = strata.len(),
                values = values.len(),
                variances = variances.len(),
                "dropping malformed ADD_REDUCE submission"
            );
            return;
        }
        let mut guard = self.inner.lock().expect("stats mutex poisoned");
        for ((s, v), var) in strata.iter().zip(values).zip(variances) {
            guard
                .reduce_results
                .entry(s.clone())
                .or_default()
                .push((*v, *var));
        }
    }

    pub fn add_mapper_time(&self, start_ms: u64, duration_ms: u64) {
        let mut guard = self.inner.lock().expect("stats mutex poisoned");
        guard.mapper_times.push((start_ms, duration_ms));
    }

    pub fn add_reducer_time(&self, start_ms: u64, duration_ms: u64) {
        let mut guard = self.inner.lock().expect("stats mutex poisoned");
        guard.reducer_times.push((start_ms, duration_ms));
    }

    pub fn ingest(&self, message: IngestMessage) {
        match message {
            IngestMessage::AddTime {
                stratum, micros, ..
            } => self.add_time(&stratum, micros),
            IngestMessage::AddReduce {
                strata,
                values,
                variances,
            } => self.add_reduce(&strata, &values, &variances),
            IngestMessage::AddMapperTime {
                start_ms,
                duration_ms,
            } => self.add_mapper_time(start_ms, duration_ms),
            IngestMessage::AddReducerTime {
                start_ms,
                duration_ms,
            } => self.add_reducer_time(start_ms, duration_ms),
        }
    }

    /// Read, snapshot, then clear the round-scoped collections. This is the
    /// Controller's side of the happens-before boundary: it must only be
    /// called after blocking on round completion.
    pub fn snapshot_and_clear(&self) -> RoundAggregates {
        let mut guard = self.inner.lock().expect("stats mutex poisoned");
        if guard.is_empty() {
            tracing::warn!("round produced no stats (SamplerStarvation or an empty worker response)");
        }
        std::mem::take(&mut *guard)
    }
}

/// The stats ingestion server: one `tiny_http` listener per `Controller`,
/// bound to a randomized port, parsing newline-delimited JSON
/// [`IngestMessage`] bodies from worker connections.
pub struct StatsServer {
    port: u16,
    handle: Option<std::thread::JoinHandle<()>>,
}

const STATS_PORT_RANGE: std::ops::Range<u16> = 10593..11593;

impl StatsServer {
    /// Start a server bound to `port`, or to a randomized port in
    /// `[10593, 11593)` if `port` is `None`.
    pub fn start(collector: std::sync::Arc<StatsCollector>, port: Option<u16>) -> Option<Self> {
        let candidates: Vec<u16> = match port {
            Some(p) => vec![p],
            None => STATS_PORT_RANGE.collect(),
        };

        for candidate in candidates {
            let addr = format!("127.0.0.1:{candidate}");
            match tiny_http::Server::http(&addr) {
                Ok(server) => {
                    tracing::info!(port = candidate, "stats ingestion server listening");
                    let handle = std::thread::spawn(move || serve(server, collector));
                    return Some(Self {
                        port: candidate,
                        handle: Some(handle),
                    });
                }
                Err(_) => continue,
            }
        }
        tracing::warn!("failed to bind stats ingestion server to any candidate port");
        None
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        // tiny_http has no explicit shutdown hook reachable from here; the
        // listener thread is detached and exits with the process, matching
        // the "no teardown semantics required" lifecycle.
        if let Some(handle) = self.handle.take() {
            drop(handle);
        }
    }
}

fn serve(server: tiny_http::Server, collector: std::sync::Arc<StatsCollector>) {
    for mut request in server.incoming_requests() {
        let mut body = String::new();
        if request.as_reader().read_to_string(&mut body).is_err() {
            let _ = request.respond(tiny_http::Response::empty(400));
            continue;
        }
        match serde_json::from_str::<IngestMessage>(&body) {
            Ok(message) => {
                collector.ingest(message);
                let _ = request.respond(tiny_http::Response::empty(204));
            }
            Err(err) => {
                tracing::warn!(error = %err, "dropping unparseable stats submission");
                let _ = request.respond(tiny_http::Response::empty(400));
            }
        }
    }
}
