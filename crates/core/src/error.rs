//! Error kinds the controller can surface to its caller.
//!
//! Per the failure semantics: configuration and round-submission failures
//! are fatal and propagate out of [`crate::controller::Controller::run`].
//! Stats-ingest malformations and sampler starvation are recovered locally
//! (logged at `warn` where they occur) and never reach this enum — see
//! [`crate::collector::StatsCollector`] and [`crate::sampler::Sampler`].

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("round submission failed: {0}")]
    RoundSubmission(String),
}
