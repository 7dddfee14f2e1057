//! Adaptive sampling controller for deadline-bound approximate batch queries.
//!
//! The crate's surface mirrors the six components of the design: a
//! [`stats`] model per stratum, a concurrent [`collector`], a [`sampler`]
//! with three draw strategies, a [`planner`] that sizes each round from
//! measured overhead, and a [`controller`] that ties the loop together and
//! hands back an [`stats::Estimate`].
//!
//! Everything that talks to the outside world — launching a round on the
//! cluster, reading the input catalog — is an injected trait
//! ([`controller::RoundRuntime`], [`controller::InputCatalog`]); this crate
//! never touches the network or the filesystem for those concerns itself.

pub mod catalog;
pub mod collector;
pub mod config;
pub mod controller;
pub mod error;
pub mod planner;
pub mod rng;
pub mod sampler;
pub mod stats;

#[cfg(test)]
mod tests;
