//! Typed configuration, mirroring the named options table.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    MetropolisHastings,
    Proportional,
    EqualPerFolder,
}

impl Default for SamplingStrategy {
    fn default() -> Self {
        SamplingStrategy::MetropolisHastings
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub deadline_seconds: u64,
    pub size_per_folder: u32,
    pub sample_time_pctg: f64,
    pub policy: SamplingStrategy,
    pub ground_truth: bool,
    pub filter_start_hour: u8,
    pub filter_end_hour: u8,
    pub print_empty_folder: bool,
    pub max_maps_per_node: u32,
    pub datanodes: u32,
    pub stats_server_port: Option<u16>,
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            deadline_seconds: 120,
            size_per_folder: 30,
            sample_time_pctg: 0.30,
            policy: SamplingStrategy::MetropolisHastings,
            ground_truth: false,
            filter_start_hour: 10,
            filter_end_hour: 16,
            print_empty_folder: false,
            max_maps_per_node: 2,
            datanodes: 1,
            stats_server_port: None,
            seed: 0,
        }
    }
}

impl Config {
    /// `P = datanodes * max_maps_per_node`; `P <= 0` is a fatal
    /// [`crate::error::ControllerError::Configuration`] at INIT.
    pub fn parallel_slots(&self) -> u64 {
        self.datanodes as u64 * self.max_maps_per_node as u64
    }

    pub fn validate(&self) -> Result<(), crate::error::ControllerError> {
        if self.parallel_slots() == 0 {
            return Err(crate::error::ControllerError::Configuration(
                "datanodes * max_maps_per_node must be > 0".to_string(),
            ));
        }
        if self.deadline_seconds == 0 {
            return Err(crate::error::ControllerError::Configuration(
                "deadline_seconds must be > 0".to_string(),
            ));
        }
        if self.size_per_folder == 0 {
            return Err(crate::error::ControllerError::Configuration(
                "size_per_folder must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sample_time_pctg) {
            return Err(crate::error::ControllerError::Configuration(
                "sample_time_pctg must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_spec_table() {
        let c = Config::default();
        assert_eq!(c.deadline_seconds, 120);
        assert_eq!(c.size_per_folder, 30);
        assert_eq!(c.sample_time_pctg, 0.30);
        assert_eq!(c.policy, SamplingStrategy::MetropolisHastings);
        assert_eq!(c.max_maps_per_node, 2);
    }

    #[test]
    fn zero_parallel_slots_is_a_configuration_error() {
        let mut c = Config {
            datanodes: 0,
            ..Config::default()
        };
        c.max_maps_per_node = 4;
        assert!(c.validate().is_err());
    }

    #[test]
    fn valid_config_passes() {
        let c = Config {
            datanodes: 4,
            ..Config::default()
        };
        assert!(c.validate().is_ok());
    }
}
