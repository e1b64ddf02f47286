//! Model configuration, loaded from JSON and validated before a model is
//! built.

use crate::equilibrium::AdjointMode;
use crate::solvers::SolverSettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Points at which a group norm may be inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NormLocation {
    /// After the input projection.
    #[serde(rename = "in")]
    In,
    /// After the first feed-forward layer, before the activation.
    #[serde(rename = "fork_1")]
    Fork1,
    /// After the second feed-forward layer.
    #[serde(rename = "fork_2")]
    Fork2,
    /// After the residual addition.
    #[serde(rename = "fork_3")]
    Fork3,
    /// After the per-mode complex mix, on each retained frequency band.
    #[serde(rename = "fourier")]
    Fourier,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormLocations(BTreeSet<NormLocation>);

impl NormLocations {
    pub fn contains(&self, loc: NormLocation) -> bool {
        self.0.contains(&loc)
    }

    pub fn iter(&self) -> impl Iterator<Item = NormLocation> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<NormLocation> for NormLocations {
    fn from_iter<I: IntoIterator<Item = NormLocation>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{location:?} normalisation needs a multiple of group_size {group_size} channels, got {channels}")]
    NormGroups {
        location: NormLocation,
        channels: usize,
        group_size: usize,
    },
    #[error("{solver} solver tolerance must be positive, got {tolerance}")]
    Tolerance { solver: &'static str, tolerance: f64 },
    #[error("{solver} solver mixing must lie in (0, 1], got {mixing}")]
    Mixing { solver: &'static str, mixing: f64 },
    #[error("invalid model configuration: {0}")]
    Parse(String),
}

fn default_factor() -> usize {
    2
}

fn default_group_size() -> usize {
    16
}

fn default_head_width() -> usize {
    128
}

/// Hyperparameters of [`crate::model::FourierDeqNet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Channels of the raw input field.
    pub input_dim: usize,
    /// Latent channel count.
    pub width: usize,
    /// Retained Fourier modes per axis and band.
    pub n_modes: usize,
    /// Operator applications while unrolled.
    pub n_layers: usize,
    /// Global step at which the block switches to equilibrium solving.
    pub pretraining_steps: u64,
    #[serde(default)]
    pub norm_locs: NormLocations,
    /// Hidden expansion ratio of the feed-forward sub-networks.
    #[serde(default = "default_factor")]
    pub factor: usize,
    /// Channels per normalisation group.
    #[serde(default = "default_group_size")]
    pub group_size: usize,
    /// Hidden width of the output head.
    #[serde(default = "default_head_width")]
    pub head_width: usize,
    #[serde(default)]
    pub forward_solver: SolverSettings,
    #[serde(default)]
    pub backward_solver: SolverSettings,
    #[serde(default)]
    pub adjoint: AdjointMode,
}

impl ModelConfig {
    pub fn new(input_dim: usize, width: usize, n_modes: usize) -> Self {
        Self {
            input_dim,
            width,
            n_modes,
            n_layers: 1,
            pretraining_steps: 0,
            norm_locs: NormLocations::default(),
            factor: default_factor(),
            group_size: default_group_size(),
            head_width: default_head_width(),
            forward_solver: SolverSettings::default(),
            backward_solver: SolverSettings::default(),
            adjoint: AdjointMode::default(),
        }
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("input_dim", self.input_dim),
            ("width", self.width),
            ("n_modes", self.n_modes),
            ("factor", self.factor),
            ("group_size", self.group_size),
            ("head_width", self.head_width),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        for location in self.norm_locs.iter() {
            let channels = match location {
                NormLocation::Fork1 => self.width * self.factor,
                _ => self.width,
            };
            if channels < self.group_size || channels % self.group_size != 0 {
                return Err(ConfigError::NormGroups {
                    location,
                    channels,
                    group_size: self.group_size,
                });
            }
        }

        for (solver, settings) in [
            ("forward", &self.forward_solver),
            ("backward", &self.backward_solver),
        ] {
            validate_solver(solver, settings)?;
        }
        Ok(())
    }
}

fn validate_solver(solver: &'static str, settings: &SolverSettings) -> Result<(), ConfigError> {
    if !(settings.tolerance > 0.0) {
        return Err(ConfigError::Tolerance {
            solver,
            tolerance: settings.tolerance,
        });
    }
    if !(settings.mixing > 0.0 && settings.mixing <= 1.0) {
        return Err(ConfigError::Mixing {
            solver,
            mixing: settings.mixing,
        });
    }
    if settings.history == 0 {
        return Err(ConfigError::Zero(match solver {
            "forward" => "forward_solver.history",
            _ => "backward_solver.history",
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_norm_locations_and_defaults() {
        let config = ModelConfig::from_json_str(
            r#"{
                "input_dim": 3,
                "width": 32,
                "n_modes": 8,
                "n_layers": 4,
                "pretraining_steps": 100,
                "norm_locs": ["in", "fork_1", "fourier"]
            }"#,
        )
        .expect("config should parse");

        assert!(config.norm_locs.contains(NormLocation::In));
        assert!(config.norm_locs.contains(NormLocation::Fork1));
        assert!(config.norm_locs.contains(NormLocation::Fourier));
        assert!(!config.norm_locs.contains(NormLocation::Fork3));
        assert_eq!(config.factor, 2);
        assert_eq!(config.group_size, 16);
        assert_eq!(config.forward_solver.threshold, 30);
        assert_eq!(config.backward_solver.threshold, 30);
        assert_eq!(config.adjoint, AdjointMode::DiagonalProbe);
    }

    #[test]
    fn rejects_unknown_norm_location() {
        let err = ModelConfig::from_json_str(
            r#"{"input_dim": 3, "width": 16, "n_modes": 4, "n_layers": 1,
                "pretraining_steps": 0, "norm_locs": ["fork_4"]}"#,
        )
        .expect_err("unknown location should fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_width_not_divisible_into_groups() {
        let mut config = ModelConfig::new(3, 24, 4);
        config.norm_locs = NormLocations::from_iter([NormLocation::Fork2]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::NormGroups {
                location: NormLocation::Fork2,
                channels: 24,
                group_size: 16,
            })
        );

        config.norm_locs = NormLocations::default();
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_zero_sizes_and_bad_solver_settings() {
        let config = ModelConfig::new(3, 16, 0);
        assert_eq!(config.validate(), Err(ConfigError::Zero("n_modes")));

        let mut config = ModelConfig::new(3, 16, 4);
        config.backward_solver.tolerance = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Tolerance { solver: "backward", .. })
        ));

        let mut config = ModelConfig::new(3, 16, 4);
        config.forward_solver.mixing = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Mixing { solver: "forward", .. })
        ));
    }
}
