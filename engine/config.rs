//! # Analysis Configuration
//!
//! Every knob of a run lives in one serializable `AnalysisConfig`, read from a
//! TOML file. All sections carry defaults, so an empty file (or no file) is a
//! valid configuration that reproduces the standard analysis: cloglog hazard
//! smooths with k = 10, the 4-values / range-1 sufficiency screen, and 1000
//! coefficient draws seeded with 10.

use crate::model::LinkFunction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Input column names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ColumnConfig {
    pub group: String,
    pub plot: String,
    pub census: String,
    /// Optional site column; absent columns are filled with an empty key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// The density covariate whose marginal effect is estimated.
    pub hazard: String,
    pub size: String,
    pub total_density: String,
    pub exposure: String,
    pub outcome: String,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            group: "sp".to_string(),
            plot: "plot".to_string(),
            census: "census".to_string(),
            site: None,
            hazard: "con_dens".to_string(),
            size: "height".to_string(),
            total_density: "tot_dens".to_string(),
            exposure: "interval".to_string(),
            outcome: "status".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualificationConfig {
    /// Minimum number of distinct hazard-covariate values for a standalone group.
    pub min_distinct_values: usize,
    /// Minimum range (max - min) of the hazard covariate for a standalone group.
    pub min_range: f64,
    /// Group key given to the pool of disqualified groups.
    pub pooled_label: String,
}

impl Default for QualificationConfig {
    fn default() -> Self {
        Self {
            min_distinct_values: 4,
            min_range: 1.0,
            pooled_label: "insufficient_data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FittingConfig {
    pub link: LinkFunction,
    /// Default basis size `k` of every smooth term before data-driven capping.
    pub max_basis_size: usize,
    /// A census random effect is only added when the group spans at least this many censuses.
    pub min_census_levels: usize,
    pub max_iterations: usize,
    pub convergence_tolerance: f64,
    pub reml_max_iterations: usize,
    pub reml_convergence_tolerance: f64,
    /// Optional wall-clock budget for a single model fit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_budget_secs: Option<f64>,
}

impl Default for FittingConfig {
    fn default() -> Self {
        Self {
            link: LinkFunction::CLogLog,
            max_basis_size: 10,
            min_census_levels: 2,
            max_iterations: 100,
            convergence_tolerance: 1e-7,
            reml_max_iterations: 50,
            reml_convergence_tolerance: 1e-4,
            time_budget_secs: None,
        }
    }
}

/// How the hazard covariate is moved between the baseline and perturbed tables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScenarioChange {
    /// Central finite difference at every observed value.
    Derivative,
    /// Perturbed = baseline + `delta`.
    Additive { delta: f64 },
    /// Baseline fixed at `from`, perturbed fixed at `to`.
    Explicit { from: f64, to: f64 },
    /// Baseline and perturbed fixed at the group's first and third quartiles.
    Interquartile,
}

/// A named counterfactual request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioSpec {
    pub name: String,
    pub change: ScenarioChange,
    /// Covariates pinned to a fixed value in both tables.
    #[serde(default)]
    pub at: BTreeMap<String, f64>,
}

impl ScenarioSpec {
    pub fn new(name: &str, change: ScenarioChange) -> Self {
        Self {
            name: name.to_string(),
            change,
            at: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarginalConfig {
    /// Number of coefficient vectors drawn for the standard error.
    pub iterations: usize,
    /// Base seed; each group x scenario task derives its own stream from it.
    pub seed: u64,
    /// Exposure length the probabilities are converted to.
    pub offset: f64,
    /// Keep the per-draw estimates for the samples tables.
    pub keep_samples: bool,
    pub scenarios: Vec<ScenarioSpec>,
}

impl Default for MarginalConfig {
    fn default() -> Self {
        Self {
            iterations: 1000,
            seed: 10,
            offset: 1.0,
            keep_samples: true,
            scenarios: vec![
                ScenarioSpec::new("slope", ScenarioChange::Derivative),
                ScenarioSpec::new("plus_one", ScenarioChange::Additive { delta: 1.0 }),
                ScenarioSpec::new(
                    "invasion",
                    ScenarioChange::Explicit {
                        from: 0.0,
                        to: 1.0,
                    },
                ),
                ScenarioSpec::new("iqr", ScenarioChange::Interquartile),
            ],
        }
    }
}

/// The complete configuration of one analysis run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    pub columns: ColumnConfig,
    pub qualification: QualificationConfig,
    pub fitting: FittingConfig,
    pub marginal: MarginalConfig,
    /// Worker threads for the per-group pool; `None` uses the global rayon pool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
}

impl AnalysisConfig {
    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.qualification;
        if q.min_distinct_values == 0 {
            return Err(ConfigError::Invalid(
                "qualification.min_distinct_values must be at least 1".to_string(),
            ));
        }
        if !q.min_range.is_finite() || q.min_range < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "qualification.min_range must be a non-negative number, got {}",
                q.min_range
            )));
        }
        if q.pooled_label.is_empty() {
            return Err(ConfigError::Invalid(
                "qualification.pooled_label must not be empty".to_string(),
            ));
        }

        let f = &self.fitting;
        if f.max_basis_size < 2 {
            return Err(ConfigError::Invalid(format!(
                "fitting.max_basis_size must be at least 2, got {}",
                f.max_basis_size
            )));
        }
        if f.max_iterations == 0 || f.reml_max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "fitting iteration limits must be positive".to_string(),
            ));
        }
        if let Some(budget) = f.time_budget_secs {
            if !(budget > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "fitting.time_budget_secs must be positive, got {budget}"
                )));
            }
        }

        let m = &self.marginal;
        if m.iterations < 2 {
            return Err(ConfigError::Invalid(format!(
                "marginal.iterations must be at least 2 to estimate a standard error, got {}",
                m.iterations
            )));
        }
        if !(m.offset > 0.0) || !m.offset.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "marginal.offset must be a positive exposure length, got {}",
                m.offset
            )));
        }
        let mut seen = HashSet::new();
        for scenario in &m.scenarios {
            if !seen.insert(scenario.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "scenario name '{}' is used more than once",
                    scenario.name
                )));
            }
            if let ScenarioChange::Additive { delta } = scenario.change {
                if !delta.is_finite() {
                    return Err(ConfigError::Invalid(format!(
                        "scenario '{}' has a non-finite delta",
                        scenario.name
                    )));
                }
            }
            if scenario.at.contains_key(&self.columns.hazard) {
                return Err(ConfigError::Invalid(format!(
                    "scenario '{}' pins the hazard covariate '{}' itself",
                    scenario.name, self.columns.hazard
                )));
            }
        }
        if self.threads == Some(0) {
            return Err(ConfigError::Invalid("threads must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: AnalysisConfig = toml::from_str("").unwrap();
        assert_eq!(config, AnalysisConfig::default());
        assert_eq!(config.qualification.min_distinct_values, 4);
        assert_eq!(config.fitting.max_basis_size, 10);
        assert_eq!(config.marginal.scenarios.len(), 4);
        config.validate().unwrap();
    }

    #[test]
    fn scenarios_parse_from_tagged_tables() {
        let text = r#"
            [marginal]
            iterations = 500
            [[marginal.scenarios]]
            name = "slope"
            change = { kind = "derivative" }
            [[marginal.scenarios]]
            name = "plus_two"
            change = { kind = "additive", delta = 2.0 }
            at = { height = 1.5 }
            [[marginal.scenarios]]
            name = "absent_to_present"
            change = { kind = "explicit", from = 0.0, to = 3.0 }
        "#;
        let config: AnalysisConfig = toml::from_str(text).unwrap();
        assert_eq!(config.marginal.iterations, 500);
        assert_eq!(config.marginal.scenarios.len(), 3);
        assert_eq!(
            config.marginal.scenarios[1].change,
            ScenarioChange::Additive { delta: 2.0 }
        );
        assert_eq!(config.marginal.scenarios[1].at.get("height"), Some(&1.5));
        assert_eq!(
            config.marginal.scenarios[2].change,
            ScenarioChange::Explicit { from: 0.0, to: 3.0 }
        );
        config.validate().unwrap();
    }

    #[test]
    fn round_trips_through_toml() {
        let config = AnalysisConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: AnalysisConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn rejects_duplicate_scenario_names_and_pinned_hazard() {
        let mut config = AnalysisConfig::default();
        config
            .marginal
            .scenarios
            .push(ScenarioSpec::new("slope", ScenarioChange::Derivative));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AnalysisConfig::default();
        config.marginal.scenarios[0]
            .at
            .insert(config.columns.hazard.clone(), 0.0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_non_positive_offset() {
        let mut config = AnalysisConfig::default();
        config.marginal.offset = 0.0;
        assert!(config.validate().is_err());
    }
}
