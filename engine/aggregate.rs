//! # Result Aggregation
//!
//! Turns the accepted models and their marginal-effect estimates into flat,
//! serializable row types, and writes every table of a run as a tab-separated
//! file.

use crate::gate::{GateState, GateVerdict};
use crate::marginal::MarginalEffectEstimate;
use crate::model::{FittedModel, ModelKind};
use crate::qualify::GroupSufficiencyRecord;
use itertools::Itertools;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to create output directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write table '{path}': {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error("Failed to flush table '{path}': {source}")]
    Flush {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A group whose full model passed the acceptance gate.
#[derive(Debug, Clone)]
pub struct AcceptedGroup {
    pub group: String,
    pub full: FittedModel,
    /// The reduced model, when it was accepted too.
    pub reduced: Option<FittedModel>,
}

/// AME and rAME of one scenario for one group.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioEffects {
    pub group: String,
    pub scenario: String,
    pub absolute: MarginalEffectEstimate,
    pub relative: MarginalEffectEstimate,
}

/// Terminal gate state of one model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelReportRow {
    pub group: String,
    pub model: ModelKind,
    pub state: GateState,
    pub reason: String,
    /// Visited gate states, `>`-separated.
    pub trace: String,
}

impl ModelReportRow {
    pub fn new(group: &str, model: ModelKind, verdict: &GateVerdict) -> Self {
        Self {
            group: group.to_string(),
            model,
            state: verdict.state,
            reason: verdict.reason.clone(),
            trace: verdict.trace.iter().join(">"),
        }
    }
}

/// A marginal-effect task that could not be computed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectFailureRow {
    pub group: String,
    pub scenario: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoefficientRow {
    pub group: String,
    pub model: ModelKind,
    pub coefficient: String,
    pub estimate: f64,
    pub std_error: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitSummaryRow {
    pub group: String,
    pub n_obs: usize,
    pub log_likelihood: f64,
    pub aic: f64,
    pub edf: f64,
    pub deviance: f64,
    pub null_deviance: f64,
    pub reduced_deviance: Option<f64>,
    pub pseudo_r2: Option<f64>,
    pub iterations: usize,
    pub low_flexibility: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectRow {
    pub group: String,
    pub scenario: String,
    pub estimate: f64,
    pub std_error: f64,
    pub n_obs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRow {
    pub group: String,
    pub scenario: String,
    pub draw: usize,
    pub value: f64,
}

/// `1 - deviance(full) / deviance(reduced)`; `None` when the ratio is undefined.
pub fn pseudo_r_squared(full_deviance: f64, reduced_deviance: f64) -> Option<f64> {
    if reduced_deviance.is_finite() && reduced_deviance > 0.0 && full_deviance.is_finite() {
        Some(1.0 - full_deviance / reduced_deviance)
    } else {
        None
    }
}

fn coefficient_rows(group: &str, model: &FittedModel) -> impl Iterator<Item = CoefficientRow> {
    let std_errors: Option<Vec<f64>> = model
        .covariance
        .as_ref()
        .map(|v| v.diag().iter().map(|d| d.max(0.0).sqrt()).collect());
    model
        .coefficient_names()
        .into_iter()
        .enumerate()
        .map(move |(j, name)| CoefficientRow {
            group: group.to_string(),
            model: model.kind,
            coefficient: name,
            estimate: model.coefficients[j],
            std_error: std_errors.as_ref().map(|se| se[j]),
        })
}

fn fit_summary_row(accepted: &AcceptedGroup) -> FitSummaryRow {
    let full = &accepted.full;
    let reduced_deviance = accepted.reduced.as_ref().map(|m| m.deviance);
    FitSummaryRow {
        group: accepted.group.clone(),
        n_obs: full.n_obs,
        log_likelihood: full.log_likelihood,
        aic: full.aic,
        edf: full.edf,
        deviance: full.deviance,
        null_deviance: full.null_deviance,
        reduced_deviance,
        pseudo_r2: reduced_deviance.and_then(|reduced| pseudo_r_squared(full.deviance, reduced)),
        iterations: full.iterations,
        low_flexibility: full.low_flexibility,
    }
}

fn effect_row(group: &str, scenario: &str, estimate: &MarginalEffectEstimate) -> EffectRow {
    EffectRow {
        group: group.to_string(),
        scenario: scenario.to_string(),
        estimate: estimate.estimate,
        std_error: estimate.std_error,
        n_obs: estimate.n_obs,
    }
}

fn sample_rows(group: &str, scenario: &str, estimate: &MarginalEffectEstimate) -> Vec<SampleRow> {
    estimate
        .samples
        .iter()
        .flatten()
        .enumerate()
        .map(|(draw, &value)| SampleRow {
            group: group.to_string(),
            scenario: scenario.to_string(),
            draw: draw + 1,
            value,
        })
        .collect()
}

/// Every table produced by one run.
#[derive(Debug, Clone, Default)]
pub struct ResultTables {
    pub sufficiency: Vec<GroupSufficiencyRecord>,
    pub model_report: Vec<ModelReportRow>,
    pub effect_failures: Vec<EffectFailureRow>,
    pub coefficients: Vec<CoefficientRow>,
    pub fit_summary: Vec<FitSummaryRow>,
    pub ame: Vec<EffectRow>,
    pub rame: Vec<EffectRow>,
    pub ame_samples: Vec<SampleRow>,
    pub rame_samples: Vec<SampleRow>,
}

impl ResultTables {
    /// Assembles the tables. `accepted` and `effects` are expected in group order.
    pub fn assemble(
        sufficiency: Vec<GroupSufficiencyRecord>,
        model_report: Vec<ModelReportRow>,
        effect_failures: Vec<EffectFailureRow>,
        accepted: &[AcceptedGroup],
        effects: &[ScenarioEffects],
    ) -> Self {
        let mut tables = Self {
            sufficiency,
            model_report,
            effect_failures,
            ..Self::default()
        };

        for group in accepted {
            tables
                .coefficients
                .extend(coefficient_rows(&group.group, &group.full));
            if let Some(reduced) = &group.reduced {
                tables
                    .coefficients
                    .extend(coefficient_rows(&group.group, reduced));
            }
            tables.fit_summary.push(fit_summary_row(group));
        }

        for effect in effects {
            let (group, scenario) = (effect.group.as_str(), effect.scenario.as_str());
            tables.ame.push(effect_row(group, scenario, &effect.absolute));
            tables.rame.push(effect_row(group, scenario, &effect.relative));
            tables
                .ame_samples
                .extend(sample_rows(group, scenario, &effect.absolute));
            tables
                .rame_samples
                .extend(sample_rows(group, scenario, &effect.relative));
        }
        tables
    }

    /// Writes every non-optional table, plus the sample and failure tables when
    /// they have rows, into `dir`. Returns the paths written.
    pub fn write_to_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, OutputError> {
        fs::create_dir_all(dir).map_err(|source| OutputError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut written = Vec::new();
        let mut write = |name: &str, result: Result<PathBuf, OutputError>| {
            log::debug!("Wrote table '{name}'.");
            result.map(|path| written.push(path))
        };
        write("sufficiency", write_tsv(&dir.join("sufficiency.tsv"), &self.sufficiency))?;
        write("model_report", write_tsv(&dir.join("model_report.tsv"), &self.model_report))?;
        write("coefficients", write_tsv(&dir.join("coefficients.tsv"), &self.coefficients))?;
        write("fit_summary", write_tsv(&dir.join("fit_summary.tsv"), &self.fit_summary))?;
        write("ame", write_tsv(&dir.join("ame.tsv"), &self.ame))?;
        write("rame", write_tsv(&dir.join("rame.tsv"), &self.rame))?;
        if !self.ame_samples.is_empty() {
            write("ame_samples", write_tsv(&dir.join("ame_samples.tsv"), &self.ame_samples))?;
            write("rame_samples", write_tsv(&dir.join("rame_samples.tsv"), &self.rame_samples))?;
        }
        if !self.effect_failures.is_empty() {
            write(
                "effect_failures",
                write_tsv(&dir.join("effect_failures.tsv"), &self.effect_failures),
            )?;
        }
        Ok(written)
    }
}

/// Writes serde rows as a tab-separated table with a header line.
/// An empty slice produces an empty file.
pub fn write_tsv<T: Serialize>(path: &Path, rows: &[T]) -> Result<PathBuf, OutputError> {
    let csv_error = |source| OutputError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .map_err(csv_error)?;
    for row in rows {
        wtr.serialize(row).map_err(csv_error)?;
    }
    wtr.flush().map_err(|source| OutputError::Flush {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(path.to_path_buf())
}
