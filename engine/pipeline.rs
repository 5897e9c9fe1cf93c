//! # Analysis Pipeline
//!
//! Orchestrates one run: qualification, per-group model fitting and gating,
//! and per-group, per-scenario marginal effects. Both parallel stages use
//! rayon. Each task only reads its own group's observations and the shared
//! configuration, and every random stream is seeded from the task's identity,
//! so results are independent of scheduling. Aggregation starts only after
//! the marginal-effect stage has joined.

use crate::aggregate::{
    AcceptedGroup, EffectFailureRow, ModelReportRow, ResultTables, ScenarioEffects,
};
use crate::config::{AnalysisConfig, ConfigError, ScenarioSpec};
use crate::data::{DataError, ObservationSet};
use crate::estimate::{FitFailure, fit_group_model};
use crate::gate::{GateState, GateVerdict, evaluate};
use crate::marginal::{MarginalError, MarginalSettings, Scenario, estimate_absolute_and_relative};
use crate::model::{FittedModel, ModelKind};
use crate::qualify::{QualifiedGroups, qualify_groups};
use crate::seeding::derive_task_seed;
use rayon::prelude::*;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid input data: {0}")]
    DataError(#[from] DataError),
    #[error("Invalid configuration: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPoolError(#[from] rayon::ThreadPoolBuildError),
    #[error(
        "No group produced an accepted model ({attempted} attempted, including the pooled group '{pooled_label}' when present)."
    )]
    NoAcceptedGroups {
        attempted: usize,
        pooled_label: String,
    },
}

/// The two parallel stages of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fitting,
    MarginalEffects,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Stage::Fitting => "Fitting group models",
            Stage::MarginalEffects => "Estimating marginal effects",
        })
    }
}

/// Receives progress notifications from worker threads.
pub trait ProgressObserver: Sync {
    fn stage_started(&self, _stage: Stage, _tasks: usize) {}
    fn task_finished(&self, _stage: Stage) {}
    fn stage_finished(&self, _stage: Stage) {}
}

/// Ignores all progress.
pub struct NoProgress;

impl ProgressObserver for NoProgress {}

/// Fit results and verdicts of one group's two models.
#[derive(Debug, Clone)]
pub struct GroupFit {
    pub group: String,
    pub full: Result<FittedModel, FitFailure>,
    pub full_verdict: GateVerdict,
    pub reduced: Result<FittedModel, FitFailure>,
    pub reduced_verdict: GateVerdict,
}

impl GroupFit {
    pub fn report_rows(&self) -> [ModelReportRow; 2] {
        [
            ModelReportRow::new(&self.group, ModelKind::Full, &self.full_verdict),
            ModelReportRow::new(&self.group, ModelKind::Reduced, &self.reduced_verdict),
        ]
    }

    /// The accepted models, when the full model passed the gate.
    pub fn into_accepted(self) -> Option<AcceptedGroup> {
        if !self.full_verdict.is_accepted() {
            return None;
        }
        let full = self.full.ok()?;
        let reduced = if self.reduced_verdict.is_accepted() {
            self.reduced.ok()
        } else {
            None
        };
        Some(AcceptedGroup {
            group: self.group,
            full,
            reduced,
        })
    }
}

/// Fits and gates the full and reduced models of one group.
pub fn fit_and_gate(
    group: &str,
    observations: &ObservationSet,
    config: &AnalysisConfig,
) -> GroupFit {
    let (full, reduced) = rayon::join(
        || fit_group_model(group, observations, config, ModelKind::Full),
        || fit_group_model(group, observations, config, ModelKind::Reduced),
    );
    let full_verdict = evaluate(&full);
    let reduced_verdict = evaluate(&reduced);
    for (kind, verdict) in [
        (ModelKind::Full, &full_verdict),
        (ModelKind::Reduced, &reduced_verdict),
    ] {
        if !verdict.is_accepted() {
            log::warn!(
                "Group '{group}' {kind} model rejected at '{}': {}",
                verdict.state,
                verdict.reason
            );
        }
    }
    GroupFit {
        group: group.to_string(),
        full,
        full_verdict,
        reduced,
        reduced_verdict,
    }
}

/// Computes the AME and rAME of one scenario for one accepted group.
pub fn estimate_scenario(
    accepted: &AcceptedGroup,
    observations: &ObservationSet,
    scenario: &ScenarioSpec,
    config: &AnalysisConfig,
) -> Result<ScenarioEffects, MarginalError> {
    let hazard = &config.columns.hazard;
    let resolved = Scenario::resolve(scenario.change, observations.covariates.column(hazard)?);
    let settings = MarginalSettings {
        offset: config.marginal.offset,
        iterations: config.marginal.iterations,
        keep_samples: config.marginal.keep_samples,
    };
    let seed = derive_task_seed(&accepted.group, &scenario.name, config.marginal.seed);
    log::debug!(
        "Group '{}' scenario '{}': {resolved:?}, seed {seed}",
        accepted.group,
        scenario.name
    );
    let (absolute, relative) = estimate_absolute_and_relative(
        &accepted.full,
        &observations.covariates,
        hazard,
        resolved,
        &scenario.at,
        &settings,
        seed,
    )?;
    Ok(ScenarioEffects {
        group: accepted.group.clone(),
        scenario: scenario.name.clone(),
        absolute,
        relative,
    })
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct AnalysisResults {
    pub tables: ResultTables,
    /// Accepted groups in key order.
    pub accepted: Vec<AcceptedGroup>,
    /// Original groups that were merged into the pooled group.
    pub pooled_members: Vec<String>,
}

impl AnalysisResults {
    pub fn rejected_models(&self) -> impl Iterator<Item = &ModelReportRow> {
        self.tables
            .model_report
            .iter()
            .filter(|row| row.state != GateState::Accepted)
    }
}

/// Runs the whole analysis, in a dedicated thread pool when `config.threads` is set.
pub fn run_analysis(
    observations: &ObservationSet,
    config: &AnalysisConfig,
    observer: &dyn ProgressObserver,
) -> Result<AnalysisResults, PipelineError> {
    config.validate()?;
    observations.validate()?;
    match config.threads {
        Some(threads) => {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
            pool.install(|| run_stages(observations, config, observer))
        }
        None => run_stages(observations, config, observer),
    }
}

fn run_stages(
    observations: &ObservationSet,
    config: &AnalysisConfig,
    observer: &dyn ProgressObserver,
) -> Result<AnalysisResults, PipelineError> {
    let hazard = &config.columns.hazard;
    log::info!(
        "Screening {} observations for data sufficiency on '{hazard}'.",
        observations.len()
    );
    let QualifiedGroups {
        records,
        pooled_record,
        groups,
    } = qualify_groups(observations, hazard, &config.qualification)?;
    let pooled_members: Vec<String> = records
        .iter()
        .filter(|r| !r.qualified)
        .map(|r| r.group.clone())
        .collect();
    log::info!(
        "{} groups modeled ({} pooled into '{}').",
        groups.len(),
        pooled_members.len(),
        config.qualification.pooled_label
    );

    let work: Vec<(&String, &ObservationSet)> = groups.iter().collect();
    observer.stage_started(Stage::Fitting, work.len());
    let fits: Vec<GroupFit> = work
        .par_iter()
        .map(|(group, obs)| {
            let fit = fit_and_gate(group, obs, config);
            observer.task_finished(Stage::Fitting);
            fit
        })
        .collect();
    observer.stage_finished(Stage::Fitting);

    let model_report: Vec<ModelReportRow> = fits.iter().flat_map(GroupFit::report_rows).collect();
    let attempted = fits.len();
    let accepted: Vec<AcceptedGroup> = fits
        .into_iter()
        .filter_map(GroupFit::into_accepted)
        .collect();
    if accepted.is_empty() {
        return Err(PipelineError::NoAcceptedGroups {
            attempted,
            pooled_label: config.qualification.pooled_label.clone(),
        });
    }
    log::info!("{} of {attempted} groups accepted.", accepted.len());

    let tasks: Vec<(&AcceptedGroup, &ObservationSet, &ScenarioSpec)> = accepted
        .iter()
        .filter_map(|a| groups.get(&a.group).map(|obs| (a, obs)))
        .flat_map(|(a, obs)| {
            config
                .marginal
                .scenarios
                .iter()
                .map(move |scenario| (a, obs, scenario))
        })
        .collect();
    observer.stage_started(Stage::MarginalEffects, tasks.len());
    let outcomes: Vec<Result<ScenarioEffects, EffectFailureRow>> = tasks
        .par_iter()
        .map(|&(accepted, obs, scenario)| {
            let outcome = estimate_scenario(accepted, obs, scenario, config).map_err(|err| {
                log::warn!(
                    "Group '{}' scenario '{}': marginal effects failed: {err}",
                    accepted.group,
                    scenario.name
                );
                EffectFailureRow {
                    group: accepted.group.clone(),
                    scenario: scenario.name.clone(),
                    reason: err.to_string(),
                }
            });
            observer.task_finished(Stage::MarginalEffects);
            outcome
        })
        .collect();
    observer.stage_finished(Stage::MarginalEffects);

    let mut effects = Vec::with_capacity(outcomes.len());
    let mut effect_failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(effect) => effects.push(effect),
            Err(failure) => effect_failures.push(failure),
        }
    }

    let mut sufficiency = records;
    sufficiency.extend(pooled_record);
    let tables = ResultTables::assemble(
        sufficiency,
        model_report,
        effect_failures,
        &accepted,
        &effects,
    );
    Ok(AnalysisResults {
        tables,
        accepted,
        pooled_members,
    })
}
