//! # Group Model Fitting via Penalized Likelihood and REML
//!
//! Each group gets a smooth additive hazard model fitted by a nested scheme:
//!
//! 1.  **Outer loop (BFGS):** optimizes the log smoothing parameters (`rho`) by
//!     minimizing the negative Laplace approximate marginal likelihood (LAML),
//!     the REML criterion of Wood (2011).
//! 2.  **Inner loop (P-IRLS):** for each trial `rho`, finds the penalized
//!     maximum-likelihood coefficients.
//!
//! The public entry point never propagates an error: any failure while fitting
//! becomes a `FitFailure` value that the acceptance gate records.

use finitediff::FiniteDiff;
use wolfe_bfgs::{Bfgs, BfgsSolution};

use crate::config::AnalysisConfig;
use crate::construction::{ModelLayout, build_design_and_penalty_matrices};
use crate::data::ObservationSet;
use crate::faer_ndarray::{FaerCholesky, FaerLinalgError};
use crate::model::{FittedModel, LinkFunction, ModelError, ModelKind, TermSummary};
use crate::pirls::{PirlsResult, fit_model_for_fixed_rho, pseudo_inverse};
use crate::seeding::generate_rho_candidates;
use crate::terms::build_formula;
use ahash::AHashMap;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::cell::{Cell, RefCell};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Log smoothing parameters are kept inside this box.
const RHO_BOUND: f64 = 12.0;
/// Cost reported to BFGS when a trial point cannot be evaluated.
const FAILED_COST: f64 = 1e10;

/// A comprehensive error type for the model estimation process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Design matrix construction failed: {0}")]
    ModelError(#[from] ModelError),

    #[error("A linear algebra operation failed: {0}")]
    LinearAlgebraFailed(#[from] FaerLinalgError),

    #[error("The group has no observations.")]
    EmptyGroup,

    #[error("Model coefficients are not finite.")]
    NonFiniteCoefficients,

    #[error("REML/BFGS optimization failed: {0}")]
    RemlOptimizationFailed(String),

    #[error("Model fit exceeded its time budget of {budget_secs} s.")]
    TimedOut { budget_secs: f64 },
}

/// A captured fitting failure. Fitting never panics or propagates: the caller
/// receives this tag instead of a model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitFailure {
    #[error("model fit failed: {0}")]
    Error(String),
    #[error("model fit exceeded the time budget of {budget_secs} s")]
    TimedOut { budget_secs: f64 },
}

impl From<EstimationError> for FitFailure {
    fn from(err: EstimationError) -> Self {
        match err {
            EstimationError::TimedOut { budget_secs } => FitFailure::TimedOut { budget_secs },
            other => FitFailure::Error(other.to_string()),
        }
    }
}

/// Fits the full or reduced hazard model of one group.
pub fn fit_group_model(
    group: &str,
    observations: &ObservationSet,
    config: &AnalysisConfig,
    kind: ModelKind,
) -> Result<FittedModel, FitFailure> {
    match train_model(group, observations, config, kind) {
        Ok(model) => Ok(model),
        Err(err) => {
            log::warn!("Group '{group}' ({kind} model): {err}");
            Err(err.into())
        }
    }
}

fn train_model(
    group: &str,
    observations: &ObservationSet,
    config: &AnalysisConfig,
    kind: ModelKind,
) -> Result<FittedModel, EstimationError> {
    if observations.is_empty() {
        return Err(EstimationError::EmptyGroup);
    }
    let fitting = &config.fitting;
    let formula = build_formula(observations, &config.columns, fitting, kind);
    log::debug!("Group '{group}' {kind} model: {formula}");

    let (x, s_list, layout) = build_design_and_penalty_matrices(observations, &formula)?;
    log_layout_info(group, &layout);

    let y = observations.outcome.view();
    let offset = observations.exposure.mapv(f64::ln);
    let budget = fitting.time_budget_secs.map(Duration::from_secs_f64);

    let reml_state = internal::RemlState::new(
        x.view(),
        y,
        offset.view(),
        &s_list,
        &layout.penalty_ranks,
        fitting.link,
        fitting.max_iterations,
        fitting.convergence_tolerance,
        budget,
    );

    let final_rho = if layout.num_penalties == 0 {
        Array1::zeros(0)
    } else {
        reml_state.optimize_rho(
            fitting.reml_convergence_tolerance,
            fitting.reml_max_iterations,
        )?
    };

    let final_fit = reml_state.execute_pirls_if_needed(&final_rho)?;
    reml_state.check_budget()?;
    if final_fit.beta.iter().any(|b| !b.is_finite()) {
        return Err(EstimationError::NonFiniteCoefficients);
    }

    let null_fit = fit_model_for_fixed_rho(
        Array1::<f64>::zeros(0).view(),
        Array2::<f64>::ones((x.nrows(), 1)).view(),
        y,
        offset.view(),
        &[],
        fitting.link,
        fitting.max_iterations,
        fitting.convergence_tolerance,
    )?;

    let mut model = internal::assemble_fitted_model(
        group,
        kind,
        fitting.link,
        layout,
        x.view(),
        final_rho.view(),
        final_fit,
        formula.low_flexibility,
    )?;
    model.null_deviance = null_fit.deviance;
    log::info!(
        "Group '{group}' {kind} model: deviance {:.4}, edf {:.2}, converged = {}",
        model.deviance,
        model.edf,
        model.converged
    );
    Ok(model)
}

/// Helper to log the final model structure.
fn log_layout_info(group: &str, layout: &ModelLayout) {
    log::debug!(
        "Group '{group}' model structure has {} total coefficients and {} penalized terms.",
        layout.total_coeffs,
        layout.num_penalties
    );
    for block in &layout.blocks {
        log::debug!("  - {}: {} coefficients", block.spec, block.col_range.len());
    }
}

/// Internal module for estimation logic.
mod internal {
    use super::*;

    /// Holds the state for the outer REML optimization.
    pub(super) struct RemlState<'a> {
        x: ArrayView2<'a, f64>,
        y: ArrayView1<'a, f64>,
        offset: ArrayView1<'a, f64>,
        s_list: &'a [Array2<f64>],
        penalty_ranks: &'a [usize],
        link: LinkFunction,
        max_iterations: usize,
        tolerance: f64,
        cache: RefCell<AHashMap<Vec<u64>, PirlsResult>>,
        best: RefCell<Option<(f64, Array1<f64>)>>,
        started: Instant,
        budget: Option<Duration>,
        timed_out: Cell<bool>,
    }

    impl<'a> RemlState<'a> {
        #[allow(clippy::too_many_arguments)]
        pub(super) fn new(
            x: ArrayView2<'a, f64>,
            y: ArrayView1<'a, f64>,
            offset: ArrayView1<'a, f64>,
            s_list: &'a [Array2<f64>],
            penalty_ranks: &'a [usize],
            link: LinkFunction,
            max_iterations: usize,
            tolerance: f64,
            budget: Option<Duration>,
        ) -> Self {
            Self {
                x,
                y,
                offset,
                s_list,
                penalty_ranks,
                link,
                max_iterations,
                tolerance,
                cache: RefCell::new(AHashMap::new()),
                best: RefCell::new(None),
                started: Instant::now(),
                budget,
                timed_out: Cell::new(false),
            }
        }

        /// Runs the inner P-IRLS loop, caching the result.
        pub(super) fn execute_pirls_if_needed(
            &self,
            rho: &Array1<f64>,
        ) -> Result<PirlsResult, EstimationError> {
            let key: Vec<u64> = rho.iter().map(|&v| v.to_bits()).collect();
            if let Some(cached_result) = self.cache.borrow().get(&key) {
                return Ok(cached_result.clone());
            }
            let result = fit_model_for_fixed_rho(
                rho.view(),
                self.x,
                self.y,
                self.offset,
                self.s_list,
                self.link,
                self.max_iterations,
                self.tolerance,
            )?;
            self.cache.borrow_mut().insert(key, result.clone());
            Ok(result)
        }

        /// Negative LAML, up to constants:
        /// `D/2 + b'S b/2 + log|H|/2 - sum_k rank_k rho_k / 2`.
        pub(super) fn compute_cost(&self, rho: &Array1<f64>) -> Result<f64, EstimationError> {
            let fit = self.execute_pirls_if_needed(rho)?;
            let log_det_h = fit.penalized_hessian.cholesky(Side::Lower)?.log_det();
            let log_det_s: f64 = self
                .penalty_ranks
                .iter()
                .zip(rho.iter())
                .map(|(&rank, &r)| rank as f64 * r)
                .sum();
            let cost = 0.5 * fit.deviance + 0.5 * fit.penalty + 0.5 * log_det_h - 0.5 * log_det_s;

            let mut best = self.best.borrow_mut();
            let improved = match best.as_ref() {
                Some((best_cost, _)) => cost < *best_cost,
                None => cost.is_finite(),
            };
            if improved {
                *best = Some((cost, rho.clone()));
            }
            Ok(cost)
        }

        /// Cost for the optimizer: points that fail or give a non-finite
        /// cost are reported as `FAILED_COST`.
        fn cost_or_failed(&self, rho: &Array1<f64>) -> f64 {
            self.compute_cost(rho)
                .ok()
                .filter(|cost| cost.is_finite())
                .unwrap_or(FAILED_COST)
        }

        /// Central finite-difference gradient of the cost.
        pub(super) fn compute_gradient(&self, rho: &Array1<f64>) -> Array1<f64> {
            let grad = rho
                .to_vec()
                .central_diff(&|r: &Vec<f64>| self.cost_or_failed(&Array1::from_vec(r.clone())));
            Array1::from_vec(grad)
        }

        /// Fails once the elapsed time exceeds the budget, or once any earlier
        /// check found it exceeded.
        pub(super) fn check_budget(&self) -> Result<(), EstimationError> {
            if self.timed_out.get() || self.over_budget() {
                return Err(EstimationError::TimedOut {
                    budget_secs: self.budget.map_or(0.0, |b| b.as_secs_f64()),
                });
            }
            Ok(())
        }

        fn over_budget(&self) -> bool {
            match self.budget {
                Some(budget) if self.started.elapsed() > budget => {
                    self.timed_out.set(true);
                    true
                }
                _ => false,
            }
        }

        /// Runs BFGS on `rho` and returns the best point evaluated.
        pub(super) fn optimize_rho(
            &self,
            tolerance: f64,
            max_iterations: usize,
        ) -> Result<Array1<f64>, EstimationError> {
            let mut start: Option<(f64, Array1<f64>)> = None;
            for candidate in generate_rho_candidates(self.s_list.len()) {
                if self.over_budget() {
                    break;
                }
                let cost = match self.compute_cost(&candidate) {
                    Ok(cost) if cost.is_finite() => cost,
                    _ => continue,
                };
                if start.as_ref().is_none_or(|(best, _)| cost < *best) {
                    start = Some((cost, candidate));
                }
            }
            self.check_budget()?;
            let (initial_cost, initial_rho) = start.ok_or_else(|| {
                EstimationError::RemlOptimizationFailed(
                    "REML cost is not finite at any starting point".to_string(),
                )
            })?;
            log::debug!("Initial REML cost: {initial_cost:.6} at rho = {initial_rho}");

            let cost_and_grad = |rho_bfgs: &Array1<f64>| -> (f64, Array1<f64>) {
                let safe_rho = rho_bfgs.mapv(|v| v.clamp(-RHO_BOUND, RHO_BOUND));
                if self.timed_out.get() || self.over_budget() {
                    return (FAILED_COST, Array1::zeros(safe_rho.len()));
                }
                let cost = match self.compute_cost(&safe_rho) {
                    Ok(cost) if cost.is_finite() => cost,
                    Ok(cost) => {
                        log::debug!("Non-finite REML cost {cost} at rho = {safe_rho}");
                        FAILED_COST
                    }
                    Err(e) => {
                        log::debug!("REML cost evaluation failed at rho = {safe_rho}: {e}");
                        FAILED_COST
                    }
                };
                (cost, self.compute_gradient(&safe_rho))
            };

            match Bfgs::new(initial_rho, cost_and_grad)
                .with_tolerance(tolerance)
                .with_max_iterations(max_iterations)
                .run()
            {
                Ok(BfgsSolution {
                    final_value,
                    iterations,
                    ..
                }) => log::debug!(
                    "BFGS finished after {iterations} iterations with cost {final_value:.6}"
                ),
                Err(e) => {
                    log::debug!("BFGS stopped early ({e:?}); using the best point evaluated.")
                }
            }

            self.check_budget()?;

            self.best
                .borrow()
                .as_ref()
                .map(|(_, rho)| rho.clone())
                .ok_or_else(|| {
                    EstimationError::RemlOptimizationFailed(
                        "no smoothing parameters could be evaluated".to_string(),
                    )
                })
        }
    }

    /// Derives covariance, effective degrees of freedom and leverage from the
    /// final P-IRLS fit.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn assemble_fitted_model(
        group: &str,
        kind: ModelKind,
        link: LinkFunction,
        layout: ModelLayout,
        x: ArrayView2<f64>,
        rho: ArrayView1<f64>,
        fit: PirlsResult,
        low_flexibility: bool,
    ) -> Result<FittedModel, EstimationError> {
        let covariance = match fit.penalized_hessian.cholesky(Side::Lower) {
            Ok(factor) => {
                let inverse = factor.inverse();
                Some((&inverse + &inverse.t()) * 0.5)
            }
            Err(_) => {
                log::warn!(
                    "Group '{group}' ({kind} model): penalized Hessian is not positive definite; no covariance available."
                );
                None
            }
        };
        let vp = match &covariance {
            Some(v) => v.clone(),
            None => pseudo_inverse(&fit.penalized_hessian)?,
        };

        let influence = vp.dot(&fit.weighted_gram);
        let edf_per_coef = influence.diag().to_owned();
        let edf = edf_per_coef.sum();

        let terms = layout
            .blocks
            .iter()
            .map(|block| TermSummary {
                name: block.spec.label(),
                edf: edf_per_coef.slice(ndarray::s![block.col_range.clone()]).sum(),
                lambda: block.penalty_idx.map(|k| rho[k].exp()),
            })
            .collect();

        let xv = x.dot(&vp);
        let leverage = (&xv * &x).sum_axis(Axis(1)) * &fit.final_weights;
        let fitted = fit.eta.mapv(|e| link.inverse(e));
        let log_likelihood = -0.5 * fit.deviance;

        Ok(FittedModel {
            group: group.to_string(),
            kind,
            link,
            layout,
            converged: fit.status.is_converged(),
            coefficients: fit.beta,
            covariance,
            deviance: fit.deviance,
            null_deviance: f64::NAN,
            log_likelihood,
            edf,
            aic: -2.0 * log_likelihood + 2.0 * edf,
            terms,
            leverage,
            fitted,
            n_obs: x.nrows(),
            low_flexibility,
            iterations: fit.iteration,
        })
    }
}
