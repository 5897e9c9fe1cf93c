//! # Model Acceptance Gate
//!
//! A fitted model must pass four checks, in order, before its marginal effects
//! are reported: the fit produced a model, the fit converged, no near-certain
//! prediction sits among the most influential rows, and a coefficient
//! covariance exists. The gate is an explicit state machine whose visited
//! states are recorded, so a rejection can always be traced back to the check
//! that failed.

use crate::estimate::FitFailure;
use crate::model::FittedModel;
use ndarray::ArrayView1;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// Fitted probabilities above this are treated as numerically certain.
pub const SEPARATION_THRESHOLD: f64 = 1.0 - 10.0 * f64::EPSILON;
/// Share of rows, by leverage, inspected for separation.
pub const TOP_INFLUENCE_SHARE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Unfit,
    FitAttempted,
    FitFailed,
    ConvergenceCheck,
    NotConverged,
    SeparationCheck,
    SeparationLikely,
    CovarianceCheck,
    CovarianceMissing,
    Accepted,
}

impl GateState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GateState::FitFailed
                | GateState::NotConverged
                | GateState::SeparationLikely
                | GateState::CovarianceMissing
                | GateState::Accepted
        )
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GateState::Unfit => "unfit",
            GateState::FitAttempted => "fit_attempted",
            GateState::FitFailed => "fit_failed",
            GateState::ConvergenceCheck => "convergence_check",
            GateState::NotConverged => "not_converged",
            GateState::SeparationCheck => "separation_check",
            GateState::SeparationLikely => "separation_likely",
            GateState::CovarianceCheck => "covariance_check",
            GateState::CovarianceMissing => "covariance_missing",
            GateState::Accepted => "accepted",
        };
        f.write_str(name)
    }
}

/// What the gate inspects on a fitted model.
pub trait FitDiagnostics {
    fn converged(&self) -> bool;
    /// Fitted probabilities, unclamped.
    fn fitted_probabilities(&self) -> ArrayView1<'_, f64>;
    fn leverage(&self) -> ArrayView1<'_, f64>;
    fn has_covariance(&self) -> bool;
}

impl FitDiagnostics for FittedModel {
    fn converged(&self) -> bool {
        self.converged
    }

    fn fitted_probabilities(&self) -> ArrayView1<'_, f64> {
        self.fitted.view()
    }

    fn leverage(&self) -> ArrayView1<'_, f64> {
        self.leverage.view()
    }

    fn has_covariance(&self) -> bool {
        self.covariance.is_some()
    }
}

/// Terminal state of the gate plus the path that led there.
#[derive(Debug, Clone, PartialEq)]
pub struct GateVerdict {
    pub state: GateState,
    pub trace: Vec<GateState>,
    pub reason: String,
}

impl GateVerdict {
    pub fn is_accepted(&self) -> bool {
        self.state == GateState::Accepted
    }

    pub fn visited(&self, state: GateState) -> bool {
        self.trace.contains(&state)
    }
}

struct Gate {
    trace: Vec<GateState>,
}

impl Gate {
    fn new() -> Self {
        Self {
            trace: vec![GateState::Unfit],
        }
    }

    fn advance(&mut self, next: GateState) {
        self.trace.push(next);
    }

    fn finish(mut self, terminal: GateState, reason: String) -> GateVerdict {
        self.advance(terminal);
        GateVerdict {
            state: terminal,
            trace: self.trace,
            reason,
        }
    }
}

/// Runs a fit result through the acceptance checks.
pub fn evaluate<M: FitDiagnostics>(fit: &Result<M, FitFailure>) -> GateVerdict {
    let mut gate = Gate::new();
    gate.advance(GateState::FitAttempted);

    let model = match fit {
        Ok(model) => model,
        Err(failure) => return gate.finish(GateState::FitFailed, failure.to_string()),
    };

    gate.advance(GateState::ConvergenceCheck);
    if !model.converged() {
        return gate.finish(
            GateState::NotConverged,
            "penalized IRLS did not converge".to_string(),
        );
    }

    gate.advance(GateState::SeparationCheck);
    let flagged = separated_influential_rows(model.fitted_probabilities(), model.leverage());
    if flagged > 0 {
        return gate.finish(
            GateState::SeparationLikely,
            format!(
                "{flagged} near-certain fitted probabilities among the top {}% most influential rows",
                (TOP_INFLUENCE_SHARE * 100.0).round()
            ),
        );
    }

    gate.advance(GateState::CovarianceCheck);
    if !model.has_covariance() {
        return gate.finish(
            GateState::CovarianceMissing,
            "no coefficient covariance matrix".to_string(),
        );
    }

    gate.finish(GateState::Accepted, String::new())
}

/// Counts rows whose fitted probability exceeds `SEPARATION_THRESHOLD` among
/// the `round(0.1 n)` rows with the largest leverage.
pub fn separated_influential_rows(fitted: ArrayView1<f64>, leverage: ArrayView1<f64>) -> usize {
    let n = fitted.len().min(leverage.len());
    let top = (n as f64 * TOP_INFLUENCE_SHARE).round() as usize;
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        leverage[b]
            .partial_cmp(&leverage[a])
            .unwrap_or(Ordering::Equal)
    });
    order
        .into_iter()
        .take(top)
        .filter(|&i| fitted[i] > SEPARATION_THRESHOLD)
        .count()
}
