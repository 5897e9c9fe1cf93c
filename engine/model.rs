use crate::basis::BasisError;
use crate::construction::ModelLayout;
use crate::data::{CovariateFrame, DataError};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Defines the link function, connecting the linear predictor to the conditional
/// death probability over one unit of exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkFunction {
    /// Complementary log-log: `mu = 1 - exp(-exp(eta))`. With a `log(exposure)`
    /// offset this is a proportional-hazards model for interval-censored deaths.
    CLogLog,
    /// The logit link, `mu = 1 / (1 + exp(-eta))`.
    Logit,
}

impl LinkFunction {
    /// Maps a linear predictor to a probability.
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            LinkFunction::CLogLog => -(-eta.exp()).exp_m1(),
            LinkFunction::Logit => 1.0 / (1.0 + (-eta).exp()),
        }
    }

    /// Maps a probability in (0, 1) to the linear predictor scale.
    pub fn apply(self, mu: f64) -> f64 {
        match self {
            LinkFunction::CLogLog => (-(-mu).ln_1p()).ln(),
            LinkFunction::Logit => (mu / (1.0 - mu)).ln(),
        }
    }

    /// `log(mu)` computed without forming `mu`.
    pub fn log_mu(self, eta: f64) -> f64 {
        match self {
            LinkFunction::CLogLog => (-(-eta.exp()).exp_m1()).ln(),
            LinkFunction::Logit => -softplus(-eta),
        }
    }

    /// `log(1 - mu)` computed without forming `mu`.
    pub fn log_one_minus_mu(self, eta: f64) -> f64 {
        match self {
            LinkFunction::CLogLog => -eta.exp(),
            LinkFunction::Logit => -softplus(eta),
        }
    }
}

impl fmt::Display for LinkFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkFunction::CLogLog => write!(f, "cloglog"),
            LinkFunction::Logit => write!(f, "logit"),
        }
    }
}

fn softplus(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// Which of the two per-group models a fit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// All smooth terms, including the hazard covariate.
    Full,
    /// The hazard-covariate smooth is left out.
    Reduced,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Full => write!(f, "full"),
            ModelKind::Reduced => write!(f, "reduced"),
        }
    }
}

/// Custom error type for prediction-matrix construction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Underlying basis function generation failed during prediction: {0}")]
    BasisError(#[from] BasisError),
    #[error("Covariate table is not usable for prediction: {0}")]
    DataError(#[from] DataError),
    #[error(
        "Internal error: prediction matrix has {found} columns but the model has {expected} coefficients."
    )]
    InternalStackingError { found: usize, expected: usize },
}

/// Fit statistics of one smooth term.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TermSummary {
    pub name: String,
    pub edf: f64,
    /// Smoothing parameter; `None` for unpenalized terms.
    pub lambda: Option<f64>,
}

/// A fitted smooth hazard regression for one group.
#[derive(Debug, Clone)]
pub struct FittedModel {
    pub group: String,
    pub kind: ModelKind,
    pub link: LinkFunction,
    pub layout: ModelLayout,
    pub converged: bool,
    pub coefficients: Array1<f64>,
    /// Bayesian posterior covariance of the coefficients; absent when the
    /// penalized Hessian is not positive definite.
    pub covariance: Option<Array2<f64>>,
    pub deviance: f64,
    /// Deviance of the intercept-and-offset model on the same rows.
    pub null_deviance: f64,
    pub log_likelihood: f64,
    pub edf: f64,
    pub aic: f64,
    pub terms: Vec<TermSummary>,
    /// Per-observation leverage (diagonal of the influence matrix).
    pub leverage: Array1<f64>,
    /// Fitted death probabilities over each observation's own exposure.
    pub fitted: Array1<f64>,
    pub n_obs: usize,
    /// Set when at least one smooth had to be entered as a linear term.
    pub low_flexibility: bool,
    pub iterations: usize,
}

impl FittedModel {
    /// Names of the coefficients in column order, e.g. `s(height).3`.
    pub fn coefficient_names(&self) -> Vec<String> {
        self.layout.coefficient_names()
    }
}

/// What the marginal-effect estimator needs from a fitted model.
pub trait MarginalModel {
    /// Linear-predictor matrix for new covariate values, without any offset.
    fn linear_predictor_matrix(&self, frame: &CovariateFrame) -> Result<Array2<f64>, ModelError>;
    fn link(&self) -> LinkFunction;
    fn coefficients(&self) -> &Array1<f64>;
    fn covariance(&self) -> Option<&Array2<f64>>;
}

impl MarginalModel for FittedModel {
    fn linear_predictor_matrix(&self, frame: &CovariateFrame) -> Result<Array2<f64>, ModelError> {
        let x = self.layout.prediction_matrix(frame)?;
        if x.ncols() != self.coefficients.len() {
            return Err(ModelError::InternalStackingError {
                found: x.ncols(),
                expected: self.coefficients.len(),
            });
        }
        Ok(x)
    }

    fn link(&self) -> LinkFunction {
        self.link
    }

    fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }

    fn covariance(&self) -> Option<&Array2<f64>> {
        self.covariance.as_ref()
    }
}
