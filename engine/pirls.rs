use crate::estimate::EstimationError;
use crate::faer_ndarray::{FaerCholesky, FaerEigh};
use crate::model::LinkFunction;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};

/// Linear predictors are clamped to this window before forming IRLS weights.
const CLOGLOG_ETA_BOUNDS: (f64, f64) = (-30.0, 3.5);
const LOGIT_ETA_BOUNDS: (f64, f64) = (-30.0, 30.0);
const MAX_STEP_HALVINGS: usize = 30;

/// The status of the P-IRLS convergence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PirlsStatus {
    /// Converged successfully within tolerance.
    Converged,
    /// Step halving could not reduce the penalized deviance any further.
    StalledAtValidMinimum,
    /// Reached maximum iterations without converging.
    MaxIterationsReached,
}

impl PirlsStatus {
    pub fn is_converged(self) -> bool {
        !matches!(self, PirlsStatus::MaxIterationsReached)
    }
}

/// Holds the result of the P-IRLS inner loop for a fixed rho.
#[derive(Clone, Debug)]
pub struct PirlsResult {
    pub beta: Array1<f64>,
    /// Linear predictor including the offset.
    pub eta: Array1<f64>,
    /// `X' W X + S_lambda` at the final coefficients.
    pub penalized_hessian: Array2<f64>,
    /// `X' W X` at the final coefficients.
    pub weighted_gram: Array2<f64>,
    pub deviance: f64,
    /// `beta' S_lambda beta`.
    pub penalty: f64,
    pub final_weights: Array1<f64>,
    pub status: PirlsStatus,
    pub iteration: usize,
}

/// Fits penalized coefficients for fixed log smoothing parameters `rho`.
///
/// The iteration starts from `mu = (y + 0.5) / 2` and uses step halving on the
/// penalized deviance, so the result depends only on the inputs.
#[allow(clippy::too_many_arguments)]
pub fn fit_model_for_fixed_rho(
    rho: ArrayView1<f64>,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    offset: ArrayView1<f64>,
    s_list: &[Array2<f64>],
    link: LinkFunction,
    max_iterations: usize,
    tolerance: f64,
) -> Result<PirlsResult, EstimationError> {
    let p = x.ncols();
    let mut s_lambda = Array2::<f64>::zeros((p, p));
    for (s, &r) in s_list.iter().zip(rho.iter()) {
        s_lambda.scaled_add(r.exp(), s);
    }

    let mut eta = y.mapv(|yi| link.apply((yi + 0.5) / 2.0));
    let mut beta = Array1::<f64>::zeros(p);
    let mut last_penalized_deviance = f64::INFINITY;
    let mut status = PirlsStatus::MaxIterationsReached;
    let mut iteration = 0;

    for iter in 1..=max_iterations {
        iteration = iter;
        let (_, weights, z) = update_glm_vectors(y, &eta, offset, link);
        let (xtwx, xtwz) = weighted_normal_equations(x, &weights, &z);
        let hessian = &xtwx + &s_lambda;
        let beta_proposed = solve_symmetric(&hessian, &xtwz)?;

        let mut beta_new = beta_proposed;
        let mut eta_new = x.dot(&beta_new) + &offset;
        let mut penalized_deviance = calculate_deviance(y, &eta_new, link)
            + beta_new.dot(&s_lambda.dot(&beta_new));

        // The first step starts from mu, not from a coefficient vector, so it
        // has nothing to be compared against.
        if iter > 1 {
            let mut halvings = 0;
            while !(penalized_deviance <= last_penalized_deviance * (1.0 + 1e-12) + 1e-12) {
                if halvings == MAX_STEP_HALVINGS {
                    log::debug!(
                        "P-IRLS step halving exhausted at iteration {iter}; keeping current coefficients."
                    );
                    status = PirlsStatus::StalledAtValidMinimum;
                    break;
                }
                beta_new = (&beta_new + &beta) * 0.5;
                eta_new = x.dot(&beta_new) + &offset;
                penalized_deviance = calculate_deviance(y, &eta_new, link)
                    + beta_new.dot(&s_lambda.dot(&beta_new));
                halvings += 1;
            }
            if status == PirlsStatus::StalledAtValidMinimum {
                break;
            }
        }

        let change = (penalized_deviance - last_penalized_deviance).abs();
        beta = beta_new;
        eta = eta_new;
        log::trace!("P-IRLS iteration {iter}: penalized deviance {penalized_deviance:.8}");

        if change < tolerance * (penalized_deviance.abs() + 0.1) {
            last_penalized_deviance = penalized_deviance;
            status = PirlsStatus::Converged;
            break;
        }
        last_penalized_deviance = penalized_deviance;
    }

    let (_, final_weights, _) = update_glm_vectors(y, &eta, offset, link);
    let sqrt_w = final_weights.mapv(f64::sqrt);
    let xw = &x * &sqrt_w.view().insert_axis(Axis(1));
    let weighted_gram = xw.t().dot(&xw);
    let penalized_hessian = &weighted_gram + &s_lambda;

    Ok(PirlsResult {
        deviance: calculate_deviance(y, &eta, link),
        penalty: beta.dot(&s_lambda.dot(&beta)),
        beta,
        eta,
        penalized_hessian,
        weighted_gram,
        final_weights,
        status,
        iteration,
    })
}

/// Computes `(mu, weights, z)` for the current linear predictor.
///
/// `eta` includes the offset; the working response `z` does not, so it can be
/// regressed directly on `X`.
pub fn update_glm_vectors(
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
    offset: ArrayView1<f64>,
    link: LinkFunction,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    let n = y.len();
    let mut mu = Array1::zeros(n);
    let mut weights = Array1::zeros(n);
    let mut z = Array1::zeros(n);

    for i in 0..n {
        let (mu_i, dmu_deta, w_i, eta_c) = match link {
            LinkFunction::CLogLog => {
                let eta_c = eta[i].clamp(CLOGLOG_ETA_BOUNDS.0, CLOGLOG_ETA_BOUNDS.1);
                let t = eta_c.exp();
                let mu_i = -(-t).exp_m1();
                let dmu_deta = t * (-t).exp();
                // (dmu/deta)^2 / (mu (1 - mu)) simplified with 1 - mu = exp(-t).
                (mu_i, dmu_deta, t * t * (-t).exp() / mu_i, eta_c)
            }
            LinkFunction::Logit => {
                let eta_c = eta[i].clamp(LOGIT_ETA_BOUNDS.0, LOGIT_ETA_BOUNDS.1);
                let mu_i = 1.0 / (1.0 + (-eta_c).exp());
                let v = mu_i * (1.0 - mu_i);
                (mu_i, v, v, eta_c)
            }
        };
        mu[i] = mu_i;
        weights[i] = w_i;
        z[i] = eta_c - offset[i] + (y[i] - mu_i) / dmu_deta;
    }
    (mu, weights, z)
}

/// Binomial deviance of 0/1 responses, `-2 * log-likelihood`.
pub fn calculate_deviance(y: ArrayView1<f64>, eta: &Array1<f64>, link: LinkFunction) -> f64 {
    Zip::from(y).and(eta).fold(0.0, |acc, &yi, &eta_i| {
        let eta_i = eta_i.clamp(-700.0, 700.0);
        let ll = if yi > 0.5 {
            link.log_mu(eta_i)
        } else {
            link.log_one_minus_mu(eta_i)
        };
        acc - 2.0 * ll
    })
}

fn weighted_normal_equations(
    x: ArrayView2<f64>,
    weights: &Array1<f64>,
    z: &Array1<f64>,
) -> (Array2<f64>, Array1<f64>) {
    let sqrt_w = weights.mapv(f64::sqrt);
    let xw = &x * &sqrt_w.view().insert_axis(Axis(1));
    let zw = z * &sqrt_w;
    (xw.t().dot(&xw), xw.t().dot(&zw))
}

/// Solves `H b = rhs` for a symmetric positive semi-definite `H`.
///
/// Uses a Cholesky factorization and falls back to an eigendecomposition
/// pseudo-inverse when `H` is numerically singular.
pub fn solve_symmetric(h: &Array2<f64>, rhs: &Array1<f64>) -> Result<Array1<f64>, EstimationError> {
    match h.cholesky(Side::Lower) {
        Ok(factor) => Ok(factor.solve_vec(rhs)),
        Err(_) => Ok(pseudo_inverse(h)?.dot(rhs)),
    }
}

/// Moore-Penrose inverse of a symmetric matrix, dropping eigenvalues below a
/// relative tolerance.
pub fn pseudo_inverse(h: &Array2<f64>) -> Result<Array2<f64>, EstimationError> {
    let (values, vectors) = h.eigh(Side::Lower)?;
    let max_abs = values.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let tol = max_abs * 1e-12 * values.len() as f64;
    let inv_values = values.mapv(|v| if v > tol { 1.0 / v } else { 0.0 });
    let scaled = &vectors * &inv_values.view().insert_axis(Axis(0));
    Ok(scaled.dot(&vectors.t()))
}
