//! # Model Formula Builder
//!
//! A per-group model is described by a typed list of term descriptors rather
//! than a formula string. The builder decides, from the shape of the group's
//! data, which terms enter the model and how flexible each smooth may be:
//!
//! - size and total density always get a smooth, the hazard covariate only in
//!   the full model;
//! - every smooth starts at the configured basis size and is capped at
//!   `distinct values - 2`; below 2 it becomes a linear term and the model is
//!   flagged as low-flexibility;
//! - a covariate that never varies within the group is left out;
//! - the census random effect is added only when the group spans enough censuses.

use crate::config::{ColumnConfig, FittingConfig};
use crate::data::{ObservationSet, count_distinct};
use crate::model::ModelKind;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    /// Penalized B-spline smooth with `basis_size` functions before the
    /// sum-to-zero constraint.
    Smooth {
        basis_size: usize,
        degree: usize,
        penalty_order: usize,
    },
    /// Unpenalized, centered linear effect.
    Linear,
    /// Ridge-penalized one-hot effect of the census key.
    RandomEffect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermSpec {
    pub covariate: String,
    pub kind: TermKind,
}

impl TermSpec {
    /// Smooth with basis size `k`, degree `min(3, k - 1)` and penalty order `min(2, k - 1)`.
    pub fn smooth(covariate: &str, basis_size: usize) -> Self {
        Self {
            covariate: covariate.to_string(),
            kind: TermKind::Smooth {
                basis_size,
                degree: 3.min(basis_size - 1),
                penalty_order: 2.min(basis_size - 1),
            },
        }
    }

    pub fn linear(covariate: &str) -> Self {
        Self {
            covariate: covariate.to_string(),
            kind: TermKind::Linear,
        }
    }

    pub fn random_effect(covariate: &str) -> Self {
        Self {
            covariate: covariate.to_string(),
            kind: TermKind::RandomEffect,
        }
    }

    /// Short label used in coefficient names and reports.
    pub fn label(&self) -> String {
        match self.kind {
            TermKind::Smooth { .. } => format!("s({})", self.covariate),
            TermKind::Linear => self.covariate.clone(),
            TermKind::RandomEffect => format!("re({})", self.covariate),
        }
    }
}

impl fmt::Display for TermSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TermKind::Smooth { basis_size, .. } => {
                write!(f, "s({}, k={})", self.covariate, basis_size)
            }
            TermKind::Linear => write!(f, "{}", self.covariate),
            TermKind::RandomEffect => write!(f, "s({}, bs=\"re\")", self.covariate),
        }
    }
}

/// The typed model description for one group and model kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFormula {
    pub kind: ModelKind,
    pub response: String,
    pub terms: Vec<TermSpec>,
    pub offset: String,
    pub low_flexibility: bool,
}

impl fmt::Display for ModelFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ~ 1", self.response)?;
        for term in &self.terms {
            write!(f, " + {term}")?;
        }
        write!(f, " + offset(log({}))", self.offset)
    }
}

/// Basis size after capping at `distinct - 2`.
pub fn capped_basis_size(distinct_values: usize, max_basis_size: usize) -> usize {
    max_basis_size.min(distinct_values.saturating_sub(2))
}

/// Whether the census key is worth a random effect for a group with `levels` censuses.
pub fn census_random_effect_applies(levels: usize, min_levels: usize) -> bool {
    levels >= min_levels.max(2)
}

/// Term for one continuous covariate, or `None` when it never varies.
/// The flag reports whether the term had to fall back to linear.
pub fn continuous_term(
    covariate: &str,
    distinct_values: usize,
    max_basis_size: usize,
) -> Option<(TermSpec, bool)> {
    if distinct_values < 2 {
        return None;
    }
    let k = capped_basis_size(distinct_values, max_basis_size);
    if k < 2 {
        Some((TermSpec::linear(covariate), true))
    } else {
        Some((TermSpec::smooth(covariate, k), false))
    }
}

/// Builds the formula of a full or reduced model for one group's observations.
pub fn build_formula(
    observations: &ObservationSet,
    columns: &ColumnConfig,
    fitting: &FittingConfig,
    kind: ModelKind,
) -> ModelFormula {
    let mut covariates = vec![columns.size.as_str(), columns.total_density.as_str()];
    if kind == ModelKind::Full {
        covariates.push(columns.hazard.as_str());
    }

    let mut terms = Vec::with_capacity(covariates.len() + 1);
    let mut low_flexibility = false;
    for covariate in covariates {
        let distinct = observations
            .covariates
            .column(covariate)
            .map(count_distinct)
            .unwrap_or(0);
        match continuous_term(covariate, distinct, fitting.max_basis_size) {
            Some((term, forced_linear)) => {
                if forced_linear {
                    log::debug!(
                        "'{covariate}' has only {distinct} distinct values; entering it as a linear term."
                    );
                }
                low_flexibility |= forced_linear;
                terms.push(term);
            }
            None => log::debug!("'{covariate}' is constant within the group; term omitted."),
        }
    }

    if census_random_effect_applies(observations.census_levels(), fitting.min_census_levels) {
        terms.push(TermSpec::random_effect(&columns.census));
    }

    ModelFormula {
        kind,
        response: columns.outcome.clone(),
        terms,
        offset: columns.exposure.clone(),
        low_flexibility,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Observation;
    use std::collections::BTreeMap;

    fn observations(hazard: &[f64], census: &[&str]) -> ObservationSet {
        let records: Vec<Observation> = hazard
            .iter()
            .zip(census)
            .enumerate()
            .map(|(i, (&h, &c))| Observation {
                group: "a".to_string(),
                plot: "p".to_string(),
                census: c.to_string(),
                site: String::new(),
                covariates: BTreeMap::from([
                    ("con_dens".to_string(), h),
                    ("height".to_string(), i as f64),
                    ("tot_dens".to_string(), (i % 7) as f64),
                ]),
                exposure: 5.0,
                outcome: i % 3 == 0,
            })
            .collect();
        ObservationSet::from_observations(&records).unwrap()
    }

    #[test]
    fn basis_size_is_capped_by_distinct_values() {
        assert_eq!(capped_basis_size(50, 10), 10);
        assert_eq!(capped_basis_size(8, 10), 6);
        assert_eq!(capped_basis_size(3, 10), 1);
        assert_eq!(capped_basis_size(1, 10), 0);
    }

    #[test]
    fn small_cap_forces_linear_term_and_flags_low_flexibility() {
        let hazard = [0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 0.0, 1.0, 2.0];
        let census = ["1"; 12];
        let formula = build_formula(
            &observations(&hazard, &census),
            &ColumnConfig::default(),
            &FittingConfig::default(),
            ModelKind::Full,
        );
        assert!(formula.low_flexibility);
        let hazard_term = formula
            .terms
            .iter()
            .find(|t| t.covariate == "con_dens")
            .unwrap();
        assert_eq!(hazard_term.kind, TermKind::Linear);
        assert_eq!(
            formula.terms[0].kind,
            TermKind::Smooth {
                basis_size: 10,
                degree: 3,
                penalty_order: 2
            }
        );
    }

    #[test]
    fn reduced_model_omits_hazard_and_census_needs_two_levels() {
        let hazard: Vec<f64> = (0..12).map(f64::from).collect();
        let one_census = ["1"; 12];
        let formula = build_formula(
            &observations(&hazard, &one_census),
            &ColumnConfig::default(),
            &FittingConfig::default(),
            ModelKind::Reduced,
        );
        assert!(formula.terms.iter().all(|t| t.covariate != "con_dens"));
        assert!(formula.terms.iter().all(|t| t.kind != TermKind::RandomEffect));

        let two_census = ["1", "2", "1", "2", "1", "2", "1", "2", "1", "2", "1", "2"];
        let formula = build_formula(
            &observations(&hazard, &two_census),
            &ColumnConfig::default(),
            &FittingConfig::default(),
            ModelKind::Full,
        );
        assert_eq!(formula.terms.last().unwrap().kind, TermKind::RandomEffect);
        assert!(!formula.low_flexibility);
        assert_eq!(
            formula.to_string(),
            "status ~ 1 + s(height, k=10) + s(tot_dens, k=5) + s(con_dens, k=10) + s(census, bs=\"re\") + offset(log(interval))"
        );
    }

    #[test]
    fn constant_covariate_is_omitted() {
        assert!(continuous_term("x", 1, 10).is_none());
        assert_eq!(
            continuous_term("x", 2, 10),
            Some((TermSpec::linear("x"), true))
        );
        assert!(!census_random_effect_applies(1, 2));
        assert!(census_random_effect_applies(2, 2));
    }
}
