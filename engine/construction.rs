use crate::basis::{
    create_bspline_basis, create_difference_penalty_matrix, evaluate_bspline_basis,
    random_effect_block, sum_to_zero_transform,
};
use crate::data::{CovariateFrame, ObservationSet, value_range};
use crate::model::ModelError;
use crate::terms::{ModelFormula, TermKind, TermSpec};
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use std::ops::Range;

/// Everything needed to rebuild one term's columns for new data.
#[derive(Debug, Clone)]
pub enum BuiltTerm {
    Smooth {
        knots: Array1<f64>,
        degree: usize,
        /// Sum-to-zero reparameterization `Z`; columns of the term are `B * Z`.
        constraint: Array2<f64>,
    },
    Linear {
        center: f64,
    },
    RandomEffect {
        /// Sorted training levels.
        levels: Vec<String>,
    },
}

/// One term of the model and the coefficients it owns.
#[derive(Debug, Clone)]
pub struct TermBlock {
    pub spec: TermSpec,
    pub built: BuiltTerm,
    pub col_range: Range<usize>,
    /// Index into the penalty list, `None` for unpenalized terms.
    pub penalty_idx: Option<usize>,
}

/// Holds the layout of the design matrix `X` and penalty matrices `S_i`.
#[derive(Debug, Clone)]
pub struct ModelLayout {
    pub intercept_col: usize,
    pub blocks: Vec<TermBlock>,
    pub total_coeffs: usize,
    pub num_penalties: usize,
    /// Rank of each penalty matrix, in penalty order.
    pub penalty_ranks: Vec<usize>,
}

impl ModelLayout {
    /// Linear-predictor matrix for a covariate table, using the training bases.
    pub fn prediction_matrix(&self, frame: &CovariateFrame) -> Result<Array2<f64>, ModelError> {
        let n = frame.n_rows();
        let mut x = Array2::zeros((n, self.total_coeffs));
        x.column_mut(self.intercept_col).fill(1.0);
        for block in &self.blocks {
            let columns = match &block.built {
                BuiltTerm::Smooth {
                    knots,
                    degree,
                    constraint,
                } => {
                    let values = frame.column(&block.spec.covariate)?;
                    evaluate_bspline_basis(values, knots.view(), *degree)?.dot(constraint)
                }
                BuiltTerm::Linear { center } => {
                    let values = frame.column(&block.spec.covariate)?;
                    centered_column(values, *center)
                }
                BuiltTerm::RandomEffect { levels } => random_effect_block(frame.census(), levels),
            };
            if columns.ncols() != block.col_range.len() {
                return Err(ModelError::InternalStackingError {
                    found: columns.ncols(),
                    expected: block.col_range.len(),
                });
            }
            x.slice_mut(s![.., block.col_range.clone()]).assign(&columns);
        }
        Ok(x)
    }

    /// Coefficient names in column order.
    pub fn coefficient_names(&self) -> Vec<String> {
        let mut names = vec![String::new(); self.total_coeffs];
        names[self.intercept_col] = "(Intercept)".to_string();
        for block in &self.blocks {
            let label = block.spec.label();
            match &block.built {
                BuiltTerm::Linear { .. } => names[block.col_range.start] = label,
                BuiltTerm::Smooth { .. } => {
                    for (i, col) in block.col_range.clone().enumerate() {
                        names[col] = format!("{label}.{}", i + 1);
                    }
                }
                BuiltTerm::RandomEffect { levels } => {
                    for (level, col) in levels.iter().zip(block.col_range.clone()) {
                        names[col] = format!("{label}.{level}");
                    }
                }
            }
        }
        names
    }

    pub fn penalized_blocks(&self) -> impl Iterator<Item = &TermBlock> {
        self.blocks.iter().filter(|b| b.penalty_idx.is_some())
    }
}

fn centered_column(values: ArrayView1<f64>, center: f64) -> Array2<f64> {
    values.mapv(|v| v - center).insert_axis(Axis(1))
}

/// Constructs the design matrix `X` and the list of penalty matrices `S_i`
/// (each embedded in the full `p x p` coefficient space).
pub fn build_design_and_penalty_matrices(
    observations: &ObservationSet,
    formula: &ModelFormula,
) -> Result<(Array2<f64>, Vec<Array2<f64>>, ModelLayout), ModelError> {
    let frame = &observations.covariates;
    let n = frame.n_rows();

    let mut pieces: Vec<(Array2<f64>, Option<Array2<f64>>, usize)> = Vec::new();
    let mut built_terms = Vec::with_capacity(formula.terms.len());

    for spec in &formula.terms {
        match spec.kind {
            TermKind::Smooth {
                basis_size,
                degree,
                penalty_order,
            } => {
                let values = frame.column(&spec.covariate)?;
                let range = value_range(values).unwrap_or((0.0, 0.0));
                let num_internal_knots = basis_size - degree - 1;
                let (basis, knots) =
                    create_bspline_basis(values, range, num_internal_knots, degree)?;
                let z = sum_to_zero_transform(basis.view())?;
                let columns = basis.dot(&z);
                let penalty = z
                    .t()
                    .dot(&create_difference_penalty_matrix(basis_size, penalty_order)?)
                    .dot(&z);
                let penalty = scale_penalty(penalty, &columns);
                pieces.push((columns, Some(penalty), basis_size - penalty_order));
                built_terms.push(BuiltTerm::Smooth {
                    knots,
                    degree,
                    constraint: z,
                });
            }
            TermKind::Linear => {
                let values = frame.column(&spec.covariate)?;
                let center = values.mean().unwrap_or(0.0);
                pieces.push((centered_column(values, center), None, 0));
                built_terms.push(BuiltTerm::Linear { center });
            }
            TermKind::RandomEffect => {
                let mut levels: Vec<String> = frame.census().to_vec();
                levels.sort();
                levels.dedup();
                let columns = random_effect_block(frame.census(), &levels);
                let penalty = scale_penalty(Array2::eye(levels.len()), &columns);
                let rank = levels.len();
                pieces.push((columns, Some(penalty), rank));
                built_terms.push(BuiltTerm::RandomEffect { levels });
            }
        }
    }

    let total_coeffs = 1 + pieces.iter().map(|(c, _, _)| c.ncols()).sum::<usize>();
    let mut x = Array2::zeros((n, total_coeffs));
    x.column_mut(0).fill(1.0);

    let mut s_list = Vec::new();
    let mut penalty_ranks = Vec::new();
    let mut blocks = Vec::with_capacity(pieces.len());
    let mut current_col = 1;
    for ((columns, penalty, rank), (spec, built)) in pieces
        .into_iter()
        .zip(formula.terms.iter().zip(built_terms))
    {
        let col_range = current_col..current_col + columns.ncols();
        x.slice_mut(s![.., col_range.clone()]).assign(&columns);
        let penalty_idx = penalty.map(|local| {
            let mut full = Array2::zeros((total_coeffs, total_coeffs));
            full.slice_mut(s![col_range.clone(), col_range.clone()])
                .assign(&local);
            s_list.push(full);
            penalty_ranks.push(rank);
            s_list.len() - 1
        });
        current_col = col_range.end;
        blocks.push(TermBlock {
            spec: spec.clone(),
            built,
            col_range,
            penalty_idx,
        });
    }

    let layout = ModelLayout {
        intercept_col: 0,
        blocks,
        total_coeffs,
        num_penalties: s_list.len(),
        penalty_ranks,
    };
    Ok((x, s_list, layout))
}

/// Rescales a penalty so its Frobenius norm matches that of `X_j' X_j`, which
/// puts all smoothing parameters on a comparable scale.
fn scale_penalty(penalty: Array2<f64>, columns: &Array2<f64>) -> Array2<f64> {
    let gram_norm = columns.t().dot(columns).iter().map(|v| v * v).sum::<f64>().sqrt();
    let penalty_norm = penalty.iter().map(|v| v * v).sum::<f64>().sqrt();
    if gram_norm > 0.0 && penalty_norm > 0.0 {
        penalty * (gram_norm / penalty_norm)
    } else {
        penalty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnConfig, FittingConfig};
    use crate::data::Observation;
    use crate::model::ModelKind;
    use crate::terms::build_formula;
    use approx::assert_abs_diff_eq;
    use std::collections::BTreeMap;

    fn observations() -> ObservationSet {
        let records: Vec<Observation> = (0..40)
            .map(|i| Observation {
                group: "a".to_string(),
                plot: "p".to_string(),
                census: if i % 2 == 0 { "1" } else { "2" }.to_string(),
                site: String::new(),
                covariates: BTreeMap::from([
                    ("con_dens".to_string(), (i % 10) as f64),
                    ("height".to_string(), 1.0 + 0.25 * i as f64),
                    ("tot_dens".to_string(), (i % 3) as f64),
                ]),
                exposure: 5.0,
                outcome: i % 4 == 0,
            })
            .collect();
        ObservationSet::from_observations(&records).unwrap()
    }

    #[test]
    fn layout_matches_design_and_penalties() {
        let obs = observations();
        let formula = build_formula(
            &obs,
            &ColumnConfig::default(),
            &FittingConfig::default(),
            ModelKind::Full,
        );
        let (x, s_list, layout) = build_design_and_penalty_matrices(&obs, &formula).unwrap();

        // height k=10 -> 9 cols, tot_dens linear -> 1, con_dens k=8 -> 7, census 2 levels -> 2
        assert_eq!(layout.total_coeffs, 1 + 9 + 1 + 7 + 2);
        assert_eq!(x.dim(), (40, layout.total_coeffs));
        assert_eq!(s_list.len(), 3);
        assert_eq!(layout.penalty_ranks, vec![8, 6, 2]);
        for s in &s_list {
            assert_eq!(s.dim(), (layout.total_coeffs, layout.total_coeffs));
            assert_abs_diff_eq!(s.row(0).sum(), 0.0);
        }

        for block in &layout.blocks {
            if let BuiltTerm::Smooth { .. } = block.built {
                let sums = x.slice(s![.., block.col_range.clone()]).sum_axis(Axis(0));
                for v in sums {
                    assert_abs_diff_eq!(v, 0.0, epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn prediction_matrix_reproduces_training_design() {
        let obs = observations();
        let formula = build_formula(
            &obs,
            &ColumnConfig::default(),
            &FittingConfig::default(),
            ModelKind::Full,
        );
        let (x, _, layout) = build_design_and_penalty_matrices(&obs, &formula).unwrap();
        let rebuilt = layout.prediction_matrix(&obs.covariates).unwrap();
        assert_abs_diff_eq!(x, rebuilt, epsilon = 1e-12);

        let names = layout.coefficient_names();
        assert_eq!(names[0], "(Intercept)");
        assert_eq!(names[1], "s(height).1");
        assert_eq!(names[10], "tot_dens");
        assert_eq!(names.last().unwrap(), "re(census).2");
    }

    #[test]
    fn missing_covariate_is_reported() {
        let obs = observations();
        let formula = build_formula(
            &obs,
            &ColumnConfig::default(),
            &FittingConfig::default(),
            ModelKind::Full,
        );
        let (_, _, layout) = build_design_and_penalty_matrices(&obs, &formula).unwrap();
        let frame = CovariateFrame::new(BTreeMap::new(), vec!["1".to_string()]).unwrap();
        assert!(matches!(
            layout.prediction_matrix(&frame),
            Err(ModelError::DataError(_))
        ));
    }
}
