use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use thiserror::Error;

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Spline degree must be at least 1, but was {0}.")]
    InvalidDegree(usize),

    #[error("Data range is invalid: start ({0}) must be strictly less than end ({1}).")]
    InvalidRange(f64, f64),

    #[error(
        "Penalty order ({order}) must be positive and less than the number of basis functions ({num_basis})."
    )]
    InvalidPenaltyOrder { order: usize, num_basis: usize },

    #[error("Cannot constrain a basis with {0} columns; at least 2 are required.")]
    TooFewColumnsForConstraint(usize),

    #[error("Knot vector of length {knots} is too short for degree {degree}.")]
    KnotVectorTooShort { knots: usize, degree: usize },
}

/// Creates a B-spline basis expansion matrix and its corresponding knot vector.
///
/// Interior knots are spaced uniformly across `data_range`, which must be the
/// range of the training data so that prediction reuses the same basis.
///
/// Returns the basis matrix of shape `[data.len(), num_internal_knots + degree + 1]`
/// and the full knot vector (boundary knots repeated `degree + 1` times).
pub fn create_bspline_basis(
    data: ArrayView1<f64>,
    data_range: (f64, f64),
    num_internal_knots: usize,
    degree: usize,
) -> Result<(Array2<f64>, Array1<f64>), BasisError> {
    if degree < 1 {
        return Err(BasisError::InvalidDegree(degree));
    }
    if !(data_range.0 < data_range.1) {
        return Err(BasisError::InvalidRange(data_range.0, data_range.1));
    }

    let knot_vector = internal::generate_full_knot_vector(data_range, num_internal_knots, degree);
    let basis_matrix = evaluate_bspline_basis(data, knot_vector.view(), degree)?;
    Ok((basis_matrix, knot_vector))
}

/// Evaluates a B-spline basis on `data` for an existing knot vector.
///
/// Points outside the boundary knots are extrapolated linearly from the
/// boundary, so every basis function continues along its boundary tangent.
pub fn evaluate_bspline_basis(
    data: ArrayView1<f64>,
    knots: ArrayView1<f64>,
    degree: usize,
) -> Result<Array2<f64>, BasisError> {
    if degree < 1 {
        return Err(BasisError::InvalidDegree(degree));
    }
    if knots.len() < 2 * (degree + 1) {
        return Err(BasisError::KnotVectorTooShort {
            knots: knots.len(),
            degree,
        });
    }
    let num_basis_functions = knots.len() - degree - 1;
    let lower = knots[0];
    let upper = knots[knots.len() - 1];
    if !(lower < upper) {
        return Err(BasisError::InvalidRange(lower, upper));
    }
    let h = (upper - lower) * 1e-6;

    let mut basis_matrix = Array2::zeros((data.len(), num_basis_functions));
    for (i, &x) in data.iter().enumerate() {
        let row = if x > upper {
            let at_edge = internal::evaluate_splines_at_point(upper, degree, knots);
            let inside = internal::evaluate_splines_at_point(upper - h, degree, knots);
            let slope = (&at_edge - &inside) / h;
            at_edge + slope * (x - upper)
        } else if x < lower {
            let at_edge = internal::evaluate_splines_at_point(lower, degree, knots);
            let inside = internal::evaluate_splines_at_point(lower + h, degree, knots);
            let slope = (&inside - &at_edge) / h;
            at_edge + slope * (x - lower)
        } else {
            internal::evaluate_splines_at_point(x, degree, knots)
        };
        basis_matrix.row_mut(i).assign(&row);
    }
    Ok(basis_matrix)
}

/// Creates a penalty matrix `S = D' * D` where `D` takes `order`-th differences
/// of adjacent coefficients (P-spline penalty).
pub fn create_difference_penalty_matrix(
    num_basis_functions: usize,
    order: usize,
) -> Result<Array2<f64>, BasisError> {
    if order == 0 || order >= num_basis_functions {
        return Err(BasisError::InvalidPenaltyOrder {
            order,
            num_basis: num_basis_functions,
        });
    }

    let mut d = Array2::<f64>::eye(num_basis_functions);
    for _ in 0..order {
        d = &d.slice(s![1.., ..]) - &d.slice(s![..-1, ..]);
    }
    Ok(d.t().dot(&d))
}

/// Builds the transform `Z` (shape `[k, k - 1]`) whose columns span the space
/// orthogonal to `c = B' * 1`, so that `B * Z` sums to zero over the training rows.
///
/// `Z` is the trailing block of the Householder reflector that maps `c` onto
/// the first axis, so it has orthonormal columns.
pub fn sum_to_zero_transform(basis_matrix: ArrayView2<f64>) -> Result<Array2<f64>, BasisError> {
    let k = basis_matrix.ncols();
    if k < 2 {
        return Err(BasisError::TooFewColumnsForConstraint(k));
    }
    let c = basis_matrix.sum_axis(Axis(0));
    let norm = c.dot(&c).sqrt();

    let mut v = c.clone();
    let sign = if c[0] >= 0.0 { 1.0 } else { -1.0 };
    v[0] += sign * norm;
    let v_norm_sq = v.dot(&v);

    let mut householder = Array2::<f64>::eye(k);
    if v_norm_sq > 0.0 {
        for i in 0..k {
            for j in 0..k {
                householder[(i, j)] -= 2.0 * v[i] * v[j] / v_norm_sq;
            }
        }
    }
    Ok(householder.slice(s![.., 1..]).to_owned())
}

/// One-hot block for a categorical term. Columns follow `levels`; rows whose
/// value is not among `levels` get an all-zero row.
pub fn random_effect_block(values: &[String], levels: &[String]) -> Array2<f64> {
    let mut design = Array2::<f64>::zeros((values.len(), levels.len()));
    for (i, value) in values.iter().enumerate() {
        if let Ok(j) = levels.binary_search(value) {
            design[(i, j)] = 1.0;
        }
    }
    design
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    /// Generates the full knot vector, including repeated boundary knots.
    pub(super) fn generate_full_knot_vector(
        data_range: (f64, f64),
        num_internal_knots: usize,
        degree: usize,
    ) -> Array1<f64> {
        let (min_val, max_val) = data_range;
        let h = (max_val - min_val) / (num_internal_knots as f64 + 1.0);

        let mut knots = Vec::with_capacity(num_internal_knots + 2 * (degree + 1));
        knots.extend(std::iter::repeat_n(min_val, degree + 1));
        knots.extend((1..=num_internal_knots).map(|i| min_val + i as f64 * h));
        knots.extend(std::iter::repeat_n(max_val, degree + 1));
        Array1::from_vec(knots)
    }

    /// Evaluates all B-spline basis functions at a single point `x` inside the
    /// boundary knots using the Cox-de Boor recurrence.
    pub(super) fn evaluate_splines_at_point(
        x: f64,
        degree: usize,
        knots: ArrayView1<f64>,
    ) -> Array1<f64> {
        let num_knots = knots.len();
        let num_basis = num_knots - degree - 1;

        // Knot span `mu` with knots[mu] <= x < knots[mu+1], restricted to the
        // non-degenerate spans so the right boundary maps to the last span.
        let mu = knots
            .iter()
            .rposition(|&k| k <= x)
            .unwrap_or(degree)
            .clamp(degree, num_basis - 1);

        let mut b = Array1::zeros(degree + 1);
        b[0] = 1.0;

        for d in 1..=degree {
            let b_old = b.clone();
            b.fill(0.0);

            for i in 0..=d {
                let j = mu + i - d;

                // B_{j,d-1} lives at b_old[i - 1], B_{j+1,d-1} at b_old[i].
                if i > 0 {
                    let denom = knots[j + d] - knots[j];
                    if denom > 1e-12 {
                        b[i] += (x - knots[j]) / denom * b_old[i - 1];
                    }
                }
                if i < d {
                    let denom = knots[j + d + 1] - knots[j + 1];
                    if denom > 1e-12 {
                        b[i] += (knots[j + d + 1] - x) / denom * b_old[i];
                    }
                }
            }
        }

        let mut basis_values = Array1::zeros(num_basis);
        let start_index = mu - degree;
        for i in 0..=degree {
            basis_values[start_index + i] = b[i];
        }
        basis_values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array};

    #[test]
    fn test_knot_generation_uniform() {
        let knots = internal::generate_full_knot_vector((0.0, 10.0), 3, 2);
        assert_eq!(
            knots,
            array![0.0, 0.0, 0.0, 2.5, 5.0, 7.5, 10.0, 10.0, 10.0]
        );
    }

    #[test]
    fn test_penalty_matrix_creation() {
        let s = create_difference_penalty_matrix(5, 2).unwrap();
        let expected_s = array![
            [1., -2., 1., 0., 0.],
            [-2., 5., -4., 1., 0.],
            [1., -4., 6., -4., 1.],
            [0., 1., -4., 5., -2.],
            [0., 0., 1., -2., 1.]
        ];
        assert_abs_diff_eq!(s, expected_s, epsilon = 1e-12);
    }

    #[test]
    fn test_bspline_basis_sums_to_one_including_boundaries() {
        let data = Array::linspace(0.0, 10.0, 101);
        let (basis, _) = create_bspline_basis(data.view(), (0.0, 10.0), 6, 3).unwrap();
        for &sum in basis.sum_axis(Axis(1)).iter() {
            assert!((sum - 1.0).abs() < 1e-9, "Basis did not sum to 1, got {sum}");
        }
    }

    #[test]
    fn test_single_point_evaluation_degree_one() {
        let knots = array![0.0, 0.0, 1.0, 2.0, 2.0];
        let values = internal::evaluate_splines_at_point(0.5, 1, knots.view());
        assert!((values[0] - 0.5).abs() < 1e-12);
        assert!((values[1] - 0.5).abs() < 1e-12);
        assert!(values[2].abs() < 1e-12);
    }

    #[test]
    fn test_linear_extrapolation_beyond_range() {
        // Degree-1 basis on [0, 2] is exactly linear near the edges, so the
        // extrapolated rows must stay on the boundary lines.
        let (_, knots) = create_bspline_basis(array![0.0].view(), (0.0, 2.0), 1, 1).unwrap();
        let outside = evaluate_bspline_basis(array![3.0, -1.0].view(), knots.view(), 1).unwrap();
        assert!((outside[(0, 2)] - 2.0).abs() < 1e-6);
        assert!((outside[(0, 1)] + 1.0).abs() < 1e-6);
        assert!((outside[(1, 0)] - 2.0).abs() < 1e-6);
        assert!((outside[(1, 1)] + 1.0).abs() < 1e-6);
        for row in outside.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_sum_to_zero_transform_is_orthonormal_and_centres_columns() {
        let data = Array::linspace(0.0, 5.0, 40);
        let (basis, _) = create_bspline_basis(data.view(), (0.0, 5.0), 3, 3).unwrap();
        let z = sum_to_zero_transform(basis.view()).unwrap();
        assert_eq!(z.dim(), (basis.ncols(), basis.ncols() - 1));

        let gram = z.t().dot(&z);
        assert_abs_diff_eq!(gram, Array2::<f64>::eye(z.ncols()), epsilon = 1e-10);

        let constrained = basis.dot(&z);
        for &col_sum in constrained.sum_axis(Axis(0)).iter() {
            assert!(col_sum.abs() < 1e-9);
        }
    }

    #[test]
    fn test_random_effect_block_maps_known_levels_only() {
        let levels = vec!["1".to_string(), "2".to_string()];
        let values = vec!["2".to_string(), "3".to_string(), "1".to_string()];
        let block = random_effect_block(&values, &levels);
        assert_eq!(block, array![[0.0, 1.0], [0.0, 0.0], [1.0, 0.0]]);
    }

    #[test]
    fn test_error_conditions() {
        match create_bspline_basis(array![].view(), (0.0, 10.0), 5, 0).unwrap_err() {
            BasisError::InvalidDegree(deg) => assert_eq!(deg, 0),
            other => panic!("Expected InvalidDegree error, got {other:?}"),
        }
        match create_bspline_basis(array![].view(), (10.0, 0.0), 5, 1).unwrap_err() {
            BasisError::InvalidRange(start, end) => {
                assert_eq!(start, 10.0);
                assert_eq!(end, 0.0);
            }
            other => panic!("Expected InvalidRange error, got {other:?}"),
        }
        match create_difference_penalty_matrix(5, 5).unwrap_err() {
            BasisError::InvalidPenaltyOrder { order, num_basis } => {
                assert_eq!(order, 5);
                assert_eq!(num_basis, 5);
            }
            other => panic!("Expected InvalidPenaltyOrder error, got {other:?}"),
        }
    }
}
