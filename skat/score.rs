//! Score statistics for a batch of phenotypes.
//!
//! Both parameterizations compute the same Rao-type score, scaled by the residual
//! degrees of freedom `n - p`:
//!
//! ```text
//! r = (S·y)ᵗ · K · (S·y) / (S·y)ᵗ · y · (n - p)
//! ```
//!
//! All columns are reduced at once; there is no per-column control flow.

use crate::covariates::{CovariateProjector, ProjectionError};
use crate::spectrum::KernelStructure;
use ndarray::{Array1, ArrayView2, Axis, Zip};

/// A column keeps less than this fraction of its energy after projection only when
/// the covariates explain it entirely.
const DEGENERATE_RESIDUAL: f64 = 1e-12;

/// `‖Zᵗ·S·y‖² / ‖S·y‖² · (n - p)` or `(S·y)ᵗ·SKS·(S·y) / (S·y)ᵗ·y · (n - p)` per column.
///
/// Columns removed entirely by the projection (including all-zero columns) score
/// `NaN`; callers decide how to report them.
pub fn compute_scores(
    structure: &KernelStructure,
    projector: &CovariateProjector,
    phenotypes: ArrayView2<f64>,
) -> Result<Array1<f64>, ProjectionError> {
    let residual_dof = projector.n().saturating_sub(projector.p()) as f64;
    let projected = projector.project_matrix(phenotypes)?;

    let (numerators, denominators) = match structure {
        KernelStructure::LowRank { factor, .. } => {
            let loadings = factor.t().dot(&projected);
            (
                loadings.mapv(|v| v * v).sum_axis(Axis(0)),
                projected.mapv(|v| v * v).sum_axis(Axis(0)),
            )
        }
        KernelStructure::FullKernel { projected: sks } => {
            let quadratic = sks.dot(&projected) * &projected;
            (
                quadratic.sum_axis(Axis(0)),
                (&projected * &phenotypes).sum_axis(Axis(0)),
            )
        }
    };

    let energy = phenotypes.mapv(|v| v * v).sum_axis(Axis(0));
    let mut scores = numerators / &denominators * residual_dof;
    Zip::from(&mut scores)
        .and(&denominators)
        .and(&energy)
        .for_each(|score, &denominator, &raw| {
            if !(denominator > DEGENERATE_RESIDUAL * raw) {
                *score = f64::NAN;
            }
        });
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::{reduce_full_kernel, reduce_low_rank};
    use approx::assert_relative_eq;
    use ndarray::{Array2, array};

    #[test]
    fn orthogonal_phenotype_scores_zero() {
        let z = array![[1.0, 0.0], [0.0, 1.0], [0.0, 0.0], [0.0, 0.0]];
        let projector = CovariateProjector::new(4, None, false).unwrap();
        let (structure, _) = reduce_low_rank(z.view(), &projector, 1e-4, None).unwrap();
        let y = array![[0.0], [0.0], [1.0], [1.0]];
        let scores = compute_scores(&structure, &projector, y.view()).unwrap();
        assert_eq!(scores[0], 0.0);
    }

    #[test]
    fn hand_computed_low_rank_score() {
        let z = array![[1.0, 0.0], [0.0, 1.0], [0.0, 0.0], [0.0, 0.0]];
        let projector = CovariateProjector::new(4, None, false).unwrap();
        let (structure, _) = reduce_low_rank(z.view(), &projector, 1e-4, None).unwrap();
        // Zᵗy = [1, 2], ‖Zᵗy‖² = 5, ‖y‖² = 10, n - p = 4.
        let y = array![[1.0], [2.0], [2.0], [1.0]];
        let scores = compute_scores(&structure, &projector, y.view()).unwrap();
        assert_relative_eq!(scores[0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn parameterizations_agree_column_by_column() {
        let z = array![
            [1.0, 0.2],
            [0.5, -1.0],
            [-0.3, 0.8],
            [1.2, 0.1],
            [-0.9, -0.4],
            [0.0, 1.5],
        ];
        let kernel = z.dot(&z.t());
        let covariates = array![[0.1], [0.4], [-0.2], [0.9], [-0.5], [0.3]];
        let projector = CovariateProjector::new(6, Some(covariates.view()), true).unwrap();
        let (low, _) = reduce_low_rank(z.view(), &projector, 1e-4, None).unwrap();
        let (full, _) = reduce_full_kernel(kernel.view(), &projector, 1e-4, None).unwrap();

        let phenotypes: Array2<f64> = array![
            [0.3, -1.0, 2.0],
            [1.1, 0.5, 0.0],
            [-0.7, 0.2, 1.0],
            [0.4, 1.5, -1.0],
            [2.0, -0.3, 0.5],
            [-1.2, 0.8, 0.0],
        ];
        let a = compute_scores(&low, &projector, phenotypes.view()).unwrap();
        let b = compute_scores(&full, &projector, phenotypes.view()).unwrap();
        assert_eq!(a.len(), 3);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_relative_eq!(*x, *y, max_relative = 1e-9);
        }
    }

    #[test]
    fn constant_phenotype_is_degenerate_under_intercept() {
        let z = array![[1.0], [2.0], [3.0]];
        let projector = CovariateProjector::new(3, None, true).unwrap();
        let (structure, _) = reduce_low_rank(z.view(), &projector, 1e-4, None).unwrap();
        let y = array![[2.0], [2.0], [2.0]];
        let scores = compute_scores(&structure, &projector, y.view()).unwrap();
        assert!(scores[0].is_nan());

        let zero = array![[0.0], [0.0], [0.0]];
        let scores = compute_scores(&structure, &projector, zero.view()).unwrap();
        assert!(scores[0].is_nan());
    }

    #[test]
    fn constant_phenotype_is_degenerate_for_full_kernel() {
        let z: Array2<f64> = array![[1.0], [2.0], [3.0], [-1.0]];
        let kernel = z.dot(&z.t());
        let projector = CovariateProjector::new(4, None, true).unwrap();
        let (structure, _) = reduce_full_kernel(kernel.view(), &projector, 1e-4, None).unwrap();
        let y = array![[5.0, 0.0, 1.0], [5.0, 0.0, -1.0], [5.0, 0.0, 2.0], [5.0, 0.0, 0.0]];
        let scores = compute_scores(&structure, &projector, y.view()).unwrap();
        assert!(scores[0].is_nan());
        assert!(scores[1].is_nan());
        assert!(scores[2].is_finite());
        assert!(scores[2] >= 0.0);
    }
}
