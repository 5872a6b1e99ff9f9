//! # Spectral Reduction of the Covariate-Projected Kernel
//!
//! Both parameterizations end in the same [`Spectrum`]:
//!
//! - `phis`: eigenvalues of `S·K·S`, clamped to zero below the threshold and sorted
//!   in descending order,
//! - `k`: the number of strictly positive `phis`,
//! - `q`: `dim(ker(S·K·S) ∩ col(S))`, computed as `n - rank([K | X])`.
//!
//! The low-rank form never forms `K`; the eigenvalues of `S·Z·Zᵗ·S` are the squared
//! singular values of `S·Z`. The full-kernel form keeps `S·K·S` around because the
//! score statistic and the exact p-value both reuse it.

use crate::covariates::{CovariateProjector, ProjectionError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate};
use ndarray_linalg::{EigValsh, SVD, UPLO};
use thiserror::Error;

/// Error type for the spectral reduction.
#[derive(Error, Debug)]
pub enum SpectrumError {
    #[error("The kernel matrix must be square, but has shape ({rows}, {cols}).")]
    NonSquareKernel { rows: usize, cols: usize },

    #[error("Supplied spectrum is invalid: {0}")]
    InvalidSpectrum(String),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error("Spectral decomposition failed: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
}

/// Eigen-structure of the projected kernel, computed once per test object.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    phis: Array1<f64>,
    rank: usize,
    null_overlap: usize,
}

impl Spectrum {
    /// Eigenvalues, descending, all `>= 0`.
    pub fn phis(&self) -> ArrayView1<'_, f64> {
        self.phis.view()
    }

    /// `k`: number of strictly positive eigenvalues.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// `q`: dimension of the kernel null space inside the residual space.
    pub fn null_overlap(&self) -> usize {
        self.null_overlap
    }

    /// The leading `k` eigenvalues, i.e. the strictly positive ones.
    pub fn positive(&self) -> ArrayView1<'_, f64> {
        self.phis.slice(ndarray::s![..self.rank])
    }
}

/// The random-effect structure retained after reduction.
#[derive(Debug, Clone)]
pub enum KernelStructure {
    /// `Z` and `S·Z`.
    LowRank {
        factor: Array2<f64>,
        projected: Array2<f64>,
    },
    /// `S·K·S`.
    FullKernel { projected: Array2<f64> },
}

/// Which parameterization a test object was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureKind {
    LowRank,
    FullKernel,
}

impl KernelStructure {
    pub fn kind(&self) -> StructureKind {
        match self {
            KernelStructure::LowRank { .. } => StructureKind::LowRank,
            KernelStructure::FullKernel { .. } => StructureKind::FullKernel,
        }
    }

    /// `S·K·S`, materialized for the low-rank form as `(S·Z)·(S·Z)ᵗ`.
    pub fn projected_kernel(&self) -> Array2<f64> {
        match self {
            KernelStructure::LowRank { projected, .. } => projected.dot(&projected.t()),
            KernelStructure::FullKernel { projected } => projected.clone(),
        }
    }
}

/// Reduces a random-covariate factor `Z` (`n × m`).
///
/// A supplied spectrum bypasses the SVD of `S·Z`; `k` and `q` are still derived.
pub fn reduce_low_rank(
    factor: ArrayView2<f64>,
    projector: &CovariateProjector,
    zero_threshold: f64,
    supplied: Option<Array1<f64>>,
) -> Result<(KernelStructure, Spectrum), SpectrumError> {
    let n = projector.n();
    let projected = projector.project_matrix(factor)?;

    let phis = match supplied {
        Some(phis) => validate_supplied(phis, n)?,
        None => {
            let (_, singular_values, _) = projected.svd(false, false)?;
            let mut eigenvalues: Vec<f64> = singular_values.iter().map(|s| s * s).collect();
            eigenvalues.resize(eigenvalues.len().max(n), 0.0);
            clamp_and_sort(eigenvalues, zero_threshold)
        }
    };

    let spectrum = finish(factor, projector, phis, zero_threshold)?;
    log::debug!(
        "Low-rank reduction: n={}, m={}, k={}, q={}",
        n,
        factor.ncols(),
        spectrum.rank,
        spectrum.null_overlap
    );

    Ok((
        KernelStructure::LowRank {
            factor: factor.to_owned(),
            projected,
        },
        spectrum,
    ))
}

/// Reduces a full symmetric kernel `K` (`n × n`).
pub fn reduce_full_kernel(
    kernel: ArrayView2<f64>,
    projector: &CovariateProjector,
    zero_threshold: f64,
    supplied: Option<Array1<f64>>,
) -> Result<(KernelStructure, Spectrum), SpectrumError> {
    let (rows, cols) = kernel.dim();
    if rows != cols {
        return Err(SpectrumError::NonSquareKernel { rows, cols });
    }
    let n = projector.n();

    // S·K, then S·(S·K)ᵗ = S·Kᵗ·S; the transpose of that is S·K·S.
    let row_projected = projector.project_matrix(kernel)?;
    let projected = projector
        .project_matrix(row_projected.t())?
        .reversed_axes();

    let phis = match supplied {
        Some(phis) => validate_supplied(phis, n)?,
        None => {
            let eigenvalues = projected.eigvalsh(UPLO::Lower)?;
            clamp_and_sort(eigenvalues.to_vec(), zero_threshold)
        }
    };

    let spectrum = finish(kernel, projector, phis, zero_threshold)?;
    log::debug!(
        "Full-kernel reduction: n={}, k={}, q={}",
        n,
        spectrum.rank,
        spectrum.null_overlap
    );

    Ok((KernelStructure::FullKernel { projected }, spectrum))
}

fn finish(
    structure: ArrayView2<f64>,
    projector: &CovariateProjector,
    phis: Array1<f64>,
    zero_threshold: f64,
) -> Result<Spectrum, SpectrumError> {
    let rank = phis.iter().filter(|&&phi| phi > 0.0).count();
    let null_overlap = null_overlap(structure, projector, phis.view(), zero_threshold)?;
    Ok(Spectrum {
        phis,
        rank,
        null_overlap,
    })
}

/// `q = n - rank([K | X])`; without covariates `q = n - #{phi > threshold}`.
fn null_overlap(
    structure: ArrayView2<f64>,
    projector: &CovariateProjector,
    phis: ArrayView1<f64>,
    zero_threshold: f64,
) -> Result<usize, SpectrumError> {
    let n = projector.n();
    let rank = match projector.covariates() {
        Some(design) => {
            let stacked = concatenate(Axis(1), &[structure.view(), design]).map_err(|_| {
                ProjectionError::ShapeMismatch {
                    expected: n,
                    found: structure.nrows(),
                }
            })?;
            let (_, singular_values, _) = stacked.svd(false, false)?;
            singular_values
                .iter()
                .filter(|&&s| s > zero_threshold)
                .count()
        }
        None => phis.iter().filter(|&&phi| phi > zero_threshold).count(),
    };
    Ok(n.saturating_sub(rank))
}

/// Zeroes every value below `threshold` (negative round-off included) and sorts
/// in descending order.
fn clamp_and_sort(mut values: Vec<f64>, threshold: f64) -> Array1<f64> {
    for value in values.iter_mut() {
        if *value < threshold {
            *value = 0.0;
        }
    }
    values.sort_by(|a, b| b.total_cmp(a));
    Array1::from_vec(values)
}

fn validate_supplied(phis: Array1<f64>, n: usize) -> Result<Array1<f64>, SpectrumError> {
    if phis.len() > n {
        return Err(SpectrumError::InvalidSpectrum(format!(
            "{} eigenvalues supplied for {} samples",
            phis.len(),
            n
        )));
    }
    if let Some((index, value)) = phis
        .iter()
        .enumerate()
        .find(|(_, value)| !value.is_finite() || **value < 0.0)
    {
        return Err(SpectrumError::InvalidSpectrum(format!(
            "eigenvalue {index} is {value}; expected a finite, non-negative value"
        )));
    }
    let mut values = phis.to_vec();
    values.sort_by(|a, b| b.total_cmp(a));
    Ok(Array1::from_vec(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn factor() -> Array2<f64> {
        array![
            [1.0, 0.2],
            [0.5, -1.0],
            [-0.3, 0.8],
            [1.2, 0.1],
            [-0.9, -0.4],
            [0.0, 1.5],
        ]
    }

    #[test]
    fn low_rank_spectrum_is_padded_sorted_and_non_negative() {
        let projector = CovariateProjector::new(6, None, true).unwrap();
        let (_, spectrum) = reduce_low_rank(factor().view(), &projector, 1e-4, None).unwrap();
        let phis = spectrum.phis();
        assert_eq!(phis.len(), 6);
        assert!(phis.iter().all(|&phi| phi >= 0.0));
        assert!(phis.windows(2).into_iter().all(|w| w[0] >= w[1]));
        assert_eq!(spectrum.rank(), 2);
        // Intercept plus two generic factor columns: rank([Z | 1]) = 3.
        assert_eq!(spectrum.null_overlap(), 3);
    }

    #[test]
    fn no_covariates_gives_q_equal_to_n_minus_k() {
        let projector = CovariateProjector::new(6, None, false).unwrap();
        let (_, spectrum) = reduce_low_rank(factor().view(), &projector, 1e-4, None).unwrap();
        assert_eq!(spectrum.rank(), 2);
        assert_eq!(spectrum.null_overlap(), 4);
    }

    #[test]
    fn full_kernel_matches_low_rank_spectrum() {
        let z = factor();
        let kernel = z.dot(&z.t());
        let projector = CovariateProjector::new(6, None, true).unwrap();
        let (_, low) = reduce_low_rank(z.view(), &projector, 1e-4, None).unwrap();
        let (_, full) = reduce_full_kernel(kernel.view(), &projector, 1e-4, None).unwrap();
        assert_abs_diff_eq!(low.phis(), full.phis(), epsilon = 1e-9);
        assert_eq!(low.rank(), full.rank());
        assert_eq!(low.null_overlap(), full.null_overlap());
    }

    #[test]
    fn full_kernel_projection_is_symmetric() {
        let z = factor();
        let kernel = z.dot(&z.t());
        let projector = CovariateProjector::new(6, None, true).unwrap();
        let (structure, _) = reduce_full_kernel(kernel.view(), &projector, 1e-4, None).unwrap();
        let sks = structure.projected_kernel();
        assert_abs_diff_eq!(sks.view(), sks.t(), epsilon = 1e-12);
        // Columns are centered by the intercept projection.
        assert_abs_diff_eq!(
            sks.sum_axis(Axis(0)),
            Array1::<f64>::zeros(6),
            epsilon = 1e-10
        );
    }

    #[test]
    fn non_square_kernel_is_rejected() {
        let projector = CovariateProjector::new(6, None, true).unwrap();
        let err = reduce_full_kernel(factor().view(), &projector, 1e-4, None).unwrap_err();
        assert!(matches!(
            err,
            SpectrumError::NonSquareKernel { rows: 6, cols: 2 }
        ));
    }

    #[test]
    fn supplied_spectrum_is_sorted_and_validated() {
        let projector = CovariateProjector::new(6, None, false).unwrap();
        let (_, spectrum) = reduce_low_rank(
            factor().view(),
            &projector,
            1e-4,
            Some(array![0.0, 2.0, 0.0, 5.0, 0.0, 0.0]),
        )
        .unwrap();
        assert_eq!(spectrum.phis(), array![5.0, 2.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(spectrum.rank(), 2);

        let err = reduce_low_rank(factor().view(), &projector, 1e-4, Some(array![1.0, -1.0]))
            .unwrap_err();
        assert!(matches!(err, SpectrumError::InvalidSpectrum(_)));
    }

    #[test]
    fn clamp_zeroes_small_and_negative_values() {
        let clamped = clamp_and_sort(vec![1e-6, -1e-12, 3.0, 5e-5, 0.2], 1e-4);
        assert_eq!(clamped, array![3.0, 0.2, 0.0, 0.0, 0.0]);
    }
}
