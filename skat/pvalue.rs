//! # Null Distribution of the Score Statistic
//!
//! Under the null, `r ≥ r_obs` is equivalent to `Q = Σ αᵢ χ²₁ ≥ 0` for a weight
//! vector `α` that depends on `r_obs`. The methods differ only in how `α` is built:
//!
//! - [`PValueMethod::Recalibrated`] shifts the cached spectrum in closed form:
//!   `α = [φ₁ − c, …, φₖ − c, −c (q times)]` with `c = r / (n − p)`. No
//!   decomposition is repeated per statistic.
//! - [`PValueMethod::Exact`] re-decomposes `S·K·S − c·S` for every statistic. It is
//!   `O(n³)` per call and serves as the reference for the recalibrated shortcut.
//! - [`PValueMethod::Uncalibrated`] evaluates the raw spectrum at offset `r`
//!   (full kernel only). It is unstable for near-singular kernels.

use crate::covariates::CovariateProjector;
use crate::quadform::{QuadFormError, TailProbability};
use crate::spectrum::{KernelStructure, Spectrum, StructureKind};
use ndarray_linalg::{EigValsh, UPLO};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Eigenvalues at or below this are dropped before the uncalibrated tail call;
/// Davies' integration stalls on them.
const UNCALIBRATED_WEIGHT_FLOOR: f64 = 1e-10;

/// Error type for p-value computation.
#[derive(Error, Debug)]
pub enum PValueError {
    #[error("The {method} p-value is not defined for a {structure:?} test.")]
    UnsupportedMethod {
        method: PValueMethod,
        structure: StructureKind,
    },

    #[error("Eigendecomposition of the shifted kernel failed: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error("Tail probability evaluation failed: {0}")]
    TailProbability(#[from] QuadFormError),
}

/// Strategy for turning a statistic into a chi-square mixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PValueMethod {
    Recalibrated,
    Exact,
    Uncalibrated,
}

impl PValueMethod {
    pub fn supports(self, structure: StructureKind) -> bool {
        match self {
            PValueMethod::Recalibrated | PValueMethod::Exact => true,
            PValueMethod::Uncalibrated => structure == StructureKind::FullKernel,
        }
    }
}

impl fmt::Display for PValueMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PValueMethod::Recalibrated => "recalibrated",
            PValueMethod::Exact => "exact",
            PValueMethod::Uncalibrated => "uncalibrated",
        };
        f.write_str(name)
    }
}

/// `Pr(Σ weightsᵢ χ²₁ ≥ offset)` is the p-value.
#[derive(Debug, Clone, PartialEq)]
pub struct MixtureProblem {
    pub offset: f64,
    pub weights: Vec<f64>,
}

/// Builds the chi-square mixture whose upper tail at `offset` is the p-value of
/// `statistic`.
pub fn null_mixture(
    method: PValueMethod,
    structure: &KernelStructure,
    spectrum: &Spectrum,
    projector: &CovariateProjector,
    statistic: f64,
) -> Result<MixtureProblem, PValueError> {
    let residual_dof = projector.n().saturating_sub(projector.p()) as f64;
    let shift = statistic / residual_dof;

    match method {
        PValueMethod::Recalibrated => {
            let weights = spectrum
                .positive()
                .iter()
                .map(|&phi| phi - shift)
                .chain(std::iter::repeat_n(-shift, spectrum.null_overlap()))
                .collect();
            Ok(MixtureProblem {
                offset: 0.0,
                weights,
            })
        }
        PValueMethod::Exact => {
            let mut shifted = structure.projected_kernel();
            shifted.scaled_add(-shift, &projector.residual_operator());
            let mut weights = shifted.eigvalsh(UPLO::Lower)?.to_vec();
            weights.sort_by(|a, b| b.total_cmp(a));
            Ok(MixtureProblem {
                offset: 0.0,
                weights,
            })
        }
        PValueMethod::Uncalibrated => {
            if structure.kind() != StructureKind::FullKernel {
                return Err(PValueError::UnsupportedMethod {
                    method,
                    structure: structure.kind(),
                });
            }
            let weights = spectrum
                .phis()
                .iter()
                .copied()
                .filter(|&phi| phi > UNCALIBRATED_WEIGHT_FLOOR)
                .collect();
            Ok(MixtureProblem {
                offset: statistic,
                weights,
            })
        }
    }
}

/// Evaluates the upper tail of a mixture with the given primitive.
pub fn mixture_p_value<T: TailProbability + ?Sized>(
    tail: &T,
    problem: &MixtureProblem,
) -> Result<f64, PValueError> {
    Ok(tail.upper_tail(problem.offset, &problem.weights)?)
}
