use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate};
use ndarray_linalg::SVD;
use thiserror::Error;

/// Singular values below `PINV_RCOND * max(s)` are treated as zero when forming `X⁺`.
const PINV_RCOND: f64 = 1e-15;

/// Error type for building and applying the covariate projection.
#[derive(Error, Debug)]
pub enum ProjectionError {
    #[error("Fixed covariates have {found} rows, but the test has {expected} samples.")]
    ShapeMismatch { expected: usize, found: usize },

    #[error("Cannot project an operand with {found} rows onto a {expected}-sample space.")]
    OperandMismatch { expected: usize, found: usize },

    #[error("The SVD of the fixed covariates did not return right singular vectors.")]
    MissingSingularVectors,

    #[error("Pseudo-inverse of the fixed covariates failed: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
}

/// The fixed-effect design `X` together with its Moore-Penrose pseudo-inverse.
#[derive(Debug, Clone)]
struct FixedEffects {
    design: Array2<f64>,
    pseudo_inverse: Array2<f64>,
}

/// Removes the linear span of the fixed covariates from observation-space operands.
///
/// Applies `S = I - X·X⁺` without materializing the `n × n` operator. When there
/// are neither covariates nor an intercept, `S` is the identity and `p = 0`.
#[derive(Debug, Clone)]
pub struct CovariateProjector {
    n: usize,
    fixed: Option<FixedEffects>,
}

impl CovariateProjector {
    /// Builds the projector for `n` samples. The intercept, when requested, is appended
    /// as the last column of `X`.
    pub fn new(
        n: usize,
        fixed_covariates: Option<ArrayView2<f64>>,
        add_intercept: bool,
    ) -> Result<Self, ProjectionError> {
        if let Some(covariates) = &fixed_covariates {
            if covariates.nrows() != n {
                return Err(ProjectionError::ShapeMismatch {
                    expected: n,
                    found: covariates.nrows(),
                });
            }
        }

        let intercept = add_intercept.then(|| Array2::<f64>::ones((n, 1)));
        let design = match (fixed_covariates, intercept) {
            (None, None) => None,
            (Some(covariates), None) => Some(covariates.to_owned()),
            (None, Some(intercept)) => Some(intercept),
            (Some(covariates), Some(intercept)) => Some(
                concatenate(Axis(1), &[covariates.view(), intercept.view()])
                    .map_err(|_| ProjectionError::ShapeMismatch {
                        expected: n,
                        found: covariates.nrows(),
                    })?,
            ),
        };

        let fixed = match design {
            Some(design) if design.ncols() > 0 => {
                let pseudo_inverse = pseudo_inverse(&design)?;
                Some(FixedEffects {
                    design,
                    pseudo_inverse,
                })
            }
            _ => None,
        };

        Ok(Self { n, fixed })
    }

    /// Number of samples.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of fixed-effect columns, including the intercept.
    pub fn p(&self) -> usize {
        self.fixed.as_ref().map_or(0, |fixed| fixed.design.ncols())
    }

    pub fn is_identity(&self) -> bool {
        self.fixed.is_none()
    }

    /// The (possibly intercept-augmented) covariate matrix `X`.
    pub fn covariates(&self) -> Option<ArrayView2<'_, f64>> {
        self.fixed.as_ref().map(|fixed| fixed.design.view())
    }

    /// The pseudo-inverse `X⁺`, shape `(p, n)`.
    pub fn pseudo_inverse(&self) -> Option<ArrayView2<'_, f64>> {
        self.fixed.as_ref().map(|fixed| fixed.pseudo_inverse.view())
    }

    /// `v - X·X⁺·v` for every column of `v`.
    pub fn project_matrix(&self, v: ArrayView2<f64>) -> Result<Array2<f64>, ProjectionError> {
        self.check_rows(v.nrows())?;
        Ok(match &self.fixed {
            Some(fixed) => {
                let coefficients = fixed.pseudo_inverse.dot(&v);
                &v - &fixed.design.dot(&coefficients)
            }
            None => v.to_owned(),
        })
    }

    /// `v - X·X⁺·v` for a single observation-space vector.
    pub fn project_vector(&self, v: ArrayView1<f64>) -> Result<Array1<f64>, ProjectionError> {
        self.check_rows(v.len())?;
        Ok(match &self.fixed {
            Some(fixed) => {
                let coefficients = fixed.pseudo_inverse.dot(&v);
                &v - &fixed.design.dot(&coefficients)
            }
            None => v.to_owned(),
        })
    }

    /// Materializes `S = I - X·X⁺` as an `n × n` matrix.
    pub fn residual_operator(&self) -> Array2<f64> {
        let identity = Array2::<f64>::eye(self.n);
        match &self.fixed {
            Some(fixed) => identity - fixed.design.dot(&fixed.pseudo_inverse),
            None => identity,
        }
    }

    fn check_rows(&self, rows: usize) -> Result<(), ProjectionError> {
        if rows != self.n {
            return Err(ProjectionError::OperandMismatch {
                expected: self.n,
                found: rows,
            });
        }
        Ok(())
    }
}

/// Moore-Penrose pseudo-inverse via the SVD `X = U·Σ·Vᵗ`.
///
/// Only the right singular vectors are requested; each retained left vector is
/// recovered as `uᵢ = X·vᵢ / σᵢ`, so `X⁺ = Σᵢ vᵢ·(X·vᵢ)ᵗ / σᵢ²`.
fn pseudo_inverse(x: &Array2<f64>) -> Result<Array2<f64>, ProjectionError> {
    let (_, singular_values, vt) = x.svd(false, true)?;
    let vt = vt.ok_or(ProjectionError::MissingSingularVectors)?;

    let largest = singular_values.iter().copied().fold(0.0_f64, f64::max);
    let cutoff = PINV_RCOND * largest;

    let mut result = Array2::<f64>::zeros((x.ncols(), x.nrows()));
    for (i, &sigma) in singular_values.iter().enumerate() {
        if sigma <= cutoff || sigma == 0.0 {
            continue;
        }
        let v = vt.row(i);
        let xv = x.dot(&v);
        let outer = v
            .insert_axis(Axis(1))
            .dot(&xv.view().insert_axis(Axis(0)));
        result.scaled_add(1.0 / (sigma * sigma), &outer);
    }
    Ok(result)
}
