//! # The SKAT Test Object
//!
//! A [`SkatTest`] owns everything that depends only on the random-effect structure
//! and the fixed covariates: the projector, the reduced structure and its spectrum.
//! Construction pays the `O(n³)` decomposition once; [`SkatTest::test`] can then be
//! called for any number of phenotype batches.

use crate::config::{ConfigError, SkatConfig};
use crate::covariates::{CovariateProjector, ProjectionError};
use crate::pvalue::{self, PValueError, PValueMethod};
use crate::quadform::{Davies, TailProbability};
use crate::score;
use crate::spectrum::{self, KernelStructure, Spectrum, SpectrumError, StructureKind};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use thiserror::Error;

/// A comprehensive error type for building and running a test.
#[derive(Error, Debug)]
pub enum SkatError {
    #[error(
        "Exactly one of kernel_matrix or random_covariates must be supplied (kernel supplied: {kernel_supplied}, random covariates supplied: {factor_supplied})."
    )]
    AmbiguousRandomEffect {
        kernel_supplied: bool,
        factor_supplied: bool,
    },

    #[error("Phenotypes have {found} rows, but the test was built for {expected} samples.")]
    PhenotypeShape { expected: usize, found: usize },

    #[error("The {method} p-value cannot be used with a {structure:?} test.")]
    UnsupportedMethod {
        method: PValueMethod,
        structure: StructureKind,
    },

    #[error(
        "No residual degrees of freedom: {n} samples but {p} fixed-effect columns."
    )]
    NoResidualDegreesOfFreedom { n: usize, p: usize },

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Covariate projection failed: {0}")]
    Projection(#[from] ProjectionError),

    #[error("Spectral reduction failed: {0}")]
    Spectrum(#[from] SpectrumError),

    #[error("P-value computation failed: {0}")]
    PValue(#[from] PValueError),
}

/// The structure whose association is tested. `K = Z·Zᵗ` for a factor `Z`.
#[derive(Debug, Clone, Copy)]
pub enum RandomEffect<'a> {
    /// Random-covariate factor `Z`, shape `(n, m)`.
    Factor(ArrayView2<'a, f64>),
    /// Symmetric kernel `K`, shape `(n, n)`.
    Kernel(ArrayView2<'a, f64>),
}

impl RandomEffect<'_> {
    pub fn n_samples(&self) -> usize {
        match self {
            RandomEffect::Factor(z) => z.nrows(),
            RandomEffect::Kernel(k) => k.nrows(),
        }
    }

    pub fn kind(&self) -> StructureKind {
        match self {
            RandomEffect::Factor(_) => StructureKind::LowRank,
            RandomEffect::Kernel(_) => StructureKind::FullKernel,
        }
    }
}

/// P-values, with the statistics they were computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct SkatOutcome {
    pub p_values: Array1<f64>,
    pub scores: Array1<f64>,
}

/// A kernel association test with a fixed p-value strategy.
#[derive(Debug, Clone)]
pub struct SkatTest<T = Davies> {
    projector: CovariateProjector,
    structure: KernelStructure,
    spectrum: Spectrum,
    method: PValueMethod,
    tail: T,
}

impl SkatTest<Davies> {
    /// Low-rank test from a random-covariate factor `Z`.
    pub fn low_rank(
        factor: ArrayView2<f64>,
        fixed_covariates: Option<ArrayView2<f64>>,
        method: PValueMethod,
        config: &SkatConfig,
    ) -> Result<Self, SkatError> {
        Self::build(
            RandomEffect::Factor(factor),
            fixed_covariates,
            method,
            config,
            None,
            config.davies,
        )
    }

    /// Full-kernel test from a symmetric kernel matrix `K`.
    pub fn full_kernel(
        kernel: ArrayView2<f64>,
        fixed_covariates: Option<ArrayView2<f64>>,
        method: PValueMethod,
        config: &SkatConfig,
    ) -> Result<Self, SkatError> {
        Self::build(
            RandomEffect::Kernel(kernel),
            fixed_covariates,
            method,
            config,
            None,
            config.davies,
        )
    }
}

impl<T: TailProbability> SkatTest<T> {
    /// Builds a test with an explicit tail-probability primitive.
    ///
    /// `phis`, when given, replaces the computed spectrum (`k` and `q` are still
    /// derived from it and from the inputs).
    pub fn build(
        effect: RandomEffect<'_>,
        fixed_covariates: Option<ArrayView2<f64>>,
        method: PValueMethod,
        config: &SkatConfig,
        phis: Option<Array1<f64>>,
        tail: T,
    ) -> Result<Self, SkatError> {
        config.validate()?;
        if !method.supports(effect.kind()) {
            return Err(SkatError::UnsupportedMethod {
                method,
                structure: effect.kind(),
            });
        }

        let n = effect.n_samples();
        let projector = CovariateProjector::new(n, fixed_covariates, config.add_intercept)?;
        if projector.p() >= n {
            return Err(SkatError::NoResidualDegreesOfFreedom {
                n,
                p: projector.p(),
            });
        }

        let (structure, spectrum) = match effect {
            RandomEffect::Factor(factor) => {
                spectrum::reduce_low_rank(factor, &projector, config.zero_threshold, phis)?
            }
            RandomEffect::Kernel(kernel) => {
                spectrum::reduce_full_kernel(kernel, &projector, config.zero_threshold, phis)?
            }
        };

        log::info!(
            "Built {:?} SKAT test ({} p-values): n={}, p={}, k={}, q={}",
            structure.kind(),
            method,
            n,
            projector.p(),
            spectrum.rank(),
            spectrum.null_overlap()
        );

        Ok(Self {
            projector,
            structure,
            spectrum,
            method,
            tail,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.projector.n()
    }

    /// `p`: fixed-effect columns, intercept included.
    pub fn n_fixed(&self) -> usize {
        self.projector.p()
    }

    pub fn phis(&self) -> ArrayView1<'_, f64> {
        self.spectrum.phis()
    }

    /// `k`
    pub fn rank(&self) -> usize {
        self.spectrum.rank()
    }

    /// `q`
    pub fn null_overlap(&self) -> usize {
        self.spectrum.null_overlap()
    }

    pub fn spectrum(&self) -> &Spectrum {
        &self.spectrum
    }

    pub fn projector(&self) -> &CovariateProjector {
        &self.projector
    }

    pub fn structure_kind(&self) -> StructureKind {
        self.structure.kind()
    }

    pub fn method(&self) -> PValueMethod {
        self.method
    }

    /// Variance of the scaled statistic under the null,
    /// `2(n−p)/(n−p+2) · (Σφ² − (Σφ)²/(n−p))`.
    pub fn theoretical_variance(&self) -> f64 {
        let residual_dof = (self.n_samples() - self.n_fixed()) as f64;
        let phis = self.spectrum.phis();
        let sum = phis.sum();
        let sum_sq = phis.dot(&phis);
        2.0 * residual_dof / (residual_dof + 2.0) * (sum_sq - sum * sum / residual_dof)
    }

    /// Score statistic for every phenotype column. Degenerate columns are `NaN`.
    pub fn compute_scores(&self, phenotypes: ArrayView2<f64>) -> Result<Array1<f64>, SkatError> {
        if phenotypes.nrows() != self.n_samples() {
            return Err(SkatError::PhenotypeShape {
                expected: self.n_samples(),
                found: phenotypes.nrows(),
            });
        }
        let scores = score::compute_scores(&self.structure, &self.projector, phenotypes)?;
        for (column, statistic) in scores.iter().enumerate() {
            if !statistic.is_finite() {
                log::warn!(
                    "Phenotype column {column} has no variance left after removing fixed covariates; its score and p-value are NaN."
                );
            }
        }
        Ok(scores)
    }

    /// P-value of a single statistic. A non-finite statistic maps to `NaN` without
    /// calling the tail primitive.
    pub fn compute_p_value(&self, statistic: f64) -> Result<f64, SkatError> {
        if !statistic.is_finite() {
            return Ok(f64::NAN);
        }
        let problem = pvalue::null_mixture(
            self.method,
            &self.structure,
            &self.spectrum,
            &self.projector,
            statistic,
        )?;
        Ok(pvalue::mixture_p_value(&self.tail, &problem)?)
    }

    /// P-values for every phenotype column.
    pub fn test(&self, phenotypes: ArrayView2<f64>) -> Result<Array1<f64>, SkatError> {
        Ok(self.test_with_scores(phenotypes)?.p_values)
    }

    /// P-values together with the raw statistics.
    ///
    /// A column whose tail probability cannot be evaluated gets a `NaN` p-value; the
    /// other columns are unaffected.
    pub fn test_with_scores(&self, phenotypes: ArrayView2<f64>) -> Result<SkatOutcome, SkatError> {
        let scores = self.compute_scores(phenotypes)?;
        let p_values = scores
            .to_vec()
            .into_par_iter()
            .enumerate()
            .map(|(column, statistic)| match self.compute_p_value(statistic) {
                Err(SkatError::PValue(PValueError::TailProbability(fault))) => {
                    log::warn!(
                        "Phenotype column {column} (statistic {statistic}): {fault} Its p-value is NaN."
                    );
                    Ok(f64::NAN)
                }
                other => other,
            })
            .collect::<Result<Vec<f64>, SkatError>>()?;
        log::debug!("Tested {} phenotype columns.", scores.len());
        Ok(SkatOutcome {
            p_values: Array1::from_vec(p_values),
            scores,
        })
    }

    /// Tests a single phenotype vector of length `n`.
    pub fn test_vector(&self, phenotype: ArrayView1<f64>) -> Result<SkatOutcome, SkatError> {
        self.test_with_scores(phenotype.insert_axis(Axis(1)))
    }
}
