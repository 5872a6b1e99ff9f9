//! Explicit factory from raw inputs to a concrete test.
//!
//! The parameterization follows from what is supplied: a random-covariate factor
//! selects the low-rank engine and a kernel matrix selects the full-kernel engine.
//! The p-value method is always chosen by the caller.

use crate::config::SkatConfig;
use crate::engine::{RandomEffect, SkatError, SkatTest};
use crate::pvalue::PValueMethod;
use crate::quadform::Davies;
use ndarray::ArrayView2;

/// Raw random-effect inputs. Exactly one field must be set.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomEffectInput<'a> {
    pub kernel_matrix: Option<ArrayView2<'a, f64>>,
    pub random_covariates: Option<ArrayView2<'a, f64>>,
}

impl<'a> RandomEffectInput<'a> {
    pub fn kernel(kernel_matrix: ArrayView2<'a, f64>) -> Self {
        Self {
            kernel_matrix: Some(kernel_matrix),
            random_covariates: None,
        }
    }

    pub fn factor(random_covariates: ArrayView2<'a, f64>) -> Self {
        Self {
            kernel_matrix: None,
            random_covariates: Some(random_covariates),
        }
    }

    /// Checks mutual exclusivity before any computation.
    pub fn resolve(self) -> Result<RandomEffect<'a>, SkatError> {
        match (self.kernel_matrix, self.random_covariates) {
            (Some(kernel), None) => Ok(RandomEffect::Kernel(kernel)),
            (None, Some(factor)) => Ok(RandomEffect::Factor(factor)),
            (kernel, factor) => Err(SkatError::AmbiguousRandomEffect {
                kernel_supplied: kernel.is_some(),
                factor_supplied: factor.is_some(),
            }),
        }
    }
}

/// Builds the test matching the supplied random effect, with the caller's method.
pub fn build_test(
    input: RandomEffectInput<'_>,
    fixed_covariates: Option<ArrayView2<f64>>,
    method: PValueMethod,
    config: &SkatConfig,
) -> Result<SkatTest<Davies>, SkatError> {
    let effect = input.resolve()?;
    log::debug!(
        "Dispatching {:?} input with {} samples.",
        effect.kind(),
        effect.n_samples()
    );
    SkatTest::build(effect, fixed_covariates, method, config, None, config.davies)
}
