//! # Distribution of Quadratic Forms in Normal Variables
//!
//! Every SKAT p-value reduces to the upper tail of `Q = Σ wᵢ χ²₁ᵢ` for a finite,
//! possibly indefinite, weight vector `w`. The engine only depends on the
//! [`TailProbability`] trait; [`Davies`] is the default implementation.

use thiserror::Error;

mod davies;

pub use davies::{ChiSquareTerm, Davies, DaviesOutcome};

/// Error type for tail-probability evaluation.
#[derive(Error, Debug)]
pub enum QuadFormError {
    #[error("Quadratic form weights must be finite, but weight {index} was {value}.")]
    NonFiniteWeight { index: usize, value: f64 },

    #[error("The evaluation point of the quadratic form must be finite, got {0}.")]
    NonFiniteOffset(f64),

    #[error("Invalid quadratic form parameters: {0}")]
    InvalidParameters(&'static str),

    #[error(
        "Davies' method needs more than {term_limit} integration terms to reach accuracy {accuracy:e}."
    )]
    AccuracyNotAchieved { term_limit: usize, accuracy: f64 },

    #[error("Davies' method could not locate integration parameters within {term_limit} steps.")]
    IntegrationSetup { term_limit: usize },
}

/// Upper tail of a weighted sum of independent chi-square(1) variables.
///
/// Implementations must be pure: the same `(offset, weights)` always maps to the
/// same probability. Weights may be negative or zero.
pub trait TailProbability: Send + Sync {
    /// Returns `Pr(Σ wᵢ χ²₁ᵢ ≥ offset)`, in `[0, 1]`.
    fn upper_tail(&self, offset: f64, weights: &[f64]) -> Result<f64, QuadFormError>;
}
