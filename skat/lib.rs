#![deny(dead_code)]
#![deny(unused_imports)]
//! Recalibrated lightweight kernel association tests (SKAT).
//!
//! A test object is built once from a random-effect structure (a kernel matrix `K`
//! or a random-covariate factor `Z` with `K = Z·Zᵗ`) and optional fixed covariates.
//! It then maps any number of phenotype batches to score statistics and p-values.
//!
//! ```no_run
//! use ndarray::Array2;
//! use rlskat::{PValueMethod, SkatConfig, SkatTest};
//!
//! let z = Array2::<f64>::ones((50, 5));
//! let phenotypes = Array2::<f64>::zeros((50, 3));
//! let test = SkatTest::low_rank(z.view(), None, PValueMethod::Recalibrated, &SkatConfig::default())?;
//! let p_values = test.test(phenotypes.view())?;
//! # Ok::<(), rlskat::SkatError>(())
//! ```

pub mod config;
pub mod covariates;
pub mod dispatch;
pub mod engine;
pub mod pvalue;
pub mod score;
pub mod spectrum;

#[path = "../quadform/mod.rs"]
pub mod quadform;

pub use config::SkatConfig;
pub use dispatch::{RandomEffectInput, build_test};
pub use engine::{RandomEffect, SkatError, SkatOutcome, SkatTest};
pub use pvalue::PValueMethod;
pub use quadform::{Davies, TailProbability};
pub use spectrum::StructureKind;
