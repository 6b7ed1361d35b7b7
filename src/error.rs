//! Error types for spectral inference training.
//!
//! Three failure families exist:
//! - **Config**: invalid layer, dimension, or eigenfunction settings. Raised
//!   eagerly by [`RunConfig::validate`](crate::runtime::config::RunConfig::validate)
//!   before any iteration executes.
//! - **Numerical**: non-finite values or a failed factorisation. Fatal for the
//!   run; the moving-average state is considered corrupted.
//! - **Resource**: checkpoint I/O. Logged by the trainer, training continues.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SpinError>;

/// The sub-computation in which a numerical failure was detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Network or operator evaluation on the batch.
    Evaluation,
    /// Batch covariance / cross-covariance estimation.
    BatchCovariance,
    /// Cholesky factorisation of the averaged covariance.
    CovarianceFactorization,
    /// Contraction of outer derivatives against the Jacobians.
    GradientContraction,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Evaluation => "network evaluation",
            Stage::BatchCovariance => "batch covariance",
            Stage::CovarianceFactorization => "covariance factorization",
            Stage::GradientContraction => "gradient contraction",
        };
        f.write_str(name)
    }
}

/// Errors raised by the spectral inference core and its driver.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SpinError {
    /// Invalid configuration, detected at setup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Non-finite values or failed factorisation inside a step.
    #[error("numerical error in {stage}: {detail}")]
    Numerical { stage: Stage, detail: String },

    /// Checkpoint or history persistence failure.
    #[error("resource error at '{}': {detail}", path.display())]
    Resource { path: PathBuf, detail: String },
}

impl SpinError {
    pub fn config(msg: impl Into<String>) -> Self {
        SpinError::Config(msg.into())
    }

    pub fn numerical(stage: Stage, detail: impl Into<String>) -> Self {
        SpinError::Numerical {
            stage,
            detail: detail.into(),
        }
    }

    pub fn resource(path: impl Into<PathBuf>, detail: impl fmt::Display) -> Self {
        SpinError::Resource {
            path: path.into(),
            detail: detail.to_string(),
        }
    }

    /// Whether this error must terminate the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SpinError::Resource { .. })
    }

    /// The failing stage, for numerical errors.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            SpinError::Numerical { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
