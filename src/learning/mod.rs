//! Spectral inference learning.
//!
//! - **gradient**: masked outer derivatives of trace(Λ), Jacobian of Σ, contraction
//! - **optimizer**: RMSProp / momentum SGD over layered parameters
//! - **spin**: the pure training-step transition and eigenpair evaluation

pub mod gradient;
pub mod optimizer;
pub mod spin;

pub use optimizer::{LearningRate, Optimizer, OptimizerState};
pub use spin::{Eigenpairs, Spin, SpinState, StepOutput};
