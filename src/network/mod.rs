//! Eigenfunction network.
//!
//! - **Params**: layered weights and the covariance Jacobian ∂Σ/∂θ
//! - **Jet**: forward-mode value/gradient/diagonal-Hessian propagation in x
//! - **Mlp**: masked feed-forward model with two reverse passes
//! - **Masks**: Dirichlet boundary fields and structured weight sparsity

pub mod activation;
pub mod jvp;
pub mod mask;
pub mod mlp;
pub mod params;
pub mod sparsity;

pub use activation::Activation;
pub use jvp::{Jet, ScalarField};
pub use mask::BoundaryMask;
pub use mlp::{Mlp, Tape};
pub use params::{Dense, Params, SigmaJacobian};
pub use sparsity::SparsityMask;
