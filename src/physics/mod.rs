//! Problem definitions: operators, sampling domains, reference spectra.

pub mod exact;
pub mod operator;
pub mod sampler;

pub use operator::{Coefficients, Hydrogen, Laplacian, Objective, Operator, OperatorKind};
pub use sampler::BoxSampler;
