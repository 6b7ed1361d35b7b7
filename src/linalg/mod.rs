//! Small dense linear algebra for k×k covariance matrices.
//!
//! - Batch covariance with a custom backward and moving averages
//! - Cholesky whitening with an explicit triangular inverse

pub mod cholesky;
pub mod covariance;

pub use cholesky::{factorize, Whitening};
pub use covariance::{Averages, Covariance, CovarianceEstimator, CovarianceUpdate, CustomVjp, MovingAverage};
