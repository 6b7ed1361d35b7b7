//! Batch covariance with a custom backward rule, and moving averages.
//!
//! `Covariance(x, y) = xᵀy / N`. Its backward does not return the plain VJP
//! `(y·Gᵀ/N, x·G/N)` but the symmetrised-covariance rule `(y·G/N, x·G/N)`,
//! which treats the output as if it were symmetric in its two arguments.
//! The rule coincides with the exact VJP for symmetric G and is what the
//! gradient contraction for trace(Λ) expects.

use ndarray::{Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpinError, Stage};
use crate::network::params::SigmaJacobian;

/// An operation with a hand-written backward pass.
pub trait CustomVjp {
    type Input<'a>;
    type Output;
    type Context;
    type Grad;

    fn forward(&self, input: Self::Input<'_>) -> (Self::Output, Self::Context);

    fn backward(&self, ctx: &Self::Context, grad: &Self::Output) -> Self::Grad;
}

/// `xᵀy / N` over a batch of N rows.
#[derive(Clone, Copy, Debug, Default)]
pub struct Covariance;

/// Saved inputs of a [`Covariance`] forward pass.
#[derive(Clone, Debug)]
pub struct CovarianceContext {
    pub x: Array2<f64>,
    pub y: Array2<f64>,
}

impl CovarianceContext {
    pub fn batch(&self) -> usize {
        self.x.nrows()
    }
}

impl CustomVjp for Covariance {
    type Input<'a> = (ArrayView2<'a, f64>, ArrayView2<'a, f64>);
    type Output = Array2<f64>;
    type Context = CovarianceContext;
    type Grad = (Array2<f64>, Array2<f64>);

    fn forward(&self, (x, y): Self::Input<'_>) -> (Array2<f64>, CovarianceContext) {
        let n = x.nrows().max(1) as f64;
        let out = x.t().dot(&y) / n;
        (
            out,
            CovarianceContext {
                x: x.to_owned(),
                y: y.to_owned(),
            },
        )
    }

    fn backward(&self, ctx: &CovarianceContext, grad: &Array2<f64>) -> (Array2<f64>, Array2<f64>) {
        let n = ctx.batch().max(1) as f64;
        (ctx.y.dot(grad) / n, ctx.x.dot(grad) / n)
    }
}

/// Exponential moving average `x̄ ← (1 − β) x̄ + β x`.
pub trait MovingAverage {
    fn blend(&self, batch: &Self, beta: f64) -> Self;
}

impl MovingAverage for Array2<f64> {
    fn blend(&self, batch: &Self, beta: f64) -> Self {
        let mut out = self.clone();
        Zip::from(&mut out)
            .and(batch)
            .for_each(|a, &b| *a = (1.0 - beta) * *a + beta * b);
        out
    }
}

impl MovingAverage for SigmaJacobian {
    fn blend(&self, batch: &Self, beta: f64) -> Self {
        let mut out = self.clone();
        for (acc, b) in out.layers.iter_mut().zip(batch.layers.iter()) {
            Zip::from(&mut acc.weight)
                .and(&b.weight)
                .for_each(|a, &x| *a = (1.0 - beta) * *a + beta * x);
            if let (Some(ab), Some(bb)) = (acc.bias.as_mut(), b.bias.as_ref()) {
                Zip::from(ab)
                    .and(bb)
                    .for_each(|a, &x| *a = (1.0 - beta) * *a + beta * x);
            }
        }
        out
    }
}

pub fn moving_average<T: MovingAverage>(avg: &T, batch: &T, beta: f64) -> T {
    avg.blend(batch, beta)
}

/// Running estimates of Σ and ∂Σ/∂θ.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Averages {
    pub sigma: Array2<f64>,
    pub jacobian: SigmaJacobian,
}

impl Averages {
    /// Cold-start averages: Σ̄ = I_k, J̄ = 0.
    pub fn cold(jacobian_shape: SigmaJacobian) -> Self {
        let k = jacobian_shape.k;
        Self {
            sigma: Array2::eye(k),
            jacobian: jacobian_shape,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.sigma.iter().all(|v| v.is_finite()) && self.jacobian.is_finite()
    }
}

/// Result of one estimator update.
#[derive(Clone, Debug)]
pub struct CovarianceUpdate {
    pub averages: Averages,
    pub sigma_batch: Array2<f64>,
    pub pi_batch: Array2<f64>,
    /// Saved inputs of the Π forward, for the Π-term backward.
    pub pi_context: CovarianceContext,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CovarianceEstimator {
    op: Covariance,
}

impl CovarianceEstimator {
    pub fn new() -> Self {
        Self { op: Covariance }
    }

    /// Batch statistics of `u` (N×k) and `hu` (N×k), blended into `averages`.
    pub fn update(
        &self,
        averages: &Averages,
        u: &ArrayView2<f64>,
        hu: &ArrayView2<f64>,
        raw_jacobian: &SigmaJacobian,
        beta: f64,
    ) -> Result<CovarianceUpdate> {
        if !(0.0..=1.0).contains(&beta) {
            return Err(SpinError::config(format!("moving-average rate must lie in [0, 1], got {beta}")));
        }
        if u.dim() != hu.dim() {
            return Err(SpinError::numerical(
                Stage::BatchCovariance,
                format!("outputs {:?} and operator outputs {:?} differ in shape", u.dim(), hu.dim()),
            ));
        }
        if u.nrows() == 0 {
            return Err(SpinError::numerical(Stage::BatchCovariance, "empty batch"));
        }

        let (sigma_batch, _) = self.op.forward((u.view(), u.view()));
        let (pi_batch, pi_context) = self.op.forward((u.view(), hu.view()));
        if !sigma_batch.iter().all(|v| v.is_finite()) {
            return Err(SpinError::numerical(Stage::BatchCovariance, "non-finite Σ batch estimate"));
        }
        if !pi_batch.iter().all(|v| v.is_finite()) {
            return Err(SpinError::numerical(Stage::BatchCovariance, "non-finite Π batch estimate"));
        }

        let averages = Averages {
            sigma: moving_average(&averages.sigma, &sigma_batch, beta),
            jacobian: moving_average(&averages.jacobian, raw_jacobian, beta),
        };
        Ok(CovarianceUpdate {
            averages,
            sigma_batch,
            pi_batch,
            pi_context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::params::{Dense, Params};
    use ndarray::array;

    fn jac(k: usize, fill: f64) -> SigmaJacobian {
        let p = Params::new(vec![Dense::zeros(2, 3, true)]);
        let mut j = SigmaJacobian::zeros(&p, k);
        j.layers[0].weight.fill(fill);
        if let Some(b) = j.layers[0].bias.as_mut() {
            b.fill(fill);
        }
        j
    }

    fn outputs() -> Array2<f64> {
        array![[1.0, 0.5], [-0.3, 2.0], [0.7, -1.1], [0.2, 0.4]]
    }

    #[test]
    fn test_forward_is_mean_outer_product() {
        let u = outputs();
        let (s, _) = Covariance.forward((u.view(), u.view()));
        let expected = u.t().dot(&u) / 4.0;
        for (a, b) in s.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-15);
        }
    }

    #[test]
    fn test_backward_matches_vjp_for_symmetric_grad() {
        let x = outputs();
        let y = array![[0.1, 0.2], [0.3, -0.4], [0.5, 0.6], [-0.7, 0.8]];
        let g = array![[1.0, 0.3], [0.3, -2.0]];
        let (_, ctx) = Covariance.forward((x.view(), y.view()));
        let (gx, gy) = Covariance.backward(&ctx, &g);

        // <G, xᵀy/N> perturbed in x[1,0] and y[2,1].
        let f = |x: &Array2<f64>, y: &Array2<f64>| (&(x.t().dot(y) / 4.0) * &g).sum();
        let h = 1e-6;
        let mut xp = x.clone();
        xp[[1, 0]] += h;
        assert!(((f(&xp, &y) - f(&x, &y)) / h - gx[[1, 0]]).abs() < 1e-6);
        let mut yp = y.clone();
        yp[[2, 1]] += h;
        assert!(((f(&x, &yp) - f(&x, &y)) / h - gy[[2, 1]]).abs() < 1e-6);
    }

    #[test]
    fn test_backward_uses_untransposed_grad() {
        let x = array![[1.0, 0.0]];
        let y = array![[0.0, 1.0]];
        let g = array![[0.0, 1.0], [0.0, 0.0]];
        let (_, ctx) = Covariance.forward((x.view(), y.view()));
        let (gx, _) = Covariance.backward(&ctx, &g);
        // y·G = [0, 0]: the rule does not transpose G.
        assert_eq!(gx, array![[0.0, 0.0]]);
    }

    #[test]
    fn test_moving_average_extremes() {
        let avg = array![[1.0, 2.0], [3.0, 4.0]];
        let batch = array![[5.0, 6.0], [7.0, 8.0]];
        assert_eq!(moving_average(&avg, &batch, 0.0), avg);
        assert_eq!(moving_average(&avg, &batch, 1.0), batch);
        let half = moving_average(&jac(2, 0.0), &jac(2, 2.0), 0.5);
        assert!(half.layers[0].weight.iter().all(|&v| (v - 1.0).abs() < 1e-15));
        assert!(half.layers[0].bias.as_ref().unwrap().iter().all(|&v| (v - 1.0).abs() < 1e-15));
    }

    #[test]
    fn test_update_sigma_is_symmetric_psd() {
        let u = outputs();
        let hu = &u * -1.0;
        let est = CovarianceEstimator::new();
        let avgs = Averages::cold(jac(2, 0.0));
        let up = est.update(&avgs, &u.view(), &hu.view(), &jac(2, 1.0), 1.0).unwrap();
        let s = &up.sigma_batch;
        assert!((s[[0, 1]] - s[[1, 0]]).abs() < 1e-15);
        assert!(s[[0, 0]] >= 0.0 && s[[1, 1]] >= 0.0);
        assert!(s[[0, 0]] * s[[1, 1]] - s[[0, 1]] * s[[1, 0]] >= -1e-15);
        assert_eq!(up.averages.sigma, up.sigma_batch);
        assert!((up.pi_batch[[0, 0]] + s[[0, 0]]).abs() < 1e-15);
    }

    #[test]
    fn test_update_rejects_bad_beta_and_nan() {
        let u = outputs();
        let est = CovarianceEstimator::new();
        let avgs = Averages::cold(jac(2, 0.0));
        let err = est.update(&avgs, &u.view(), &u.view(), &jac(2, 0.0), 1.5).unwrap_err();
        assert!(matches!(err, SpinError::Config(_)));

        let mut bad = u.clone();
        bad[[0, 0]] = f64::NAN;
        let err = est.update(&avgs, &bad.view(), &u.view(), &jac(2, 0.0), 0.5).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::BatchCovariance));
    }

    #[test]
    fn test_cold_averages() {
        let a = Averages::cold(jac(3, 0.0));
        assert_eq!(a.sigma, Array2::<f64>::eye(3));
        assert!(a.is_finite());
    }
}
