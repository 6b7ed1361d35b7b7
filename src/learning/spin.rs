//! The spectral inference training step.
//!
//! `Spin::step` is a pure transition `SpinState → SpinState`: evaluate the
//! network and the operator on a batch, blend batch statistics into Σ̄ and J̄,
//! whiten with the Cholesky factor of Σ̄, and take one optimizer step along
//! the bias-corrected gradient. Nothing is mutated in place, so a failed
//! step leaves the caller's last committed state untouched.

use ndarray::{Array1, Array2, ArrayView2};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::gradient::{contract, pi_term, raw_sigma_jacobian, sigma_term, OuterGradients};
use super::optimizer::{apply_updates, Optimizer, OptimizerState};
use crate::error::{Result, SpinError, Stage};
use crate::linalg::cholesky::factorize;
use crate::linalg::covariance::{moving_average, Averages, CovarianceEstimator};
use crate::network::mlp::Mlp;
use crate::network::params::{Params, SigmaJacobian};
use crate::network::sparsity::SparsityMask;
use crate::physics::operator::Operator;

/// Everything that evolves across training steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpinState {
    pub params: Params,

    pub opt_state: OptimizerState,

    /// Σ̄ and J̄.
    pub averages: Averages,

    /// Number of completed steps.
    pub iteration: u64,
}

impl SpinState {
    /// Finite parameters, optimizer statistics and averages.
    pub fn is_healthy(&self) -> bool {
        self.params.is_finite() && self.opt_state.is_finite() && self.averages.is_finite()
    }
}

/// Result of one training step.
#[derive(Clone, Debug)]
pub struct StepOutput {
    /// Σ_i λ_i.
    pub loss: f64,

    /// diag(Λ), one per eigenfunction.
    pub eigenvalues: Array1<f64>,

    /// Norm of the descent direction before the optimizer.
    pub grad_norm: f64,

    pub state: SpinState,
}

/// Eigenvalue estimates and orthonormalised eigenfunctions on a point set.
#[derive(Clone, Debug)]
pub struct Eigenpairs {
    pub eigenvalues: Array1<f64>,
    /// U·L⁻ᵀ (N×k).
    pub eigenfunctions: Array2<f64>,
}

pub struct Spin {
    pub model: Mlp,
    pub operator: Box<dyn Operator>,
    pub optimizer: Optimizer,
    pub sparsity: Option<SparsityMask>,
    estimator: CovarianceEstimator,
}

impl Spin {
    /// `sparsifying_k` enables K-band weight sparsity (K ≥ 2).
    pub fn new(
        model: Mlp,
        operator: Box<dyn Operator>,
        optimizer: Optimizer,
        sparsifying_k: Option<usize>,
    ) -> Result<Self> {
        let sparsity = match sparsifying_k {
            Some(k) if k < 2 => {
                return Err(SpinError::config(format!("sparsifying K must be at least 2, got {k}")));
            }
            Some(k) => Some(SparsityMask::new(&model.zeros(), k)),
            None => None,
        };
        Ok(Self {
            model,
            operator,
            optimizer,
            sparsity,
            estimator: CovarianceEstimator::new(),
        })
    }

    /// Fresh parameters with Σ̄ = I_k and J̄ = 0.
    pub fn initial_state(&self, rng: &mut StdRng) -> SpinState {
        let mut params = self.model.init(rng);
        if let Some(mask) = &self.sparsity {
            params = mask.apply(&params);
        }
        let opt_state = self.optimizer.init(&params);
        let jacobian = SigmaJacobian::zeros(&params, self.model.output_dim());
        SpinState {
            params,
            opt_state,
            averages: Averages::cold(jacobian),
            iteration: 0,
        }
    }

    /// One training step on `batch` (N×d) with moving-average rate `beta`.
    pub fn step(&self, state: &SpinState, batch: &ArrayView2<f64>, beta: f64) -> Result<StepOutput> {
        if batch.ncols() != self.model.input_dim() {
            return Err(SpinError::config(format!(
                "batch has {} columns, network expects {}",
                batch.ncols(),
                self.model.input_dim()
            )));
        }

        let tape = self.model.forward_jet(&state.params, batch);
        if !tape.output.is_finite() {
            return Err(SpinError::numerical(Stage::Evaluation, "network outputs are not finite"));
        }
        let coeffs = self.operator.coefficients(batch);
        let hu = coeffs.apply(&tape.output);
        if !hu.iter().all(|v| v.is_finite()) {
            return Err(SpinError::numerical(
                Stage::Evaluation,
                format!("{} applied to the network is not finite", self.operator.name()),
            ));
        }

        let raw_jacobian = raw_sigma_jacobian(&self.model, &state.params, &tape);
        let update = self
            .estimator
            .update(&state.averages, &tape.values().view(), &hu.view(), &raw_jacobian, beta)?;

        let whitening = factorize(&update.averages.sigma)?;
        let lambda = whitening.rayleigh(&update.pi_batch);
        let eigenvalues = lambda.diag().to_owned();
        let loss = eigenvalues.sum();

        let outer = OuterGradients::new(&whitening, &lambda);
        let pi_grad = pi_term(&self.model, &state.params, &tape, &coeffs, &update.pi_context, &outer);
        let sigma_grad = sigma_term(&update.averages.jacobian, &outer);
        let mut grads = contract(&pi_grad, &sigma_grad, self.operator.objective().descent_sign())?;
        if let Some(mask) = &self.sparsity {
            grads = mask.apply(&grads);
        }
        let grad_norm = grads.norm();

        let (updates, opt_state) = self.optimizer.update(&grads, &state.opt_state);
        let mut params = apply_updates(&state.params, &updates);
        if let Some(mask) = &self.sparsity {
            params = mask.apply(&params);
        }
        trace!(iteration = state.iteration + 1, loss, grad_norm, "spin step");

        Ok(StepOutput {
            loss,
            eigenvalues,
            grad_norm,
            state: SpinState {
                params,
                opt_state,
                averages: update.averages,
                iteration: state.iteration + 1,
            },
        })
    }

    /// Eigenvalues and whitened eigenfunctions at `x`.
    ///
    /// The covariance of `x` is blended into the committed Σ̄ at rate `beta`.
    /// With `beta = 1` the whitening comes from the current parameters alone
    /// and the eigenfunctions are orthonormal over `x`.
    pub fn eigenpairs(&self, state: &SpinState, x: &ArrayView2<f64>, beta: f64) -> Result<Eigenpairs> {
        if x.ncols() != self.model.input_dim() {
            return Err(SpinError::config(format!(
                "points have {} columns, network expects {}",
                x.ncols(),
                self.model.input_dim()
            )));
        }
        if !(0.0..=1.0).contains(&beta) {
            return Err(SpinError::config(format!("moving-average rate must lie in [0, 1], got {beta}")));
        }
        let tape = self.model.forward_jet(&state.params, x);
        let hu = self.operator.apply(x, &tape.output);
        let u = tape.values();
        if !u.iter().chain(hu.iter()).all(|v| v.is_finite()) {
            return Err(SpinError::numerical(Stage::Evaluation, "network or operator outputs are not finite"));
        }
        let n = u.nrows().max(1) as f64;
        let sigma = u.t().dot(u) / n;
        let pi = u.t().dot(&hu) / n;
        let whitening = factorize(&moving_average(&state.averages.sigma, &sigma, beta))?;
        Ok(Eigenpairs {
            eigenvalues: whitening.rayleigh(&pi).diag().to_owned(),
            eigenfunctions: whitening.whiten(&u.view()),
        })
    }
}
