//! Run configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{
    BOX_MASK_SCALE, CALLBACK_EVERY, CHECKPOINT_EVERY, HYDROGEN_BOX_HALF_WIDTH, MOVING_AVERAGE_BETA, RMSPROP_EPS,
};
use crate::error::{Result, SpinError};
use crate::learning::optimizer::{LearningRate, Optimizer};
use crate::network::activation::Activation;
use crate::network::mask::BoundaryMask;
use crate::network::mlp::Mlp;
use crate::physics::operator::OperatorKind;

/// Exponential learning-rate decay settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LrDecay {
    pub decay_steps: u64,
    pub rate: f64,
}

/// Everything needed to reproduce one training run.
///
/// Missing fields take their [`Default`] values when loading from JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub operator: OperatorKind,

    /// Input dimension d.
    pub dim: usize,

    /// Hidden layer widths.
    pub hidden: Vec<usize>,

    /// Number of eigenfunctions k.
    pub n_eigenfunctions: usize,

    pub activation: Activation,

    pub use_bias: bool,

    pub mask: BoundaryMask,

    /// Sampling box `[lo, hi]^d`.
    pub bounds: (f64, f64),

    pub learning_rate: f64,

    /// RMSProp squared-gradient decay ρ.
    pub decay_rate: f64,

    pub lr_decay: Option<LrDecay>,

    /// Moving-average rate β for Σ̄ and J̄ (forced to 1 on the first step).
    pub beta: f64,

    pub batch_size: usize,

    /// Iteration budget.
    pub iterations: u64,

    /// Seed for batch sampling.
    pub seed: u64,

    /// Seed for parameter initialisation.
    pub init_seed: u64,

    /// Number of sparsity bands per layer; `None` keeps layers dense.
    pub sparsifying_k: Option<usize>,

    pub log_every: u64,

    pub callback_every: u64,

    pub checkpoint_every: u64,

    /// Checkpoints are written here when set.
    pub checkpoint_dir: Option<PathBuf>,

    pub show_progress: bool,

    /// Resume from the latest checkpoint in `checkpoint_dir`.
    pub resume: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        let (lo, hi) = (0.0, std::f64::consts::PI);
        Self {
            operator: OperatorKind::Laplacian,
            dim: 1,
            hidden: vec![64, 64, 64, 32],
            n_eigenfunctions: 4,
            activation: Activation::Softplus,
            use_bias: true,
            mask: BoundaryMask::Box {
                lo,
                hi,
                scale: BOX_MASK_SCALE,
            },
            bounds: (lo, hi),
            learning_rate: 1e-4,
            decay_rate: 0.9,
            lr_decay: None,
            beta: MOVING_AVERAGE_BETA,
            batch_size: 128,
            iterations: 3000,
            seed: 1239,
            init_seed: 2,
            sparsifying_k: None,
            log_every: 100,
            callback_every: CALLBACK_EVERY,
            checkpoint_every: CHECKPOINT_EVERY,
            checkpoint_dir: None,
            show_progress: true,
            resume: false,
        }
    }
}

impl RunConfig {
    /// Load a JSON config file. Absent fields use defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SpinError::resource(path, e))?;
        serde_json::from_str(&text).map_err(|e| SpinError::config(format!("{}: {e}", path.display())))
    }

    /// Named problem setups.
    ///
    /// - `laplace-1d`: Dirichlet Laplacian on [0, π]
    /// - `laplace-2d`: Dirichlet Laplacian on [0, π]²
    /// - `hydrogen-2d` / `hydrogen-3d`: hydrogen atom in a soft box
    pub fn from_preset(name: &str) -> Result<Self> {
        let base = Self::default();
        match name {
            "laplace-1d" => Ok(base),
            "laplace-2d" => Ok(Self {
                dim: 2,
                hidden: vec![64, 64, 32],
                n_eigenfunctions: 4,
                ..base
            }),
            "hydrogen-2d" | "hydrogen-3d" => {
                let dim = if name == "hydrogen-2d" { 2 } else { 3 };
                let half_width = HYDROGEN_BOX_HALF_WIDTH;
                Ok(Self {
                    operator: OperatorKind::Hydrogen {
                        charge: 1.0,
                        softening: 0.0,
                    },
                    dim,
                    hidden: vec![64, 128, 128, 64],
                    n_eigenfunctions: 5,
                    activation: Activation::Softplus,
                    use_bias: false,
                    mask: BoundaryMask::SoftBox { half_width },
                    bounds: (-half_width, half_width),
                    learning_rate: 5e-5,
                    decay_rate: 0.999,
                    batch_size: 1024,
                    iterations: 300_000,
                    seed: 5,
                    init_seed: 0,
                    sparsifying_k: Some(5),
                    log_every: 1000,
                    ..base
                })
            }
            other => Err(SpinError::config(format!("unknown preset '{other}'"))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(SpinError::config("dim must be > 0"));
        }
        if self.n_eigenfunctions == 0 {
            return Err(SpinError::config("n_eigenfunctions must be > 0"));
        }
        if self.hidden.iter().any(|&w| w == 0) {
            return Err(SpinError::config("hidden widths must be > 0"));
        }
        if self.batch_size < self.n_eigenfunctions {
            return Err(SpinError::config(format!(
                "batch_size {} is smaller than n_eigenfunctions {}; the batch covariance would be singular",
                self.batch_size, self.n_eigenfunctions
            )));
        }
        let (lo, hi) = self.bounds;
        if !(lo < hi) || !lo.is_finite() || !hi.is_finite() {
            return Err(SpinError::config(format!("bounds must satisfy lo < hi, got ({lo}, {hi})")));
        }
        if !(0.0..=1.0).contains(&self.beta) {
            return Err(SpinError::config(format!("beta must lie in [0, 1], got {}", self.beta)));
        }
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return Err(SpinError::config(format!("learning_rate must be > 0, got {}", self.learning_rate)));
        }
        if !(0.0..1.0).contains(&self.decay_rate) {
            return Err(SpinError::config(format!("decay_rate must lie in [0, 1), got {}", self.decay_rate)));
        }
        if let Some(d) = self.lr_decay {
            if d.decay_steps == 0 || !(d.rate > 0.0) {
                return Err(SpinError::config("lr_decay needs decay_steps > 0 and rate > 0"));
            }
        }
        if let Some(k) = self.sparsifying_k {
            if k < 2 {
                return Err(SpinError::config(format!("sparsifying_k must be at least 2, got {k}")));
            }
        }
        match self.mask {
            BoundaryMask::Box { lo, hi, scale } if !(lo < hi) || !(scale > 0.0) => {
                return Err(SpinError::config("box mask needs lo < hi and scale > 0"));
            }
            BoundaryMask::SoftBox { half_width } => {
                if !(half_width > 0.0) {
                    return Err(SpinError::config("soft box mask needs half_width > 0"));
                }
                // The soft box is only defined for |x_i| < √2·D.
                let limit = std::f64::consts::SQRT_2 * half_width;
                if lo.abs() >= limit || hi.abs() >= limit {
                    return Err(SpinError::config(format!(
                        "bounds ({lo}, {hi}) leave the soft box domain |x| < {limit:.3}"
                    )));
                }
            }
            _ => {}
        }
        if let OperatorKind::Hydrogen { softening, .. } = self.operator {
            if softening < 0.0 {
                return Err(SpinError::config("hydrogen softening must be >= 0"));
            }
        }
        if self.log_every == 0 || self.callback_every == 0 || self.checkpoint_every == 0 {
            return Err(SpinError::config("log_every, callback_every and checkpoint_every must be > 0"));
        }
        if self.resume && self.checkpoint_dir.is_none() {
            return Err(SpinError::config("resume requires checkpoint_dir"));
        }
        Ok(())
    }

    /// Layer widths `[d, hidden.., k]`.
    pub fn widths(&self) -> Vec<usize> {
        let mut widths = Vec::with_capacity(self.hidden.len() + 2);
        widths.push(self.dim);
        widths.extend_from_slice(&self.hidden);
        widths.push(self.n_eigenfunctions);
        widths
    }

    pub fn build_model(&self) -> Result<Mlp> {
        Mlp::new(self.widths(), self.activation, self.use_bias, self.mask.clone())
    }

    pub fn build_optimizer(&self) -> Optimizer {
        let schedule = match self.lr_decay {
            Some(LrDecay { decay_steps, rate }) => LearningRate::ExponentialDecay {
                init: self.learning_rate,
                decay_steps,
                rate,
            },
            None => LearningRate::Constant {
                value: self.learning_rate,
            },
        };
        Optimizer::RmsProp {
            schedule,
            decay: self.decay_rate,
            eps: RMSPROP_EPS,
        }
    }
}
