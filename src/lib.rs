//! # Spectral Inference Networks
//!
//! Learns the leading eigenfunctions of linear differential operators with a
//! neural network whose outputs are orthonormalised on the fly by the
//! Cholesky factor of a moving-average covariance.
//!
//! ## Components
//!
//! 1. **Network**: masked MLP `u_θ : R^d → R^k` with forward-mode jets in x
//! 2. **Physics**: Laplacian and hydrogen operators, box sampling, exact spectra
//! 3. **Linalg**: batch covariance with a custom backward, Cholesky whitening
//! 4. **Learning**: bias-corrected gradient of trace(Λ), RMSProp, the step transition
//! 5. **Runtime**: training driver, checkpoints, health monitoring
//!
//! ## Training step
//!
//! - Σ̄ ← (1−β)Σ̄ + β·UᵀU/N, J̄ ← (1−β)J̄ + β·∂Σ/∂θ
//! - Σ̄ = L·Lᵀ, Λ = L⁻¹ Π L⁻ᵀ with Π = Uᵀ(HU)/N
//! - θ ← optimizer(θ, ±[A₁-pullback through Π + Σ_ab (A₂)_ab J̄_ab])

pub mod error;
pub mod learning;
pub mod linalg;
pub mod network;
pub mod physics;
pub mod runtime;

pub use error::{Result, SpinError, Stage};

/// Run-wide constants.
pub mod config {
    /// Callback cadence of the training loop (steps).
    pub const CALLBACK_EVERY: u64 = 500;

    /// Checkpoint cadence (steps). Step 1 is always checkpointed.
    pub const CHECKPOINT_EVERY: u64 = 10_000;

    /// Default moving-average rate β.
    pub const MOVING_AVERAGE_BETA: f64 = 0.01;

    /// RMSProp denominator offset.
    pub const RMSPROP_EPS: f64 = 1e-8;

    /// Scale of the quadratic box mask.
    pub const BOX_MASK_SCALE: f64 = 0.1;

    /// Half-width of the soft box used for hydrogen runs.
    pub const HYDROGEN_BOX_HALF_WIDTH: f64 = 15.0;

    /// Held-out points used to report eigenpairs after training.
    pub const EVAL_POINTS: usize = 4096;

    /// Seed of the held-out sample in more than one dimension.
    pub const HELD_OUT_SEED: u64 = 7919;
}
