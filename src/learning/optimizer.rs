//! First-order optimizers over layered parameter records.
//!
//! Updates are computed functionally: `update(grads, state) → (updates, state')`
//! and applied with [`apply_updates`]. Gradients are descent directions; the
//! returned updates already carry the minus sign.

use serde::{Deserialize, Serialize};

use crate::config::RMSPROP_EPS;
use crate::network::params::Params;

/// Step-size schedule.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LearningRate {
    Constant { value: f64 },

    /// `init · rate^(step / decay_steps)`, continuous.
    ExponentialDecay { init: f64, decay_steps: u64, rate: f64 },
}

impl LearningRate {
    pub fn at(&self, step: u64) -> f64 {
        match *self {
            LearningRate::Constant { value } => value,
            LearningRate::ExponentialDecay {
                init,
                decay_steps,
                rate,
            } => init * rate.powf(step as f64 / decay_steps.max(1) as f64),
        }
    }
}

/// Optimizer configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Optimizer {
    /// `ν ← ρν + (1 − ρ)g²`, `Δθ = −η g / √(ν + ε)`.
    RmsProp {
        schedule: LearningRate,
        decay: f64,
        eps: f64,
    },

    /// Heavy-ball SGD: `v ← μv + g`, `Δθ = −η v`.
    Sgd { schedule: LearningRate, momentum: f64 },
}

impl Default for Optimizer {
    fn default() -> Self {
        Optimizer::RmsProp {
            schedule: LearningRate::Constant { value: 1e-4 },
            decay: 0.999,
            eps: RMSPROP_EPS,
        }
    }
}

/// Optimizer statistics carried between steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    /// Number of updates applied.
    pub count: u64,

    /// RMSProp running mean of squared gradients.
    pub second_moment: Option<Params>,

    /// SGD momentum buffer.
    pub velocity: Option<Params>,
}

impl OptimizerState {
    pub fn is_finite(&self) -> bool {
        self.second_moment.as_ref().map_or(true, Params::is_finite)
            && self.velocity.as_ref().map_or(true, Params::is_finite)
    }
}

impl Optimizer {
    pub fn init(&self, params: &Params) -> OptimizerState {
        match self {
            Optimizer::RmsProp { .. } => OptimizerState {
                count: 0,
                second_moment: Some(params.zeros_like()),
                velocity: None,
            },
            Optimizer::Sgd { momentum, .. } => OptimizerState {
                count: 0,
                second_moment: None,
                velocity: (*momentum > 0.0).then(|| params.zeros_like()),
            },
        }
    }

    /// Learning rate used for the next update.
    pub fn learning_rate(&self, state: &OptimizerState) -> f64 {
        match self {
            Optimizer::RmsProp { schedule, .. } | Optimizer::Sgd { schedule, .. } => schedule.at(state.count),
        }
    }

    pub fn update(&self, grads: &Params, state: &OptimizerState) -> (Params, OptimizerState) {
        let lr = self.learning_rate(state);
        match *self {
            Optimizer::RmsProp { decay, eps, .. } => {
                let nu = match &state.second_moment {
                    Some(nu) => nu.zip_map(grads, |v, g| decay * v + (1.0 - decay) * g * g),
                    None => grads.map(|g| (1.0 - decay) * g * g),
                };
                let updates = grads.zip_map(&nu, |g, v| -lr * g / (v + eps).sqrt());
                let next = OptimizerState {
                    count: state.count + 1,
                    second_moment: Some(nu),
                    velocity: None,
                };
                (updates, next)
            }
            Optimizer::Sgd { momentum, .. } => {
                let velocity = if momentum > 0.0 {
                    let v = match &state.velocity {
                        Some(v) => v.zip_map(grads, |v, g| momentum * v + g),
                        None => grads.clone(),
                    };
                    Some(v)
                } else {
                    None
                };
                let direction = velocity.as_ref().unwrap_or(grads);
                let updates = direction.map(|v| -lr * v);
                let next = OptimizerState {
                    count: state.count + 1,
                    second_moment: None,
                    velocity,
                };
                (updates, next)
            }
        }
    }
}

/// `θ + Δθ`.
pub fn apply_updates(params: &Params, updates: &Params) -> Params {
    params.zip_map(updates, |p, u| p + u)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::params::Dense;
    use ndarray::array;

    fn params(v: f64) -> Params {
        Params::new(vec![Dense {
            weight: array![[v, -v]],
            bias: Some(array![v]),
        }])
    }

    #[test]
    fn test_rmsprop_first_step() {
        let opt = Optimizer::RmsProp {
            schedule: LearningRate::Constant { value: 0.1 },
            decay: 0.9,
            eps: 0.0,
        };
        let p = params(1.0);
        let state = opt.init(&p);
        let (upd, next) = opt.update(&params(2.0), &state);
        // ν = 0.1·4 = 0.4, Δ = −0.1·2/√0.4
        let expected = -0.1 * 2.0 / 0.4f64.sqrt();
        assert!((upd.layers[0].weight[[0, 0]] - expected).abs() < 1e-12);
        assert!((upd.layers[0].weight[[0, 1]] + expected).abs() < 1e-12);
        assert_eq!(next.count, 1);
        let moved = apply_updates(&p, &upd);
        assert!((moved.layers[0].bias.as_ref().unwrap()[0] - (1.0 + expected)).abs() < 1e-12);
    }

    #[test]
    fn test_rmsprop_normalises_gradient_scale() {
        let opt = Optimizer::default();
        let state = opt.init(&params(0.0));
        let (small, _) = opt.update(&params(1.0), &state);
        let (large, _) = opt.update(&params(1e3), &state);
        let a = small.layers[0].weight[[0, 0]];
        let b = large.layers[0].weight[[0, 0]];
        assert!((a - b).abs() < 1e-3 * b.abs());
    }

    #[test]
    fn test_rmsprop_eps_sits_under_the_root() {
        let (lr, decay, eps) = (0.01, 0.9, 1e-8);
        let opt = Optimizer::RmsProp {
            schedule: LearningRate::Constant { value: lr },
            decay,
            eps,
        };
        let g = 1e-5;
        let state = opt.init(&params(0.0));
        let (upd, next) = opt.update(&params(g), &state);
        let nu = (1.0 - decay) * g * g;
        assert_eq!(next.second_moment.unwrap().layers[0].weight[[0, 0]], nu);
        let expected = -lr * g / (nu + eps).sqrt();
        let got = upd.layers[0].weight[[0, 0]];
        assert!((got - expected).abs() < 1e-12 * expected.abs());
        // √ν + ε would give a step about thirty times larger.
        let outside = -lr * g / (nu.sqrt() + eps);
        assert!((got - outside).abs() > 0.5 * outside.abs());
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let opt = Optimizer::Sgd {
            schedule: LearningRate::Constant { value: 0.5 },
            momentum: 0.9,
        };
        let g = params(1.0);
        let s0 = opt.init(&g);
        let (u1, s1) = opt.update(&g, &s0);
        let (u2, _) = opt.update(&g, &s1);
        assert!((u1.layers[0].weight[[0, 0]] + 0.5).abs() < 1e-12);
        assert!((u2.layers[0].weight[[0, 0]] + 0.5 * 1.9).abs() < 1e-12);
    }

    #[test]
    fn test_exponential_decay_schedule() {
        let lr = LearningRate::ExponentialDecay {
            init: 1e-3,
            decay_steps: 1000,
            rate: 0.9,
        };
        assert!((lr.at(0) - 1e-3).abs() < 1e-18);
        assert!((lr.at(1000) - 9e-4).abs() < 1e-15);
        assert!((lr.at(2000) - 8.1e-4).abs() < 1e-15);
    }
}
