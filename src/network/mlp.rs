//! Feed-forward eigenfunction network `u_θ : R^d → R^k`.
//!
//! `u(x) = m(x) · MLP_θ(x)` where `m` is the boundary mask. The forward pass
//! propagates a [`Jet`] so that operator actions are available without
//! nested differentiation, and records a [`Tape`] for two reverse passes:
//! - [`Mlp::backward`]: full vector–Jacobian product of a cotangent on the
//!   output jet (used for ∂Π/∂θ, which depends on derivatives of u)
//! - [`Mlp::column_deltas`]: per-sample value-channel deltas for one output
//!   column (used to build ∂Σ/∂θ one column at a time)

use ndarray::{Array2, ArrayView1, ArrayView2, Axis, Zip};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use super::activation::Activation;
use super::jvp::{Jet, ScalarField};
use super::mask::BoundaryMask;
use super::params::{Dense, Params};
use crate::error::{Result, SpinError};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    /// Layer widths including input dimension d and output count k.
    pub widths: Vec<usize>,

    pub activation: Activation,

    pub use_bias: bool,

    pub mask: BoundaryMask,
}

/// Cached intermediates of one jet forward pass.
#[derive(Clone, Debug)]
pub struct Tape {
    /// Input jet to each dense layer.
    pub inputs: Vec<Jet>,

    /// Pre-activation jet of each dense layer (the last one is the raw output).
    pub pre: Vec<Jet>,

    /// Boundary mask field at the batch.
    pub mask: ScalarField,

    /// Masked output jet u.
    pub output: Jet,
}

impl Tape {
    /// Output values U (N×k).
    pub fn values(&self) -> &Array2<f64> {
        &self.output.value
    }
}

impl Mlp {
    pub fn new(widths: Vec<usize>, activation: Activation, use_bias: bool, mask: BoundaryMask) -> Result<Self> {
        if widths.len() < 2 {
            return Err(SpinError::config(format!(
                "network needs at least input and output widths, got {widths:?}"
            )));
        }
        if widths.iter().any(|&w| w == 0) {
            return Err(SpinError::config(format!("layer widths must be positive, got {widths:?}")));
        }
        Ok(Self {
            widths,
            activation,
            use_bias,
            mask,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.widths[0]
    }

    /// Number of eigenfunctions k.
    pub fn output_dim(&self) -> usize {
        self.widths[self.widths.len() - 1]
    }

    pub fn n_layers(&self) -> usize {
        self.widths.len() - 1
    }

    /// All-zero parameters with this architecture's schema.
    pub fn zeros(&self) -> Params {
        Params::new(
            self.widths
                .windows(2)
                .map(|w| Dense::zeros(w[0], w[1], self.use_bias))
                .collect(),
        )
    }

    /// LeCun-normal weights `N(0, 1/d_in)`, zero biases.
    pub fn init(&self, rng: &mut StdRng) -> Params {
        let layers = self
            .widths
            .windows(2)
            .map(|w| {
                let (d_in, d_out) = (w[0], w[1]);
                let mut layer = Dense::zeros(d_in, d_out, self.use_bias);
                let std = (1.0 / d_in as f64).sqrt();
                if let Ok(dist) = Normal::new(0.0, std) {
                    layer.weight.mapv_inplace(|_| dist.sample(rng));
                }
                layer
            })
            .collect();
        Params::new(layers)
    }

    /// Check that `params` matches this architecture.
    pub fn check_params(&self, params: &Params) -> Result<()> {
        if params.layers.len() != self.n_layers() {
            return Err(SpinError::config(format!(
                "expected {} layers, parameters have {}",
                self.n_layers(),
                params.layers.len()
            )));
        }
        for (l, (layer, w)) in params.layers.iter().zip(self.widths.windows(2)).enumerate() {
            if layer.weight.dim() != (w[0], w[1]) || layer.bias.is_some() != self.use_bias {
                return Err(SpinError::config(format!(
                    "layer {l} has shape {:?}, expected ({}, {})",
                    layer.weight.dim(),
                    w[0],
                    w[1]
                )));
            }
        }
        Ok(())
    }

    /// Masked outputs U (N×k), values only.
    pub fn forward(&self, params: &Params, x: &ArrayView2<f64>) -> Array2<f64> {
        let last = self.n_layers() - 1;
        let mut a = x.to_owned();
        for (l, layer) in params.layers.iter().enumerate() {
            let mut z = a.dot(&layer.weight);
            if let Some(b) = &layer.bias {
                z += b;
            }
            a = if l == last {
                z
            } else {
                z.mapv(|v| self.activation.value(v))
            };
        }
        let m = self.mask.field(x).value.insert_axis(Axis(1));
        a * &m
    }

    /// Masked output jet plus the tape for the reverse passes.
    pub fn forward_jet(&self, params: &Params, x: &ArrayView2<f64>) -> Tape {
        let last = self.n_layers() - 1;
        let mut inputs = Vec::with_capacity(self.n_layers());
        let mut pre = Vec::with_capacity(self.n_layers());
        let mut a = Jet::seed(x);
        for (l, layer) in params.layers.iter().enumerate() {
            let z = a.linear(&layer.weight, layer.bias.as_ref());
            let next = if l == last {
                z.clone()
            } else {
                z.activate(self.activation)
            };
            inputs.push(a);
            pre.push(z);
            a = next;
        }
        let mask = self.mask.field(x);
        let output = a.scale_by(&mask);
        Tape {
            inputs,
            pre,
            mask,
            output,
        }
    }

    /// Vector–Jacobian product of a cotangent on the masked output jet.
    pub fn backward(&self, params: &Params, tape: &Tape, cotangent: &Jet) -> Params {
        let n_layers = self.n_layers();
        let mut grads: Vec<Dense> = Vec::with_capacity(n_layers);
        let mut cot = cotangent.scale_by_backward(&tape.mask);
        for l in (0..n_layers).rev() {
            if l != n_layers - 1 {
                cot = cot.activate_backward(&tape.pre[l], self.activation);
            }
            let layer = &params.layers[l];
            let (grad_in, grad_w, grad_b) = cot.linear_backward(&tape.inputs[l], &layer.weight, l > 0);
            grads.push(Dense {
                weight: grad_w,
                bias: layer.bias.as_ref().map(|_| grad_b),
            });
            if let Some(next) = grad_in {
                cot = next;
            }
        }
        grads.reverse();
        Params::new(grads)
    }

    /// Per-sample deltas ∂u_{n,col}/∂z_l for every layer l (value channel).
    ///
    /// Row n of entry l is the gradient of the single scalar `u_{n,col}` with
    /// respect to the pre-activations of layer l at sample n. Contracting
    /// `inputs[l].valueᵀ · diag(w) · deltas[l]` gives `Σ_n w_n ∂u_{n,col}/∂W_l`.
    pub fn column_deltas(&self, params: &Params, tape: &Tape, col: usize) -> Vec<Array2<f64>> {
        let n_layers = self.n_layers();
        let n = tape.output.batch();
        let k = self.output_dim();
        let mut delta = Array2::<f64>::zeros((n, k));
        delta.column_mut(col).assign(&tape.mask.value);

        let mut deltas = Vec::with_capacity(n_layers);
        for l in (0..n_layers).rev() {
            if l != n_layers - 1 {
                let act = self.activation;
                Zip::from(&mut delta)
                    .and(&tape.pre[l].value)
                    .for_each(|g, &z| *g *= act.derivatives(z).d1);
            }
            let next = (l > 0).then(|| delta.dot(&params.layers[l].weight.t()));
            deltas.push(delta);
            match next {
                Some(d) => delta = d,
                None => break,
            }
        }
        deltas.reverse();
        deltas
    }

    /// `Σ_n w_n ∂u_{n,col}/∂θ` from precomputed column deltas.
    pub fn weighted_column_grad(
        &self,
        params: &Params,
        tape: &Tape,
        deltas: &[Array2<f64>],
        weights: &ArrayView1<f64>,
    ) -> Params {
        let w_col = weights.view().insert_axis(Axis(1));
        let layers = deltas
            .iter()
            .enumerate()
            .map(|(l, delta)| {
                let weighted = &tape.inputs[l].value * &w_col;
                Dense {
                    weight: weighted.t().dot(delta),
                    bias: params.layers[l]
                        .bias
                        .as_ref()
                        .map(|_| delta.t().dot(weights)),
                }
            })
            .collect();
        Params::new(layers)
    }
}
