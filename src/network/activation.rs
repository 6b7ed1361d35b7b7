//! Pointwise activations with derivatives up to third order.
//!
//! The forward pass propagates second derivatives in the input coordinates
//! (the operators are second order), and the backward pass through that
//! propagation needs one order more.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Sigmoid,
    Softplus,
    Tanh,
}

/// σ(z) and its first three derivatives at one point.
#[derive(Clone, Copy, Debug)]
pub struct Derivatives {
    pub f: f64,
    pub d1: f64,
    pub d2: f64,
    pub d3: f64,
}

impl Activation {
    pub fn name(&self) -> &'static str {
        match self {
            Activation::Sigmoid => "sigmoid",
            Activation::Softplus => "softplus",
            Activation::Tanh => "tanh",
        }
    }

    pub fn value(&self, z: f64) -> f64 {
        match self {
            Activation::Sigmoid => sigmoid(z),
            Activation::Softplus => softplus(z),
            Activation::Tanh => z.tanh(),
        }
    }

    pub fn derivatives(&self, z: f64) -> Derivatives {
        match self {
            Activation::Sigmoid => {
                let s = sigmoid(z);
                let d1 = s * (1.0 - s);
                let d2 = d1 * (1.0 - 2.0 * s);
                let d3 = d2 * (1.0 - 2.0 * s) - 2.0 * d1 * d1;
                Derivatives { f: s, d1, d2, d3 }
            }
            Activation::Softplus => {
                // softplus' = sigmoid
                let s = sigmoid(z);
                let s1 = s * (1.0 - s);
                let s2 = s1 * (1.0 - 2.0 * s);
                Derivatives {
                    f: softplus(z),
                    d1: s,
                    d2: s1,
                    d3: s2,
                }
            }
            Activation::Tanh => {
                let t = z.tanh();
                let d1 = 1.0 - t * t;
                let d2 = -2.0 * t * d1;
                let d3 = -2.0 * (d1 * d1 + t * d2);
                Derivatives { f: t, d1, d2, d3 }
            }
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// log(1 + eᶻ) without overflow.
fn softplus(z: f64) -> f64 {
    z.max(0.0) + (-z.abs()).exp().ln_1p()
}
