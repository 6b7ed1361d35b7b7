//! Layered parameter records.
//!
//! Parameters are a fixed-schema list of dense layers rather than a map of
//! named tensors. Every tensorwise operation the optimizer and the gradient
//! engine need (`map`, `zip_map`, `scaled_add`) walks the same schema, so two
//! records built from the same [`Mlp`](super::mlp::Mlp) always line up.
//!
//! [`SigmaJacobian`] carries ∂Σ/∂θ: the parameter shapes with a leading k×k.

use ndarray::{s, Array1, Array2, Array3, Array4};
use serde::{Deserialize, Serialize};

/// One dense layer: `z = a·W + b` with `W ∈ R^{d_in × d_out}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub weight: Array2<f64>,
    pub bias: Option<Array1<f64>>,
}

impl Dense {
    pub fn zeros(d_in: usize, d_out: usize, use_bias: bool) -> Self {
        Self {
            weight: Array2::zeros((d_in, d_out)),
            bias: use_bias.then(|| Array1::zeros(d_out)),
        }
    }

    pub fn d_in(&self) -> usize {
        self.weight.nrows()
    }

    pub fn d_out(&self) -> usize {
        self.weight.ncols()
    }

    pub fn param_count(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, |b| b.len())
    }

    fn map(&self, f: &impl Fn(f64) -> f64) -> Self {
        Self {
            weight: self.weight.mapv(f),
            bias: self.bias.as_ref().map(|b| b.mapv(f)),
        }
    }

    fn zip_map(&self, other: &Dense, f: &impl Fn(f64, f64) -> f64) -> Self {
        let mut weight = self.weight.clone();
        weight.zip_mut_with(&other.weight, |x, &y| *x = f(*x, y));
        let bias = match (&self.bias, &other.bias) {
            (Some(a), Some(b)) => {
                let mut bias = a.clone();
                bias.zip_mut_with(b, |x, &y| *x = f(*x, y));
                Some(bias)
            }
            _ => None,
        };
        Self { weight, bias }
    }
}

/// Network parameters, one [`Dense`] per layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Params {
    pub layers: Vec<Dense>,
}

impl Params {
    pub fn new(layers: Vec<Dense>) -> Self {
        Self { layers }
    }

    /// Zero-filled record with the same schema.
    pub fn zeros_like(&self) -> Self {
        self.map(|_| 0.0)
    }

    /// Elementwise map over every tensor.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            layers: self.layers.iter().map(|l| l.map(&f)).collect(),
        }
    }

    /// Elementwise combination of two records with the same schema.
    pub fn zip_map(&self, other: &Params, f: impl Fn(f64, f64) -> f64) -> Self {
        assert_eq!(self.layers.len(), other.layers.len(), "parameter schema mismatch");
        Self {
            layers: self
                .layers
                .iter()
                .zip(other.layers.iter())
                .map(|(a, b)| a.zip_map(b, &f))
                .collect(),
        }
    }

    /// `self += alpha · other`.
    pub fn scaled_add(&mut self, alpha: f64, other: &Params) {
        for (a, b) in self.layers.iter_mut().zip(other.layers.iter()) {
            a.weight.scaled_add(alpha, &b.weight);
            if let (Some(ab), Some(bb)) = (a.bias.as_mut(), b.bias.as_ref()) {
                ab.scaled_add(alpha, bb);
            }
        }
    }

    /// Iterate over every scalar in schema order.
    pub fn iter(&self) -> impl Iterator<Item = &f64> + '_ {
        self.layers.iter().flat_map(|l| {
            l.weight
                .iter()
                .chain(l.bias.iter().flat_map(|b| b.iter()))
        })
    }

    pub fn num_params(&self) -> usize {
        self.layers.iter().map(Dense::param_count).sum()
    }

    /// Euclidean norm over all parameters.
    pub fn norm(&self) -> f64 {
        self.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.iter().all(|v| v.is_finite())
    }
}

/// ∂Σ/∂θ for one layer. Index `[a, b, ..]` holds ∂Σ_ab/∂(layer tensor).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JacobianLayer {
    pub weight: Array4<f64>,
    pub bias: Option<Array3<f64>>,
}

/// Covariance Jacobian over all layers (parameter rank + 2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SigmaJacobian {
    /// Number of eigenfunctions k.
    pub k: usize,
    pub layers: Vec<JacobianLayer>,
}

impl SigmaJacobian {
    /// Zero Jacobian shaped like `params` broadcast by k×k.
    pub fn zeros(params: &Params, k: usize) -> Self {
        let layers = params
            .layers
            .iter()
            .map(|l| JacobianLayer {
                weight: Array4::zeros((k, k, l.d_in(), l.d_out())),
                bias: l.bias.as_ref().map(|b| Array3::zeros((k, k, b.len()))),
            })
            .collect();
        Self { k, layers }
    }

    /// Tensor contraction Σ_ab A[a,b] · J_ab, giving a parameter-shaped record.
    pub fn contract(&self, a: &Array2<f64>) -> Params {
        assert_eq!(a.dim(), (self.k, self.k), "contraction matrix must be k×k");
        let layers = self
            .layers
            .iter()
            .map(|jl| {
                let (_, _, d_in, d_out) = jl.weight.dim();
                let mut weight = Array2::<f64>::zeros((d_in, d_out));
                let mut bias = jl.bias.as_ref().map(|b| Array1::<f64>::zeros(b.dim().2));
                for i in 0..self.k {
                    for j in 0..self.k {
                        let coeff = a[[i, j]];
                        if coeff == 0.0 {
                            continue;
                        }
                        weight.scaled_add(coeff, &jl.weight.slice(s![i, j, .., ..]));
                        if let (Some(acc), Some(jb)) = (bias.as_mut(), jl.bias.as_ref()) {
                            acc.scaled_add(coeff, &jb.slice(s![i, j, ..]));
                        }
                    }
                }
                Dense { weight, bias }
            })
            .collect();
        Params { layers }
    }

    pub fn is_finite(&self) -> bool {
        self.layers.iter().all(|l| {
            l.weight.iter().all(|v| v.is_finite())
                && l.bias.as_ref().map_or(true, |b| b.iter().all(|v| v.is_finite()))
        })
    }

    /// Largest absolute entry, for monitoring.
    pub fn max_abs(&self) -> f64 {
        self.layers
            .iter()
            .flat_map(|l| {
                l.weight
                    .iter()
                    .chain(l.bias.iter().flat_map(|b| b.iter()))
            })
            .fold(0.0f64, |m, v| m.max(v.abs()))
    }
}
