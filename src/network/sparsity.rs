//! Structured block sparsity for dense layers.
//!
//! Layer `l` of `L` keeps K overlapping diagonal bands of its weight matrix.
//! The band width shrinks with depth, `β_l = (L − l + 1)/L`, and band `k`
//! starts at offset `α_k = k/(K−1) · (l−1)/L` along both axes. Everything
//! outside the union of bands is pinned at zero.

use ndarray::Array2;

use super::params::Params;

/// Per-layer keep masks (`true` = trainable weight).
#[derive(Clone, Debug, PartialEq)]
pub struct SparsityMask {
    pub layers: Vec<Array2<bool>>,
}

impl SparsityMask {
    /// Build masks for every layer of `params` with `k_bands` bands.
    pub fn new(params: &Params, k_bands: usize) -> Self {
        let total = params.layers.len();
        let layers = params
            .layers
            .iter()
            .enumerate()
            .map(|(l, layer)| layer_mask(layer.d_in(), layer.d_out(), k_bands, l, total))
            .collect();
        Self { layers }
    }

    /// Zero every masked weight. Biases are never masked.
    pub fn apply(&self, params: &Params) -> Params {
        let mut out = params.clone();
        for (layer, mask) in out.layers.iter_mut().zip(self.layers.iter()) {
            layer
                .weight
                .zip_mut_with(mask, |w, &keep| if !keep { *w = 0.0 });
        }
        out
    }

    /// Fraction of weights kept.
    pub fn density(&self) -> f64 {
        let total: usize = self.layers.iter().map(|m| m.len()).sum();
        if total == 0 {
            return 1.0;
        }
        let kept: usize = self
            .layers
            .iter()
            .map(|m| m.iter().filter(|&&k| k).count())
            .sum();
        kept as f64 / total as f64
    }
}

/// Mask for one `m × n` weight matrix at layer index `l` of `total`.
///
/// `k_bands` must be at least 2.
pub fn layer_mask(m: usize, n: usize, k_bands: usize, l: usize, total: usize) -> Array2<bool> {
    let lf = l as f64;
    let total_f = total as f64;
    let beta = (total_f - lf + 1.0) / total_f;

    let mut rows_in = vec![false; m];
    let mut cols_in = vec![false; n];
    for k in 0..k_bands {
        let alpha = k as f64 / (k_bands as f64 - 1.0) * (lf - 1.0) / total_f;
        let (lo_in, hi_in) = (alpha * m as f64, (alpha + beta) * m as f64);
        let (lo_out, hi_out) = (alpha * n as f64, (alpha + beta) * n as f64);
        for (i, hit) in rows_in.iter_mut().enumerate() {
            let fi = i as f64;
            *hit |= fi >= lo_in && fi <= hi_in;
        }
        for (j, hit) in cols_in.iter_mut().enumerate() {
            let fj = j as f64;
            *hit |= fj >= lo_out && fj <= hi_out;
        }
    }
    Array2::from_shape_fn((m, n), |(i, j)| rows_in[i] && cols_in[j])
}
