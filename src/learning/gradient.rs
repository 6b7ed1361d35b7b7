//! Bias-corrected gradient of trace(Λ).
//!
//! With Σ̄ = L·Lᵀ and Λ = L⁻¹ Π L⁻ᵀ, eigenvalue λ_i only receives gradient
//! through row i of L⁻¹, which stops higher eigenfunctions from pulling on
//! lower ones. The resulting masked outer derivatives are
//!
//! ```text
//! A₁ = L⁻ᵀ · diag(L⁻¹)                  (w.r.t. Π)
//! A₂ = −L⁻ᵀ · triu(Λ · diag(L⁻¹))       (w.r.t. Σ)
//! ```
//!
//! They coincide with ∂tr(Λ)/∂Π and ∂tr(Λ)/∂Σ when k = 1.
//!
//! The Π-term is pulled back through the current batch, while the Σ-term is
//! contracted against the moving-average Jacobian J̄. Using J̄ rather than the
//! batch Jacobian removes the bias of differentiating through Σ̄⁻¹.

use ndarray::Array2;
use rayon::prelude::*;

use crate::error::{Result, SpinError, Stage};
use crate::linalg::cholesky::Whitening;
use crate::linalg::covariance::{Covariance, CovarianceContext, CustomVjp};
use crate::network::mlp::{Mlp, Tape};
use crate::network::params::{Params, SigmaJacobian};
use crate::physics::operator::Coefficients;

/// Masked outer derivatives A₁, A₂ at the current whitening.
#[derive(Clone, Debug)]
pub struct OuterGradients {
    pub wrt_pi: Array2<f64>,
    pub wrt_sigma: Array2<f64>,
}

impl OuterGradients {
    pub fn new(whitening: &Whitening, lambda: &Array2<f64>) -> Self {
        let l_inv_t = whitening.l_inv.t();
        let wrt_pi = l_inv_t.dot(&whitening.l_inv_diag);
        let wrt_sigma = -l_inv_t.dot(&triu(&lambda.dot(&whitening.l_inv_diag)));
        Self { wrt_pi, wrt_sigma }
    }
}

/// Upper triangle including the diagonal.
pub fn triu(a: &Array2<f64>) -> Array2<f64> {
    let mut out = a.clone();
    for ((i, j), v) in out.indexed_iter_mut() {
        if j < i {
            *v = 0.0;
        }
    }
    out
}

/// ∂Σ_batch/∂θ for Σ_batch = Covariance(U, U).
///
/// For each (a, b) the covariance backward with G = E_ab yields a cotangent on
/// U supported on column b; summing both branches gives J_ab =
/// Σ_n w_n ∂u_nb/∂θ. One value-channel backward per output column b provides
/// ∂u_nb/∂z_l for all layers, after which every row a is a cheap contraction.
pub fn raw_sigma_jacobian(mlp: &Mlp, params: &Params, tape: &Tape) -> SigmaJacobian {
    let k = mlp.output_dim();
    let u = tape.values();
    let (_, ctx) = Covariance.forward((u.view(), u.view()));

    let columns: Vec<Vec<Params>> = (0..k)
        .into_par_iter()
        .map(|b| {
            let deltas = mlp.column_deltas(params, tape, b);
            (0..k)
                .map(|a| {
                    let weights = column_cotangent(&ctx, a, b);
                    mlp.weighted_column_grad(params, tape, &deltas, &weights.view())
                })
                .collect()
        })
        .collect();

    let mut jac = SigmaJacobian::zeros(params, k);
    for (b, column) in columns.iter().enumerate() {
        for (a, grad) in column.iter().enumerate() {
            for (jl, gl) in jac.layers.iter_mut().zip(grad.layers.iter()) {
                jl.weight.slice_mut(ndarray::s![a, b, .., ..]).assign(&gl.weight);
                if let (Some(jb), Some(gb)) = (jl.bias.as_mut(), gl.bias.as_ref()) {
                    jb.slice_mut(ndarray::s![a, b, ..]).assign(gb);
                }
            }
        }
    }
    jac
}

/// Column b of the summed covariance cotangent for G = E_ab.
fn column_cotangent(ctx: &CovarianceContext, a: usize, b: usize) -> ndarray::Array1<f64> {
    let k = ctx.x.ncols();
    let mut g = Array2::<f64>::zeros((k, k));
    g[[a, b]] = 1.0;
    let (gx, gy) = Covariance.backward(ctx, &g);
    &gx.column(b) + &gy.column(b)
}

/// Pull A₁ back through Π = Covariance(U, HU) and the network.
pub fn pi_term(
    mlp: &Mlp,
    params: &Params,
    tape: &Tape,
    coeffs: &Coefficients,
    pi_context: &CovarianceContext,
    outer: &OuterGradients,
) -> Params {
    let (u_bar, hu_bar) = Covariance.backward(pi_context, &outer.wrt_pi);
    let mut cot = coeffs.backward(&hu_bar, tape.output.dims());
    cot.value += &u_bar;
    mlp.backward(params, tape, &cot)
}

/// Σ_ab A₂[a, b] · J̄_ab.
pub fn sigma_term(jacobian_avg: &SigmaJacobian, outer: &OuterGradients) -> Params {
    jacobian_avg.contract(&outer.wrt_sigma)
}

/// Full descent direction `sign · (Π-term + Σ-term)`.
pub fn contract(
    pi_grad: &Params,
    sigma_grad: &Params,
    descent_sign: f64,
) -> Result<Params> {
    let total = pi_grad.zip_map(sigma_grad, |p, s| descent_sign * (p + s));
    if !total.is_finite() {
        return Err(SpinError::numerical(
            Stage::GradientContraction,
            "gradient has non-finite entries",
        ));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::cholesky::factorize;
    use crate::network::{Activation, BoundaryMask};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_triu() {
        let a = array![[1.0, 2.0], [3.0, 4.0]];
        assert_eq!(triu(&a), array![[1.0, 2.0], [0.0, 4.0]]);
    }

    #[test]
    fn test_outer_gradients_scalar_case() {
        // k = 1: tr(Λ) = π/σ
        let sigma = array![[4.0]];
        let pi = array![[-3.0]];
        let w = factorize(&sigma).unwrap();
        let lambda = w.rayleigh(&pi);
        let g = OuterGradients::new(&w, &lambda);
        assert!((g.wrt_pi[[0, 0]] - 0.25).abs() < 1e-15);
        assert!((g.wrt_sigma[[0, 0]] - 3.0 / 16.0).abs() < 1e-15);
    }

    #[test]
    fn test_outer_gradient_wrt_pi_exact_for_diagonal_sigma() {
        // With L diagonal the masking is inactive and A₁ = Σ⁻¹ = ∂tr(Λ)/∂Π.
        let sigma = array![[2.0, 0.0, 0.0], [0.0, 1.5, 0.0], [0.0, 0.0, 0.5]];
        let pi = array![[-1.0, 0.2, 0.0], [0.4, -2.0, 0.3], [0.1, 0.0, -0.5]];
        let w = factorize(&sigma).unwrap();
        let g = OuterGradients::new(&w, &w.rayleigh(&pi));
        let trace = |p: &Array2<f64>| w.rayleigh(p).diag().sum();
        let h = 1e-6;
        for i in 0..3 {
            for j in 0..3 {
                let mut pp = pi.clone();
                pp[[i, j]] += h;
                let fd = (trace(&pp) - trace(&pi)) / h;
                assert!((fd - g.wrt_pi[[i, j]]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_raw_jacobian_matches_finite_differences() {
        let mlp = Mlp::new(vec![1, 6, 3], Activation::Tanh, true, BoundaryMask::None).unwrap();
        let params = mlp.init(&mut StdRng::seed_from_u64(5));
        let x = array![[0.2], [0.9], [-0.4], [1.3], [0.6]];
        let n = x.nrows() as f64;
        let tape = mlp.forward_jet(&params, &x.view());
        let jac = raw_sigma_jacobian(&mlp, &params, &tape);
        let u = mlp.forward(&params, &x.view());

        // J_ab = (2/N) Σ_n u_na ∂u_nb/∂θ, not symmetric in (a, b).
        let expected = |du: &Array2<f64>| u.t().dot(du) * (2.0 / n);
        let h = 1e-6;
        for (l, r, c) in [(0, 0, 3), (1, 4, 1), (1, 2, 0), (1, 5, 2)] {
            let mut plus = params.clone();
            let mut minus = params.clone();
            plus.layers[l].weight[[r, c]] += h;
            minus.layers[l].weight[[r, c]] -= h;
            let du = (mlp.forward(&plus, &x.view()) - mlp.forward(&minus, &x.view())) / (2.0 * h);
            let want = expected(&du);
            for a in 0..3 {
                for b in 0..3 {
                    let got = jac.layers[l].weight[[a, b, r, c]];
                    assert!(
                        (want[[a, b]] - got).abs() < 1e-7,
                        "layer {l} weight ({r},{c}) J[{a},{b}]: {} vs {got}",
                        want[[a, b]]
                    );
                }
            }
        }

        for (l, j) in [(0, 2), (1, 1)] {
            let mut plus = params.clone();
            let mut minus = params.clone();
            plus.layers[l].bias.as_mut().unwrap()[j] += h;
            minus.layers[l].bias.as_mut().unwrap()[j] -= h;
            let du = (mlp.forward(&plus, &x.view()) - mlp.forward(&minus, &x.view())) / (2.0 * h);
            let want = expected(&du);
            for a in 0..3 {
                for b in 0..3 {
                    let got = jac.layers[l].bias.as_ref().unwrap()[[a, b, j]];
                    assert!((want[[a, b]] - got).abs() < 1e-7, "layer {l} bias {j} J[{a},{b}]");
                }
            }
        }

        // The output-layer weight feeding column c only moves u_·c, so J_ab vanishes for b ≠ c.
        assert_eq!(jac.layers[1].weight[[0, 1, 4, 2]], 0.0);
        assert!(jac.layers[1].weight[[1, 2, 4, 2]].abs() > 0.0);
    }

    #[test]
    fn test_contract_rejects_non_finite() {
        let p = Params::new(vec![crate::network::params::Dense::zeros(1, 1, false)]);
        let mut bad = p.clone();
        bad.layers[0].weight[[0, 0]] = f64::NAN;
        let err = contract(&p, &bad, 1.0).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::GradientContraction));
        assert!(contract(&p, &p, -1.0).is_ok());
    }
}
