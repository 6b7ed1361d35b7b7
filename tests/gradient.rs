//! End-to-end gradient checks.
//!
//! With k = 1 the masked outer derivatives are exact, so the step direction
//! must match finite differences of the Rayleigh quotient π/σ on the batch.
//! With k = 2 the masked direction is only checked over many steps, against
//! trace(Λ) of the current parameters on a fixed grid.

use std::f64::consts::PI;

use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use spectral_inference::learning::gradient::{contract, pi_term, raw_sigma_jacobian, sigma_term, OuterGradients};
use spectral_inference::learning::{LearningRate, Optimizer, Spin};
use spectral_inference::linalg::{factorize, Averages, CovarianceEstimator};
use spectral_inference::network::{Activation, BoundaryMask, Mlp, Params, SigmaJacobian};
use spectral_inference::physics::{BoxSampler, Hydrogen, Laplacian, Operator};
use spectral_inference::runtime::RunConfig;

fn rayleigh_quotient(mlp: &Mlp, params: &Params, op: &dyn Operator, x: &ArrayView2<f64>) -> f64 {
    let tape = mlp.forward_jet(params, x);
    let hu = op.apply(x, &tape.output);
    let u = tape.values();
    let n = u.nrows() as f64;
    let pi = u.t().dot(&hu)[[0, 0]] / n;
    let sigma = u.t().dot(u)[[0, 0]] / n;
    pi / sigma
}

fn analytic_gradient(mlp: &Mlp, params: &Params, op: &dyn Operator, x: &ArrayView2<f64>) -> Params {
    let tape = mlp.forward_jet(params, x);
    let coeffs = op.coefficients(x);
    let hu = coeffs.apply(&tape.output);
    let raw = raw_sigma_jacobian(mlp, params, &tape);
    let cold = Averages::cold(SigmaJacobian::zeros(params, 1));
    let update = CovarianceEstimator::new()
        .update(&cold, &tape.values().view(), &hu.view(), &raw, 1.0)
        .unwrap();
    let whitening = factorize(&update.averages.sigma).unwrap();
    let lambda = whitening.rayleigh(&update.pi_batch);
    let outer = OuterGradients::new(&whitening, &lambda);
    let pi_grad = pi_term(mlp, params, &tape, &coeffs, &update.pi_context, &outer);
    let sigma_grad = sigma_term(&update.averages.jacobian, &outer);
    // +1 keeps the gradient of tr(Λ) itself rather than a descent direction.
    contract(&pi_grad, &sigma_grad, 1.0).unwrap()
}

fn laplace_setup() -> (Mlp, Params, Array2<f64>) {
    let mlp = Mlp::new(
        vec![1, 5, 1],
        Activation::Tanh,
        true,
        BoundaryMask::Box {
            lo: 0.0,
            hi: PI,
            scale: 0.1,
        },
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let params = mlp.init(&mut rng);
    let x = BoxSampler::new(0.0, PI, 1).unwrap().sample(&mut rng, 40);
    (mlp, params, x)
}

#[test]
fn test_single_eigenfunction_gradient_matches_finite_differences() {
    let (mlp, params, x) = laplace_setup();
    let grad = analytic_gradient(&mlp, &params, &Laplacian, &x.view());

    let h = 1e-6;
    for l in 0..params.layers.len() {
        let (rows, cols) = params.layers[l].weight.dim();
        for r in 0..rows {
            for c in 0..cols {
                let mut plus = params.clone();
                let mut minus = params.clone();
                plus.layers[l].weight[[r, c]] += h;
                minus.layers[l].weight[[r, c]] -= h;
                let fd = (rayleigh_quotient(&mlp, &plus, &Laplacian, &x.view())
                    - rayleigh_quotient(&mlp, &minus, &Laplacian, &x.view()))
                    / (2.0 * h);
                let an = grad.layers[l].weight[[r, c]];
                assert!(
                    (fd - an).abs() < 1e-5 * (1.0 + fd.abs()),
                    "layer {l} weight ({r},{c}): fd {fd} vs analytic {an}"
                );
            }
        }
        let n_bias = params.layers[l].bias.as_ref().map_or(0, |b| b.len());
        for j in 0..n_bias {
            let mut plus = params.clone();
            let mut minus = params.clone();
            plus.layers[l].bias.as_mut().unwrap()[j] += h;
            minus.layers[l].bias.as_mut().unwrap()[j] -= h;
            let fd = (rayleigh_quotient(&mlp, &plus, &Laplacian, &x.view())
                - rayleigh_quotient(&mlp, &minus, &Laplacian, &x.view()))
                / (2.0 * h);
            let an = grad.layers[l].bias.as_ref().unwrap()[j];
            assert!(
                (fd - an).abs() < 1e-5 * (1.0 + fd.abs()),
                "layer {l} bias {j}: fd {fd} vs analytic {an}"
            );
        }
    }
}

fn sgd(lr: f64) -> Optimizer {
    Optimizer::Sgd {
        schedule: LearningRate::Constant { value: lr },
        momentum: 0.0,
    }
}

#[test]
fn test_laplacian_step_increases_rayleigh_quotient() {
    let (mlp, params, x) = laplace_setup();
    let spin = Spin::new(mlp.clone(), Box::new(Laplacian), sgd(1e-5), None).unwrap();
    let mut state = spin.initial_state(&mut StdRng::seed_from_u64(0));
    state.params = params.clone();

    let out = spin.step(&state, &x.view(), 1.0).unwrap();
    assert!(out.grad_norm > 1e-6);
    let before = rayleigh_quotient(&mlp, &params, &Laplacian, &x.view());
    let after = rayleigh_quotient(&mlp, &out.state.params, &Laplacian, &x.view());
    assert!(after > before, "{after} <= {before}");
    assert!((out.loss - before).abs() < 1e-10 * (1.0 + before.abs()));
}

#[test]
fn test_hydrogen_step_decreases_rayleigh_quotient() {
    let mlp = Mlp::new(vec![2, 6, 1], Activation::Tanh, true, BoundaryMask::None).unwrap();
    let op = Hydrogen {
        charge: 1.0,
        softening: 0.1,
    };
    let mut rng = StdRng::seed_from_u64(21);
    let x = BoxSampler::new(-3.0, 3.0, 2).unwrap().sample(&mut rng, 64);
    let spin = Spin::new(mlp.clone(), Box::new(op), sgd(1e-5), None).unwrap();
    let state = spin.initial_state(&mut rng);

    let out = spin.step(&state, &x.view(), 1.0).unwrap();
    assert!(out.grad_norm > 1e-6);
    let before = rayleigh_quotient(&mlp, &state.params, &op, &x.view());
    let after = rayleigh_quotient(&mlp, &out.state.params, &op, &x.view());
    assert!(after < before, "{after} >= {before}");
}

#[test]
fn test_two_eigenfunction_trace_rises_over_many_steps() {
    let config = RunConfig {
        hidden: vec![32],
        n_eigenfunctions: 2,
        learning_rate: 3e-4,
        ..RunConfig::default()
    };
    let spin = Spin::new(config.build_model().unwrap(), Box::new(Laplacian), config.build_optimizer(), None).unwrap();
    let mut rng = StdRng::seed_from_u64(17);
    let mut state = spin.initial_state(&mut rng);

    // Sharpen the hidden features and spread their kinks over the box so
    // the starting pair is far from sin x, sin 2x.
    let first = &mut state.params.layers[0];
    let width = first.weight.ncols();
    first.weight.mapv_inplace(|w| 4.0 * w);
    if let Some(bias) = first.bias.as_mut() {
        for j in 0..width {
            bias[j] = -first.weight[[0, j]] * PI * (j as f64 + 0.5) / width as f64;
        }
    }

    let sampler = BoxSampler::new(0.0, PI, 1).unwrap();
    let grid = sampler.midpoints(200);
    let mut traces = Vec::new();
    for i in 0..150 {
        let batch = sampler.sample(&mut rng, 128);
        let beta = if i == 0 { 1.0 } else { config.beta };
        state = spin.step(&state, &batch.view(), beta).unwrap().state;
        // β = 1 whitens with the grid's own covariance.
        let pairs = spin.eigenpairs(&state, &grid.view(), 1.0).unwrap();
        traces.push(pairs.eigenvalues.sum());
    }

    let mean = |w: &[f64]| w.iter().sum::<f64>() / w.len() as f64;
    let early = mean(&traces[..25]);
    let late = mean(&traces[125..]);
    assert!(traces.iter().all(|t| t.is_finite()));
    assert!(late > early, "trace(Λ) fell from {early} to {late}");
}
