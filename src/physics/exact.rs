//! Closed-form reference spectra.

use ndarray::{Array1, Array2, ArrayView1};

use super::operator::OperatorKind;

/// Eigenvalues of the Dirichlet Laplacian on `[lo, hi]^dim`, largest first.
///
/// λ = −(π/w)² Σ_i n_i², n_i ≥ 1, w = hi − lo.
pub fn box_laplacian_eigenvalues(lo: f64, hi: f64, dim: usize, count: usize) -> Vec<f64> {
    if dim == 0 || count == 0 {
        return Vec::new();
    }
    let scale = (std::f64::consts::PI / (hi - lo)).powi(2);
    // Any of the `count` largest eigenvalues has every n_i ≤ count.
    let max_n = count;
    let mut sums = vec![0usize];
    for _ in 0..dim {
        let mut next = Vec::with_capacity(sums.len() * max_n);
        for s in &sums {
            for n in 1..=max_n {
                next.push(s + n * n);
            }
        }
        next.sort_unstable();
        next.truncate(count);
        sums = next;
    }
    sums.into_iter().map(|s| -scale * s as f64).collect()
}

/// The first `count` 1-D Dirichlet eigenfunctions `√(2/w) sin(nπ(x − lo)/w)`, one per column.
pub fn box_eigenfunctions_1d(x: &ArrayView1<f64>, lo: f64, hi: f64, count: usize) -> Array2<f64> {
    let w = hi - lo;
    let norm = (2.0 / w).sqrt();
    Array2::from_shape_fn((x.len(), count), |(i, n)| {
        norm * ((n + 1) as f64 * std::f64::consts::PI * (x[i] - lo) / w).sin()
    })
}

/// Hydrogen-like bound-state energies, lowest first, each repeated by its degeneracy.
///
/// 3-D: E_n = −Z²/(2n²) with degeneracy n².
/// 2-D: E_n = −Z²/(2(n − ½)²) with degeneracy 2n − 1.
/// Other dimensions have no tabulated reference.
pub fn hydrogen_energies(charge: f64, dim: usize, count: usize) -> Option<Vec<f64>> {
    if dim != 2 && dim != 3 {
        return None;
    }
    let mut out = Vec::with_capacity(count);
    let mut n = 1usize;
    while out.len() < count {
        let (level, degeneracy) = if dim == 3 {
            (n as f64, n * n)
        } else {
            (n as f64 - 0.5, 2 * n - 1)
        };
        let e = -charge * charge / (2.0 * level * level);
        for _ in 0..degeneracy {
            if out.len() == count {
                break;
            }
            out.push(e);
        }
        n += 1;
    }
    Some(out)
}

/// Reference eigenvalues for a configured problem, in training order.
pub fn reference_eigenvalues(kind: &OperatorKind, lo: f64, hi: f64, dim: usize, count: usize) -> Option<Array1<f64>> {
    match *kind {
        OperatorKind::Laplacian => Some(Array1::from(box_laplacian_eigenvalues(lo, hi, dim, count))),
        OperatorKind::Hydrogen { charge, .. } => hydrogen_energies(charge, dim, count).map(Array1::from),
    }
}
