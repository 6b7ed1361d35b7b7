//! Cholesky whitening of the averaged covariance.
//!
//! Σ̄ = L·Lᵀ with L lower-triangular and positive on the diagonal. The
//! orthonormalising map applied to raw network outputs is U ↦ U·L⁻ᵀ, so that
//! the whitened outputs have identity covariance under Σ̄. L is inverted by
//! forward substitution; Σ̄ itself is never inverted.

use ndarray::{Array1, Array2, ArrayView2};

use crate::error::{Result, SpinError, Stage};

/// Pivots smaller than this fraction of the original diagonal entry are
/// treated as rank collapse.
pub const PIVOT_REL_TOL: f64 = 1e-10;

/// The whitening transform derived from one averaged covariance.
#[derive(Clone, Debug)]
pub struct Whitening {
    /// Lower Cholesky factor L.
    pub l: Array2<f64>,

    /// Explicit inverse L⁻¹ (lower-triangular).
    pub l_inv: Array2<f64>,

    /// diag(diag(L⁻¹)) as a full k×k matrix.
    pub l_inv_diag: Array2<f64>,
}

impl Whitening {
    /// Number of eigenfunctions k.
    pub fn dim(&self) -> usize {
        self.l.nrows()
    }

    /// Whitened operator matrix Λ = L⁻¹ Π L⁻ᵀ.
    pub fn rayleigh(&self, pi: &Array2<f64>) -> Array2<f64> {
        self.l_inv.dot(pi).dot(&self.l_inv.t())
    }

    /// Orthonormalised eigenfunction values U·L⁻ᵀ.
    pub fn whiten(&self, u: &ArrayView2<f64>) -> Array2<f64> {
        u.dot(&self.l_inv.t())
    }
}

/// Factorise Σ̄ into its Cholesky factor and explicit triangular inverse.
pub fn factorize(sigma: &Array2<f64>) -> Result<Whitening> {
    let l = cholesky(sigma)?;
    let l_inv = invert_lower(&l);
    let l_inv_diag = Array2::from_diag(&l_inv.diag());
    Ok(Whitening {
        l,
        l_inv,
        l_inv_diag,
    })
}

/// Cholesky–Banachiewicz factorisation.
pub fn cholesky(a: &Array2<f64>) -> Result<Array2<f64>> {
    let (n, m) = a.dim();
    if n != m {
        return Err(SpinError::numerical(
            Stage::CovarianceFactorization,
            format!("covariance is {n}x{m}, expected square"),
        ));
    }
    if a.iter().any(|v| !v.is_finite()) {
        return Err(SpinError::numerical(
            Stage::CovarianceFactorization,
            "averaged covariance contains non-finite entries",
        ));
    }

    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for p in 0..j {
                sum += l[[i, p]] * l[[j, p]];
            }
            if i == j {
                let pivot = a[[i, i]] - sum;
                // Negated comparison so NaN pivots are rejected too.
                if !(pivot > PIVOT_REL_TOL * a[[i, i]].abs()) {
                    return Err(SpinError::numerical(
                        Stage::CovarianceFactorization,
                        format!(
                            "matrix is not positive definite: pivot {i} is {pivot:e} (diagonal {:e})",
                            a[[i, i]]
                        ),
                    ));
                }
                l[[i, i]] = pivot.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }
    Ok(l)
}

/// Inverse of a lower-triangular matrix with non-zero diagonal, column by
/// column via forward substitution on L·x = e_j.
pub fn invert_lower(l: &Array2<f64>) -> Array2<f64> {
    let n = l.nrows();
    let mut inv = Array2::<f64>::zeros((n, n));
    for j in 0..n {
        let mut col = Array1::<f64>::zeros(n);
        for i in j..n {
            let mut rhs = if i == j { 1.0 } else { 0.0 };
            for p in j..i {
                rhs -= l[[i, p]] * col[p];
            }
            col[i] = rhs / l[[i, i]];
        }
        inv.column_mut(j).assign(&col);
    }
    inv
}
