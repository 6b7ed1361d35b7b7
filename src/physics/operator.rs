//! Linear second-order differential operators.
//!
//! Every supported operator has the form
//! `H u = c0·u + Σ_i c1_i ∂_i u + Σ_i c2_i ∂_ii u`
//! with per-point coefficients, so it can be applied to a [`Jet`] directly
//! and its adjoint is a pointwise scaling of the cotangent.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::network::jvp::Jet;

/// Which end of the spectrum training converges to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    /// Maximise trace(Λ). The Laplacian's spectrum −n² is sought from the top.
    Maximize,
    /// Minimise trace(Λ): ground-state energies first.
    Minimize,
}

impl Objective {
    /// Factor applied to ∂tr(Λ)/∂θ to obtain a descent direction.
    pub fn descent_sign(&self) -> f64 {
        match self {
            Objective::Maximize => -1.0,
            Objective::Minimize => 1.0,
        }
    }
}

/// Per-point coefficients of an operator on a batch.
#[derive(Clone, Debug)]
pub struct Coefficients {
    /// Zeroth-order term (N).
    pub c0: Array1<f64>,

    /// First-order terms, one per axis. Empty means no drift.
    pub c1: Vec<Array1<f64>>,

    /// Pure second-order terms, one per axis.
    pub c2: Vec<Array1<f64>>,
}

impl Coefficients {
    /// Apply to the output jet of the network: H u (N×k).
    pub fn apply(&self, u: &Jet) -> Array2<f64> {
        let mut out = &u.value * &column(&self.c0);
        for (c, d) in self.c1.iter().zip(u.d1.iter()) {
            out += &(d * &column(c));
        }
        for (c, d) in self.c2.iter().zip(u.d2.iter()) {
            out += &(d * &column(c));
        }
        out
    }

    /// Adjoint of [`apply`](Self::apply): pull `h̄ = ∂L/∂(Hu)` back to a jet cotangent.
    pub fn backward(&self, hbar: &Array2<f64>, dims: usize) -> Jet {
        let (n, k) = hbar.dim();
        let scaled = |c: Option<&Array1<f64>>| match c {
            Some(c) => hbar * &column(c),
            None => Array2::zeros((n, k)),
        };
        Jet {
            value: scaled(Some(&self.c0)),
            d1: (0..dims).map(|i| scaled(self.c1.get(i))).collect(),
            d2: (0..dims).map(|i| scaled(self.c2.get(i))).collect(),
        }
    }
}

/// N-vector as an N×1 column for broadcasting against N×k.
fn column(a: &Array1<f64>) -> ArrayView2<'_, f64> {
    a.view().insert_axis(Axis(1))
}

/// A linear operator whose eigenfunctions are sought.
pub trait Operator: Send + Sync {
    fn name(&self) -> &'static str;

    fn objective(&self) -> Objective;

    /// Coefficients at the batch points `x` (N×d).
    fn coefficients(&self, x: &ArrayView2<f64>) -> Coefficients;

    fn apply(&self, x: &ArrayView2<f64>, u: &Jet) -> Array2<f64> {
        self.coefficients(x).apply(u)
    }
}

/// Δu = Σ_i ∂_ii u.
#[derive(Clone, Copy, Debug, Default)]
pub struct Laplacian;

impl Operator for Laplacian {
    fn name(&self) -> &'static str {
        "laplacian"
    }

    fn objective(&self) -> Objective {
        Objective::Maximize
    }

    fn coefficients(&self, x: &ArrayView2<f64>) -> Coefficients {
        let (n, d) = x.dim();
        Coefficients {
            c0: Array1::zeros(n),
            c1: Vec::new(),
            c2: (0..d).map(|_| Array1::ones(n)).collect(),
        }
    }
}

/// Hydrogen-like Hamiltonian `−½Δ − Z / √(|x|² + ε)` in atomic units.
#[derive(Clone, Copy, Debug)]
pub struct Hydrogen {
    pub charge: f64,
    /// Softening ε of the Coulomb singularity.
    pub softening: f64,
}

impl Operator for Hydrogen {
    fn name(&self) -> &'static str {
        "hydrogen"
    }

    fn objective(&self) -> Objective {
        Objective::Minimize
    }

    fn coefficients(&self, x: &ArrayView2<f64>) -> Coefficients {
        let (n, d) = x.dim();
        let c0 = x.map_axis(Axis(1), |row| {
            let r2 = row.dot(&row);
            -self.charge / (r2 + self.softening).sqrt()
        });
        Coefficients {
            c0,
            c1: Vec::new(),
            c2: (0..d).map(|_| Array1::from_elem(n, -0.5)).collect(),
        }
    }
}

/// Serialisable operator selection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperatorKind {
    Laplacian,
    Hydrogen { charge: f64, softening: f64 },
}

impl OperatorKind {
    pub fn build(&self) -> Box<dyn Operator> {
        match *self {
            OperatorKind::Laplacian => Box::new(Laplacian),
            OperatorKind::Hydrogen { charge, softening } => Box::new(Hydrogen { charge, softening }),
        }
    }
}
