//! Boundary-condition masks.
//!
//! Network outputs are multiplied by a scalar field that vanishes on the
//! domain boundary, which imposes Dirichlet conditions exactly.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use super::jvp::ScalarField;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoundaryMask {
    /// No boundary condition.
    None,

    /// `scale · Π_i max((x_i − lo)(hi − x_i), 0)` on the box [lo, hi]^d.
    Box { lo: f64, hi: f64, scale: f64 },

    /// `Π_i (√(2D² − x_i²) − D)`, vanishing on the box [−D, D]^d.
    SoftBox { half_width: f64 },
}

impl BoundaryMask {
    /// Evaluate the mask and its first/pure second derivatives at `x` (N×d).
    pub fn field(&self, x: &ArrayView2<f64>) -> ScalarField {
        let (n, d) = x.dim();
        let mut out = ScalarField::ones(n, d);
        let scale = match self {
            BoundaryMask::None => return out,
            BoundaryMask::Box { scale, .. } => *scale,
            BoundaryMask::SoftBox { .. } => 1.0,
        };

        for r in 0..n {
            // Per-axis factors g_i with derivatives; the field is Π_i g_i.
            let factors: Vec<(f64, f64, f64)> = (0..d).map(|i| self.factor(x[[r, i]])).collect();
            let full: f64 = factors.iter().map(|f| f.0).product();
            out.value[r] = scale * full;
            for i in 0..d {
                let others: f64 = factors
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, f)| f.0)
                    .product();
                out.d1[i][r] = scale * factors[i].1 * others;
                out.d2[i][r] = scale * factors[i].2 * others;
            }
        }
        out
    }

    /// One axis factor (g, g', g'').
    fn factor(&self, x: f64) -> (f64, f64, f64) {
        match *self {
            BoundaryMask::None => (1.0, 0.0, 0.0),
            BoundaryMask::Box { lo, hi, .. } => {
                let g = (x - lo) * (hi - x);
                if g > 0.0 {
                    (g, hi + lo - 2.0 * x, -2.0)
                } else {
                    (0.0, 0.0, 0.0)
                }
            }
            BoundaryMask::SoftBox { half_width } => {
                let two_d2 = 2.0 * half_width * half_width;
                let s2 = two_d2 - x * x;
                if s2 <= 0.0 {
                    return (f64::NAN, f64::NAN, f64::NAN);
                }
                let s = s2.sqrt();
                (s - half_width, -x / s, -two_d2 / (s2 * s))
            }
        }
    }
}
