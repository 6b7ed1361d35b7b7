//! Forward-mode derivative propagation in the input coordinates.
//!
//! A [`Jet`] carries, for a batch of N points and a layer of width w:
//! - the values `f ∈ R^{N×w}`
//! - first derivatives `∂f/∂x_i` for each input coordinate i
//! - pure second derivatives `∂²f/∂x_i²` for each input coordinate i
//!
//! This is exactly what second-order operators with a diagonal principal
//! part need (Laplacian, Schrödinger Hamiltonians), at O(d) cost instead of a
//! full Hessian. The same struct doubles as the cotangent type of the reverse
//! pass, since cotangents live in the same space as the primal jet.

use ndarray::{Array1, Array2, ArrayView2, Zip};

use super::activation::Activation;

#[derive(Clone, Debug, PartialEq)]
pub struct Jet {
    pub value: Array2<f64>,
    pub d1: Vec<Array2<f64>>,
    pub d2: Vec<Array2<f64>>,
}

impl Jet {
    /// Jet of the identity map at `x` (N×d): ∂x/∂x_i = e_i, second derivatives zero.
    pub fn seed(x: &ArrayView2<f64>) -> Self {
        let (n, d) = x.dim();
        let d1 = (0..d)
            .map(|i| Array2::from_shape_fn((n, d), |(_, j)| if i == j { 1.0 } else { 0.0 }))
            .collect();
        let d2 = (0..d).map(|_| Array2::zeros((n, d))).collect();
        Self {
            value: x.to_owned(),
            d1,
            d2,
        }
    }

    pub fn zeros(n: usize, width: usize, dims: usize) -> Self {
        Self {
            value: Array2::zeros((n, width)),
            d1: (0..dims).map(|_| Array2::zeros((n, width))).collect(),
            d2: (0..dims).map(|_| Array2::zeros((n, width))).collect(),
        }
    }

    /// Batch size N.
    pub fn batch(&self) -> usize {
        self.value.nrows()
    }

    /// Layer width w.
    pub fn width(&self) -> usize {
        self.value.ncols()
    }

    /// Number of input coordinates d.
    pub fn dims(&self) -> usize {
        self.d1.len()
    }

    /// Σ_i ∂²f/∂x_i².
    pub fn laplacian(&self) -> Array2<f64> {
        let mut out = Array2::zeros(self.value.raw_dim());
        for d2 in &self.d2 {
            out += d2;
        }
        out
    }

    pub fn is_finite(&self) -> bool {
        self.value.iter().all(|v| v.is_finite())
            && self.d1.iter().all(|a| a.iter().all(|v| v.is_finite()))
            && self.d2.iter().all(|a| a.iter().all(|v| v.is_finite()))
    }

    /// Push through `z = a·W + b`. The bias only shifts the value channel.
    pub fn linear(&self, weight: &Array2<f64>, bias: Option<&Array1<f64>>) -> Jet {
        let mut value = self.value.dot(weight);
        if let Some(b) = bias {
            value += b;
        }
        Jet {
            value,
            d1: self.d1.iter().map(|a| a.dot(weight)).collect(),
            d2: self.d2.iter().map(|a| a.dot(weight)).collect(),
        }
    }

    /// Pull a cotangent back through `z = a·W + b`: returns (ā, W̄, b̄).
    pub fn linear_backward(
        &self,
        input: &Jet,
        weight: &Array2<f64>,
        with_input: bool,
    ) -> (Option<Jet>, Array2<f64>, Array1<f64>) {
        let mut grad_w = input.value.t().dot(&self.value);
        for (a, c) in input.d1.iter().zip(self.d1.iter()) {
            grad_w += &a.t().dot(c);
        }
        for (a, c) in input.d2.iter().zip(self.d2.iter()) {
            grad_w += &a.t().dot(c);
        }
        let grad_b = self.value.sum_axis(ndarray::Axis(0));
        let grad_in = with_input.then(|| Jet {
            value: self.value.dot(&weight.t()),
            d1: self.d1.iter().map(|c| c.dot(&weight.t())).collect(),
            d2: self.d2.iter().map(|c| c.dot(&weight.t())).collect(),
        });
        (grad_in, grad_w, grad_b)
    }

    /// Push through a pointwise activation.
    ///
    /// h = σ(z), h'_i = σ'(z) z'_i, h''_i = σ''(z) z'_i² + σ'(z) z''_i
    pub fn activate(&self, act: Activation) -> Jet {
        let derivs = self.value.mapv(|z| act.derivatives(z));
        let value = derivs.mapv(|d| d.f);
        let d1 = self
            .d1
            .iter()
            .map(|z1| {
                let mut out = z1.clone();
                Zip::from(&mut out).and(&derivs).for_each(|o, d| *o *= d.d1);
                out
            })
            .collect();
        let d2 = self
            .d1
            .iter()
            .zip(self.d2.iter())
            .map(|(z1, z2)| {
                let mut out = Array2::zeros(z1.raw_dim());
                Zip::from(&mut out)
                    .and(z1)
                    .and(z2)
                    .and(&derivs)
                    .for_each(|o, &a, &b, d| *o = d.d2 * a * a + d.d1 * b);
                out
            })
            .collect();
        Jet { value, d1, d2 }
    }

    /// Pull a cotangent (self, on h = σ(z)) back to a cotangent on z.
    ///
    /// z̄''_i = h̄''_i σ'
    /// z̄'_i  = h̄'_i σ' + 2 h̄''_i σ'' z'_i
    /// z̄     = h̄ σ' + Σ_i [h̄'_i σ'' z'_i + h̄''_i (σ''' z'_i² + σ'' z''_i)]
    pub fn activate_backward(&self, pre: &Jet, act: Activation) -> Jet {
        let derivs = pre.value.mapv(|z| act.derivatives(z));
        let mut value = self.value.clone();
        Zip::from(&mut value).and(&derivs).for_each(|v, d| *v *= d.d1);

        let mut d1 = Vec::with_capacity(self.dims());
        let mut d2 = Vec::with_capacity(self.dims());
        for i in 0..self.dims() {
            let (h1, h2) = (&self.d1[i], &self.d2[i]);
            let (z1, z2) = (&pre.d1[i], &pre.d2[i]);

            let mut g2 = h2.clone();
            Zip::from(&mut g2).and(&derivs).for_each(|g, d| *g *= d.d1);

            let mut g1 = Array2::zeros(h1.raw_dim());
            Zip::from(&mut g1)
                .and(h1)
                .and(h2)
                .and(z1)
                .and(&derivs)
                .for_each(|g, &a, &b, &zp, d| *g = a * d.d1 + 2.0 * b * d.d2 * zp);

            Zip::from(&mut value)
                .and(h1)
                .and(h2)
                .and(z1)
                .and(z2)
                .and(&derivs)
                .for_each(|v, &a, &b, &zp, &zpp, d| {
                    *v += a * d.d2 * zp + b * (d.d3 * zp * zp + d.d2 * zpp);
                });

            d1.push(g1);
            d2.push(g2);
        }
        Jet { value, d1, d2 }
    }

    /// Multiply every column by a per-point scalar field `m` given as a jet
    /// with one column (product rule up to second order).
    ///
    /// (m f)'_i = m'_i f + m f'_i, (m f)''_i = m''_i f + 2 m'_i f'_i + m f''_i
    pub fn scale_by(&self, m: &ScalarField) -> Jet {
        let col = |a: &Array1<f64>| a.view().insert_axis(ndarray::Axis(1)).to_owned();
        let m0 = col(&m.value);
        let value = &self.value * &m0;
        let mut d1 = Vec::with_capacity(self.dims());
        let mut d2 = Vec::with_capacity(self.dims());
        for i in 0..self.dims() {
            let m1 = col(&m.d1[i]);
            let m2 = col(&m.d2[i]);
            d1.push(&self.value * &m1 + &self.d1[i] * &m0);
            d2.push(&self.value * &m2 + &(&self.d1[i] * &m1) * 2.0 + &self.d2[i] * &m0);
        }
        Jet { value, d1, d2 }
    }

    /// Pull a cotangent on `m·f` back to a cotangent on f (m is fixed data).
    ///
    /// f̄ = m ū + Σ_i (m'_i ū'_i + m''_i ū''_i), f̄'_i = m ū'_i + 2 m'_i ū''_i, f̄''_i = m ū''_i
    pub fn scale_by_backward(&self, m: &ScalarField) -> Jet {
        let col = |a: &Array1<f64>| a.view().insert_axis(ndarray::Axis(1)).to_owned();
        let m0 = col(&m.value);
        let mut value = &self.value * &m0;
        let mut d1 = Vec::with_capacity(self.dims());
        let mut d2 = Vec::with_capacity(self.dims());
        for i in 0..self.dims() {
            let m1 = col(&m.d1[i]);
            let m2 = col(&m.d2[i]);
            value += &(&self.d1[i] * &m1);
            value += &(&self.d2[i] * &m2);
            d1.push(&self.d1[i] * &m0 + &(&self.d2[i] * &m1) * 2.0);
            d2.push(&self.d2[i] * &m0);
        }
        Jet { value, d1, d2 }
    }
}

/// A scalar field evaluated on a batch with first and pure second derivatives.
#[derive(Clone, Debug, PartialEq)]
pub struct ScalarField {
    pub value: Array1<f64>,
    pub d1: Vec<Array1<f64>>,
    pub d2: Vec<Array1<f64>>,
}

impl ScalarField {
    /// The constant field 1.
    pub fn ones(n: usize, dims: usize) -> Self {
        Self {
            value: Array1::ones(n),
            d1: (0..dims).map(|_| Array1::zeros(n)).collect(),
            d2: (0..dims).map(|_| Array1::zeros(n)).collect(),
        }
    }
}
