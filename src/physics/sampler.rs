//! Uniform batch sampling on an axis-aligned box.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Uniform};

use crate::error::{Result, SpinError};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoxSampler {
    pub lo: f64,
    pub hi: f64,
    pub dim: usize,
}

impl BoxSampler {
    pub fn new(lo: f64, hi: f64, dim: usize) -> Result<Self> {
        if !(lo < hi) || !lo.is_finite() || !hi.is_finite() {
            return Err(SpinError::config(format!("sampling box needs finite lo < hi, got [{lo}, {hi}]")));
        }
        if dim == 0 {
            return Err(SpinError::config("sampling box needs at least one dimension"));
        }
        Ok(Self { lo, hi, dim })
    }

    /// `count` i.i.d. points, batch-first (count×dim).
    pub fn sample(&self, rng: &mut StdRng, count: usize) -> Array2<f64> {
        let dist = Uniform::new(self.lo, self.hi);
        Array2::from_shape_simple_fn((count, self.dim), || dist.sample(rng))
    }

    /// Cell midpoints of a regular grid with `per_axis` cells on every axis
    /// (per_axis^dim rows, last axis fastest).
    pub fn midpoints(&self, per_axis: usize) -> Array2<f64> {
        let h = self.width() / per_axis as f64;
        let rows = per_axis.pow(self.dim as u32);
        Array2::from_shape_fn((rows, self.dim), |(r, i)| {
            let stride = per_axis.pow((self.dim - 1 - i) as u32);
            let cell = (r / stride) % per_axis;
            self.lo + (cell as f64 + 0.5) * h
        })
    }

    pub fn width(&self) -> f64 {
        self.hi - self.lo
    }
}
