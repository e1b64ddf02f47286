use crate::field::Field;
use crate::traits::Parameterized;
use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Per-cell affine map over the channel axis: `y = x Wᵀ + b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    /// `out_features × in_features`
    pub weight: DMatrix<f64>,
    pub bias: DVector<f64>,
}

impl Linear {
    /// Weights and bias drawn from `U(-1/√in, 1/√in)`.
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features.max(1) as f64).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        Self {
            weight: DMatrix::from_fn(out_features, in_features, |_, _| dist.sample(rng)),
            bias: DVector::from_fn(out_features, |_, _| dist.sample(rng)),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: &Field) -> Result<Field> {
        if x.channels() != self.in_features() {
            bail!(
                "Linear layer expects {} input channels, got {}.",
                self.in_features(),
                x.channels()
            );
        }
        let mut out = x.values() * self.weight.transpose();
        for (mut column, bias) in out.column_iter_mut().zip(self.bias.iter()) {
            column.iter_mut().for_each(|v| *v += bias);
        }
        Ok(x.with_values(out))
    }

    /// Returns `∂L/∂x` and accumulates weight and bias gradients into `grads`.
    pub fn backward(&self, input: &Field, grad_out: &Field, grads: Option<&mut Linear>) -> Field {
        if let Some(grads) = grads {
            grads.weight += grad_out.values().transpose() * input.values();
            for (c, column) in grad_out.values().column_iter().enumerate() {
                grads.bias[c] += column.sum();
            }
        }
        input.with_values(grad_out.values() * &self.weight)
    }
}

impl Parameterized for Linear {
    fn zeros_like(&self) -> Self {
        Self {
            weight: DMatrix::zeros(self.weight.nrows(), self.weight.ncols()),
            bias: DVector::zeros(self.bias.len()),
        }
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&str, &[f64])) {
        visitor("weight", self.weight.as_slice());
        visitor("bias", self.bias.as_slice());
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&str, &mut [f64])) {
        visitor("weight", self.weight.as_mut_slice());
        visitor("bias", self.bias.as_mut_slice());
    }
}
