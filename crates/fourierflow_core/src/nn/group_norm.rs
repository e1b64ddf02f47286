use crate::field::Field;
use crate::traits::Parameterized;
use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

const EPS: f64 = 1e-5;

/// Group normalisation over the channel axis with a learned affine map.
///
/// Statistics are taken per batch sample over every cell and every channel
/// of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupNorm {
    pub groups: usize,
    pub gamma: DVector<f64>,
    pub beta: DVector<f64>,
}

/// Values saved by [`GroupNorm::forward`] for the backward pass.
#[derive(Debug, Clone)]
pub struct GroupNormCache {
    normalized: DMatrix<f64>,
    /// `batch × groups`
    inv_std: DMatrix<f64>,
}

impl GroupNorm {
    pub fn new(groups: usize, channels: usize) -> Self {
        Self {
            groups,
            gamma: DVector::from_element(channels, 1.0),
            beta: DVector::zeros(channels),
        }
    }

    pub fn channels(&self) -> usize {
        self.gamma.len()
    }

    fn channels_per_group(&self) -> usize {
        self.channels() / self.groups
    }

    pub fn forward(&self, x: &Field) -> Result<(Field, GroupNormCache)> {
        if x.channels() != self.channels() {
            bail!(
                "GroupNorm expects {} channels, got {}.",
                self.channels(),
                x.channels()
            );
        }
        if self.groups == 0 || self.channels() % self.groups != 0 {
            bail!(
                "GroupNorm cannot split {} channels into {} groups.",
                self.channels(),
                self.groups
            );
        }

        let shape = x.shape();
        let per_sample = shape.cells_per_sample();
        let cpg = self.channels_per_group();
        let count = (per_sample * cpg) as f64;
        let values = x.values();

        let mut normalized = DMatrix::zeros(values.nrows(), values.ncols());
        let mut inv_std = DMatrix::zeros(shape.batch, self.groups);
        let mut out = DMatrix::zeros(values.nrows(), values.ncols());

        for b in 0..shape.batch {
            let rows = b * per_sample..(b + 1) * per_sample;
            for g in 0..self.groups {
                let cols = g * cpg..(g + 1) * cpg;
                let block = values.view((rows.start, cols.start), (per_sample, cpg));
                let mean = block.sum() / count;
                let var = block.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
                let scale = 1.0 / (var + EPS).sqrt();
                inv_std[(b, g)] = scale;
                for c in cols.clone() {
                    for r in rows.clone() {
                        let xhat = (values[(r, c)] - mean) * scale;
                        normalized[(r, c)] = xhat;
                        out[(r, c)] = self.gamma[c] * xhat + self.beta[c];
                    }
                }
            }
        }

        Ok((
            x.with_values(out),
            GroupNormCache {
                normalized,
                inv_std,
            },
        ))
    }

    pub fn backward(
        &self,
        cache: &GroupNormCache,
        grad_out: &Field,
        grads: Option<&mut GroupNorm>,
    ) -> Field {
        let shape = grad_out.shape();
        let per_sample = shape.cells_per_sample();
        let cpg = self.channels_per_group();
        let count = (per_sample * cpg) as f64;
        let dy = grad_out.values();
        let xhat = &cache.normalized;

        if let Some(grads) = grads {
            for c in 0..self.channels() {
                grads.gamma[c] += dy.column(c).dot(&xhat.column(c));
                grads.beta[c] += dy.column(c).sum();
            }
        }

        let mut dx = DMatrix::zeros(dy.nrows(), dy.ncols());
        for b in 0..shape.batch {
            let rows = b * per_sample..(b + 1) * per_sample;
            for g in 0..self.groups {
                let cols = g * cpg..(g + 1) * cpg;
                let mut sum_dxhat = 0.0;
                let mut sum_dxhat_xhat = 0.0;
                for c in cols.clone() {
                    for r in rows.clone() {
                        let dxhat = dy[(r, c)] * self.gamma[c];
                        sum_dxhat += dxhat;
                        sum_dxhat_xhat += dxhat * xhat[(r, c)];
                    }
                }
                let scale = cache.inv_std[(b, g)] / count;
                for c in cols.clone() {
                    for r in rows.clone() {
                        let dxhat = dy[(r, c)] * self.gamma[c];
                        dx[(r, c)] =
                            scale * (count * dxhat - sum_dxhat - xhat[(r, c)] * sum_dxhat_xhat);
                    }
                }
            }
        }
        grad_out.with_values(dx)
    }
}

impl Parameterized for GroupNorm {
    fn zeros_like(&self) -> Self {
        Self {
            groups: self.groups,
            gamma: DVector::zeros(self.gamma.len()),
            beta: DVector::zeros(self.beta.len()),
        }
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&str, &[f64])) {
        visitor("gamma", self.gamma.as_slice());
        visitor("beta", self.beta.as_slice());
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&str, &mut [f64])) {
        visitor("gamma", self.gamma.as_mut_slice());
        visitor("beta", self.beta.as_mut_slice());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::GridShape;

    #[test]
    fn forward_normalizes_each_group_per_sample() {
        let norm = GroupNorm::new(2, 4);
        let shape = GridShape::new(2, 3, 3);
        let x = Field::from_fn(shape, 4, |b, i, j, c| {
            (b as f64 + 1.0) * ((i * 3 + j) as f64) + 10.0 * c as f64
        });
        let (y, _) = norm.forward(&x).expect("forward");

        for b in 0..2 {
            for g in 0..2 {
                let mut sum = 0.0;
                let mut sq = 0.0;
                for c in 2 * g..2 * g + 2 {
                    for i in 0..3 {
                        for j in 0..3 {
                            let v = y.get(b, i, j, c);
                            sum += v;
                            sq += v * v;
                        }
                    }
                }
                assert!((sum / 18.0).abs() < 1e-10);
                assert!((sq / 18.0 - 1.0).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn forward_rejects_indivisible_groups() {
        let norm = GroupNorm::new(3, 4);
        let x = Field::zeros(GridShape::new(1, 2, 2), 4);
        let err = norm.forward(&x).expect_err("4 channels in 3 groups should fail");
        assert!(format!("{err}").contains("cannot split"));
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut norm = GroupNorm::new(2, 4);
        norm.gamma = DVector::from_vec(vec![1.5, -0.5, 0.8, 2.0]);
        norm.beta = DVector::from_vec(vec![0.1, 0.2, -0.3, 0.0]);
        let shape = GridShape::new(2, 2, 3);
        let x = Field::from_fn(shape, 4, |b, i, j, c| {
            ((b * 7 + i * 5 + j * 3 + c) as f64 * 0.37).sin()
        });
        let probe = Field::from_fn(shape, 4, |b, i, j, c| ((b + i * j + c) as f64 * 0.91).cos());
        let loss = |input: &Field| -> f64 {
            let (y, _) = norm.forward(input).expect("forward");
            y.values().component_mul(probe.values()).sum()
        };

        let (_, cache) = norm.forward(&x).expect("forward");
        let mut grads = norm.zeros_like();
        let dx = norm.backward(&cache, &probe, Some(&mut grads));

        let eps = 1e-6;
        for idx in [0usize, 5, 11, 17, 30, 47] {
            let mut plus = x.clone();
            plus.values_mut().as_mut_slice()[idx] += eps;
            let mut minus = x.clone();
            minus.values_mut().as_mut_slice()[idx] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            let analytic = dx.values().as_slice()[idx];
            assert!(
                (numeric - analytic).abs() < 1e-5,
                "index {idx}: numeric {numeric}, analytic {analytic}"
            );
        }

        let (y, _) = norm.forward(&x).expect("forward");
        for c in 0..4 {
            let xhat_dot: f64 = (0..y.values().nrows())
                .map(|r| probe.values()[(r, c)] * (y.values()[(r, c)] - norm.beta[c]) / norm.gamma[c])
                .sum();
            assert!((grads.gamma[c] - xhat_dot).abs() < 1e-9);
            assert!((grads.beta[c] - probe.values().column(c).sum()).abs() < 1e-12);
        }
    }
}
