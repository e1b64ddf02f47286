use super::group_norm::{GroupNorm, GroupNormCache};
use super::linear::Linear;
use crate::config::{NormLocation, NormLocations};
use crate::field::Field;
use crate::traits::Parameterized;
use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Residual two-layer perceptron, `res + W₂ relu(W₁ x)`, with optional
/// group norms at the `fork_1`, `fork_2` and `fork_3` hook points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedForward {
    pub linear_1: Linear,
    pub linear_2: Linear,
    pub gnorm_1: Option<GroupNorm>,
    pub gnorm_2: Option<GroupNorm>,
    pub gnorm_3: Option<GroupNorm>,
}

#[derive(Debug, Clone)]
pub struct FeedForwardCache {
    input: Field,
    pre_activation: Field,
    activation: Field,
    norm_1: Option<GroupNormCache>,
    norm_2: Option<GroupNormCache>,
    norm_3: Option<GroupNormCache>,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(
        dim: usize,
        factor: usize,
        group_size: usize,
        norm_locs: &NormLocations,
        rng: &mut R,
    ) -> Self {
        let hidden = dim * factor;
        let norm = |loc: NormLocation, channels: usize| {
            norm_locs
                .contains(loc)
                .then(|| GroupNorm::new(channels / group_size, channels))
        };
        Self {
            linear_1: Linear::new(dim, hidden, rng),
            linear_2: Linear::new(hidden, dim, rng),
            gnorm_1: norm(NormLocation::Fork1, hidden),
            gnorm_2: norm(NormLocation::Fork2, dim),
            gnorm_3: norm(NormLocation::Fork3, dim),
        }
    }

    pub fn forward(&self, x: &Field, res: &Field) -> Result<(Field, FeedForwardCache)> {
        let mut h = self.linear_1.forward(x).context("feed-forward first layer")?;
        let norm_1 = match &self.gnorm_1 {
            Some(norm) => {
                let (normed, cache) = norm.forward(&h)?;
                h = normed;
                Some(cache)
            }
            None => None,
        };
        let activation = h.with_values(h.values().map(|v| v.max(0.0)));

        let mut out = self
            .linear_2
            .forward(&activation)
            .context("feed-forward second layer")?;
        let norm_2 = match &self.gnorm_2 {
            Some(norm) => {
                let (normed, cache) = norm.forward(&out)?;
                out = normed;
                Some(cache)
            }
            None => None,
        };

        out = out.add(res).context("feed-forward residual")?;
        let norm_3 = match &self.gnorm_3 {
            Some(norm) => {
                let (normed, cache) = norm.forward(&out)?;
                out = normed;
                Some(cache)
            }
            None => None,
        };

        Ok((
            out,
            FeedForwardCache {
                input: x.clone(),
                pre_activation: h,
                activation,
                norm_1,
                norm_2,
                norm_3,
            },
        ))
    }

    /// Returns `(∂L/∂x, ∂L/∂res)`.
    pub fn backward(
        &self,
        cache: &FeedForwardCache,
        grad_out: &Field,
        grads: Option<&mut FeedForward>,
    ) -> (Field, Field) {
        let (g_linear_1, g_linear_2, g_norm_1, g_norm_2, g_norm_3) = match grads {
            Some(g) => (
                Some(&mut g.linear_1),
                Some(&mut g.linear_2),
                g.gnorm_1.as_mut(),
                g.gnorm_2.as_mut(),
                g.gnorm_3.as_mut(),
            ),
            None => (None, None, None, None, None),
        };

        let mut grad = grad_out.clone();
        if let (Some(norm), Some(norm_cache)) = (&self.gnorm_3, &cache.norm_3) {
            grad = norm.backward(norm_cache, &grad, g_norm_3);
        }
        let grad_res = grad.clone();

        if let (Some(norm), Some(norm_cache)) = (&self.gnorm_2, &cache.norm_2) {
            grad = norm.backward(norm_cache, &grad, g_norm_2);
        }
        let grad_activation = self.linear_2.backward(&cache.activation, &grad, g_linear_2);
        let mut grad = grad_activation.with_values(
            grad_activation
                .values()
                .zip_map(cache.pre_activation.values(), |g, pre| if pre > 0.0 { g } else { 0.0 }),
        );
        if let (Some(norm), Some(norm_cache)) = (&self.gnorm_1, &cache.norm_1) {
            grad = norm.backward(norm_cache, &grad, g_norm_1);
        }
        let grad_x = self.linear_1.backward(&cache.input, &grad, g_linear_1);
        (grad_x, grad_res)
    }
}

impl Parameterized for FeedForward {
    fn zeros_like(&self) -> Self {
        Self {
            linear_1: self.linear_1.zeros_like(),
            linear_2: self.linear_2.zeros_like(),
            gnorm_1: self.gnorm_1.as_ref().map(GroupNorm::zeros_like),
            gnorm_2: self.gnorm_2.as_ref().map(GroupNorm::zeros_like),
            gnorm_3: self.gnorm_3.as_ref().map(GroupNorm::zeros_like),
        }
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&str, &[f64])) {
        self.linear_1.visit_parameters(visitor);
        self.linear_2.visit_parameters(visitor);
        for norm in [&self.gnorm_1, &self.gnorm_2, &self.gnorm_3].into_iter().flatten() {
            norm.visit_parameters(visitor);
        }
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&str, &mut [f64])) {
        self.linear_1.visit_parameters_mut(visitor);
        self.linear_2.visit_parameters_mut(visitor);
        for norm in [&mut self.gnorm_1, &mut self.gnorm_2, &mut self.gnorm_3]
            .into_iter()
            .flatten()
        {
            norm.visit_parameters_mut(visitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::GridShape;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sample_field(shape: GridShape, channels: usize, phase: f64) -> Field {
        Field::from_fn(shape, channels, |b, i, j, c| {
            ((b * 13 + i * 7 + j * 3 + c) as f64 * 0.53 + phase).sin()
        })
    }

    #[test]
    fn output_is_residual_plus_update_without_norms() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut ff = FeedForward::new(2, 2, 16, &NormLocations::default(), &mut rng);
        ff.linear_2.weight.fill(0.0);
        ff.linear_2.bias.fill(0.25);
        let shape = GridShape::new(1, 2, 2);
        let x = sample_field(shape, 2, 0.0);
        let res = sample_field(shape, 2, 1.0);
        let (out, _) = ff.forward(&x, &res).expect("forward");
        for (o, r) in out.values().iter().zip(res.values().iter()) {
            assert!((o - (r + 0.25)).abs() < 1e-12);
        }
    }

    #[test]
    fn backward_with_every_norm_matches_finite_differences() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let locs = NormLocations::from_iter([
            NormLocation::Fork1,
            NormLocation::Fork2,
            NormLocation::Fork3,
        ]);
        let ff = FeedForward::new(4, 2, 2, &locs, &mut rng);
        assert!(ff.gnorm_1.is_some() && ff.gnorm_2.is_some() && ff.gnorm_3.is_some());

        let shape = GridShape::new(2, 2, 2);
        let x = sample_field(shape, 4, 0.3);
        let res = sample_field(shape, 4, 2.1);
        let probe = sample_field(shape, 4, -0.7);
        let loss = |ff: &FeedForward, x: &Field, res: &Field| -> f64 {
            let (y, _) = ff.forward(x, res).expect("forward");
            y.values().component_mul(probe.values()).sum()
        };

        let (_, cache) = ff.forward(&x, &res).expect("forward");
        let mut grads = ff.zeros_like();
        let (grad_x, grad_res) = ff.backward(&cache, &probe, Some(&mut grads));

        let eps = 1e-6;
        for idx in [0usize, 9, 22, 31] {
            let mut plus = x.clone();
            plus.values_mut().as_mut_slice()[idx] += eps;
            let mut minus = x.clone();
            minus.values_mut().as_mut_slice()[idx] -= eps;
            let numeric = (loss(&ff, &plus, &res) - loss(&ff, &minus, &res)) / (2.0 * eps);
            assert!((numeric - grad_x.values().as_slice()[idx]).abs() < 1e-5);

            let mut plus = res.clone();
            plus.values_mut().as_mut_slice()[idx] += eps;
            let mut minus = res.clone();
            minus.values_mut().as_mut_slice()[idx] -= eps;
            let numeric = (loss(&ff, &x, &plus) - loss(&ff, &x, &minus)) / (2.0 * eps);
            assert!((numeric - grad_res.values().as_slice()[idx]).abs() < 1e-5);
        }

        for idx in [0usize, 7, 19] {
            let mut plus = ff.clone();
            plus.linear_1.weight.as_mut_slice()[idx] += eps;
            let mut minus = ff.clone();
            minus.linear_1.weight.as_mut_slice()[idx] -= eps;
            let numeric = (loss(&plus, &x, &res) - loss(&minus, &x, &res)) / (2.0 * eps);
            assert!((numeric - grads.linear_1.weight.as_slice()[idx]).abs() < 1e-5);
        }
    }
}
