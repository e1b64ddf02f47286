//! Helpers over [`Parameterized`] values: counting, norms, plain gradient
//! descent and finite-difference checks of hand-written backward passes.

use crate::traits::Parameterized;
use anyhow::{bail, Result};

pub fn parameter_count<P: Parameterized + ?Sized>(params: &P) -> usize {
    let mut count = 0;
    params.visit_parameters(&mut |_, values| count += values.len());
    count
}

/// Euclidean norm over every parameter of `grads`.
pub fn gradient_norm<P: Parameterized + ?Sized>(grads: &P) -> f64 {
    let mut sum = 0.0;
    grads.visit_parameters(&mut |_, values| sum += values.iter().map(|v| v * v).sum::<f64>());
    sum.sqrt()
}

pub fn all_finite<P: Parameterized + ?Sized>(params: &P) -> bool {
    let mut finite = true;
    params.visit_parameters(&mut |_, values| finite &= values.iter().all(|v| v.is_finite()));
    finite
}

/// `θ ← θ - learning_rate · g`. Both values must come from the same model.
pub fn sgd_step<P: Parameterized>(params: &mut P, grads: &P, learning_rate: f64) -> Result<()> {
    let mut flat: Vec<Vec<f64>> = Vec::new();
    grads.visit_parameters(&mut |_, values| flat.push(values.to_vec()));

    let mut tensors = flat.into_iter();
    let mut mismatch: Option<String> = None;
    params.visit_parameters_mut(&mut |name, values| {
        if mismatch.is_some() {
            return;
        }
        match tensors.next() {
            Some(grad) if grad.len() == values.len() => {
                for (v, g) in values.iter_mut().zip(&grad) {
                    *v -= learning_rate * g;
                }
            }
            Some(grad) => {
                mismatch = Some(format!(
                    "gradient for {name} has {} entries, parameter has {}",
                    grad.len(),
                    values.len()
                ))
            }
            None => mismatch = Some(format!("no gradient for {name}")),
        }
    });
    if let Some(message) = mismatch {
        bail!("Gradient layout does not match parameters: {message}.");
    }
    if tensors.next().is_some() {
        bail!("Gradient layout does not match parameters: more gradient tensors than parameters.");
    }
    Ok(())
}

/// Central difference `(L(θ + ε) - L(θ - ε)) / 2ε` for entry `index` of the
/// `tensor`-th parameter tensor, in visiting order.
pub fn central_difference<P, F>(
    params: &P,
    tensor: usize,
    index: usize,
    eps: f64,
    mut loss: F,
) -> Result<f64>
where
    P: Parameterized + Clone,
    F: FnMut(&P) -> Result<f64>,
{
    if !(eps > 0.0) {
        bail!("Finite-difference step must be positive, got {eps}.");
    }
    let mut plus = params.clone();
    if !perturb(&mut plus, tensor, index, eps) {
        bail!("Parameter tensor {tensor} has no entry {index}.");
    }
    let mut minus = params.clone();
    perturb(&mut minus, tensor, index, -eps);
    Ok((loss(&plus)? - loss(&minus)?) / (2.0 * eps))
}

fn perturb<P: Parameterized>(params: &mut P, tensor: usize, index: usize, delta: f64) -> bool {
    let mut seen = 0;
    let mut applied = false;
    params.visit_parameters_mut(&mut |_, values| {
        if seen == tensor {
            if let Some(v) = values.get_mut(index) {
                *v += delta;
                applied = true;
            }
        }
        seen += 1;
    });
    applied
}
