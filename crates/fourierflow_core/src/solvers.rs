//! Anderson-accelerated fixed-point iteration.
//!
//! States are packed one batch sample per column. Mixing coefficients are
//! solved independently for every column, while the stopping residual is
//! measured over the whole batch.

use crate::traits::FixedPointMap;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Offset in the relative residual denominator.
const RELATIVE_EPS: f64 = 1e-5;

/// Which residual decides convergence and the returned iterate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// `‖f(z) - z‖`
    Absolute,
    /// `‖f(z) - z‖ / (1e-5 + ‖f(z)‖)`
    #[default]
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Maximum number of map evaluations.
    pub threshold: usize,
    pub tolerance: f64,
    /// Number of past iterates combined in each step.
    pub history: usize,
    /// Ridge term added to the Gram matrix of residuals.
    pub regularization: f64,
    /// Weight of `f(z)` against `z` in the mixed update; 1 is undamped.
    pub mixing: f64,
    pub stop_mode: StopMode,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            threshold: 30,
            tolerance: 1e-3,
            history: 5,
            regularization: 1e-4,
            mixing: 1.0,
            stop_mode: StopMode::Relative,
        }
    }
}

impl SolverSettings {
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }
}

/// Residual history of one solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverTrace {
    pub abs_trace: Vec<f64>,
    pub rel_trace: Vec<f64>,
    /// Lowest residual seen, in the configured stop mode.
    pub lowest: f64,
    /// Iteration index of the returned iterate; 0 is the initial guess.
    pub lowest_step: usize,
    pub evaluations: usize,
    pub converged: bool,
}

impl Default for SolverTrace {
    fn default() -> Self {
        Self {
            abs_trace: Vec::new(),
            rel_trace: Vec::new(),
            lowest: f64::INFINITY,
            lowest_step: 0,
            evaluations: 0,
            converged: false,
        }
    }
}

impl SolverTrace {
    /// Lowest absolute residual seen, if any evaluation happened.
    pub fn lowest_abs(&self) -> Option<f64> {
        self.abs_trace.iter().copied().reduce(f64::min)
    }
}

#[derive(Debug, Clone)]
pub struct FixedPointSolution {
    pub result: DMatrix<f64>,
    pub trace: SolverTrace,
}

/// Runs the solver with default settings and an explicit evaluation budget.
pub fn solve<M>(map: &mut M, z0: &DMatrix<f64>, threshold: usize) -> FixedPointSolution
where
    M: FixedPointMap + ?Sized,
{
    anderson(map, z0, &SolverSettings::with_threshold(threshold))
}

/// Anderson acceleration of `z ↦ f(z)` from `z0`.
///
/// Iterate 0 is `z0`, iterate 1 is `f(z0)`; later iterates combine the last
/// `history` evaluations with weights from a regularised, sum-to-one least
/// squares problem on their residuals. The iterate with the lowest residual
/// is returned, so a budget of zero returns `z0` untouched. The solver never
/// fails: a singular least squares system falls back to a plain step.
pub fn anderson<M>(map: &mut M, z0: &DMatrix<f64>, settings: &SolverSettings) -> FixedPointSolution
where
    M: FixedPointMap + ?Sized,
{
    let mut trace = SolverTrace::default();
    let mut best = z0.clone();
    if settings.threshold == 0 {
        return FixedPointSolution { result: best, trace };
    }

    let m = settings.history.max(1);
    let (rows, cols) = z0.shape();
    let mut xs: Vec<DMatrix<f64>> = Vec::with_capacity(m);
    let mut fs: Vec<DMatrix<f64>> = Vec::with_capacity(m);

    let mut x = z0.clone();
    for k in 0..settings.threshold {
        if k >= 2 {
            let n = k.min(m);
            let latest = (k - 1) % m;
            x = mix(&xs[..n], &fs[..n], latest, settings, rows, cols);
        } else if k == 1 {
            x = fs[0].clone();
        }

        let f = map.apply(&x);
        trace.evaluations += 1;
        let abs = (&f - &x).norm();
        let rel = abs / (RELATIVE_EPS + f.norm());
        trace.abs_trace.push(abs);
        trace.rel_trace.push(rel);
        trace!(step = k, abs, rel, "anderson iteration");

        let residual = match settings.stop_mode {
            StopMode::Absolute => abs,
            StopMode::Relative => rel,
        };
        if residual < trace.lowest {
            trace.lowest = residual;
            trace.lowest_step = k;
            best.copy_from(&x);
        }

        let slot = k % m;
        if slot < xs.len() {
            xs[slot] = x.clone();
            fs[slot] = f;
        } else {
            xs.push(x.clone());
            fs.push(f);
        }

        if residual < settings.tolerance {
            trace.converged = true;
            break;
        }
    }

    if trace.converged {
        debug!(
            evaluations = trace.evaluations,
            lowest = trace.lowest,
            lowest_step = trace.lowest_step,
            "anderson solve converged"
        );
    } else {
        warn!(
            evaluations = trace.evaluations,
            lowest = trace.lowest,
            tolerance = settings.tolerance,
            "anderson solve stopped above tolerance"
        );
    }
    FixedPointSolution { result: best, trace }
}

/// Next iterate from the stored history, one mixing problem per column.
fn mix(
    xs: &[DMatrix<f64>],
    fs: &[DMatrix<f64>],
    latest: usize,
    settings: &SolverSettings,
    rows: usize,
    cols: usize,
) -> DMatrix<f64> {
    let n = xs.len();
    let gs: Vec<DMatrix<f64>> = xs.iter().zip(fs).map(|(x, f)| f - x).collect();
    let beta = settings.mixing;
    let mut next = DMatrix::zeros(rows, cols);

    for b in 0..cols {
        let alpha = column_weights(&gs, b, settings.regularization).unwrap_or_else(|| {
            warn!(column = b, "singular anderson system, taking a plain step");
            let mut alpha = DVector::zeros(n);
            alpha[latest] = 1.0;
            alpha
        });

        let mut column = next.column_mut(b);
        for j in 0..n {
            column.axpy(beta * alpha[j], &fs[j].column(b), 1.0);
            if beta < 1.0 {
                column.axpy((1.0 - beta) * alpha[j], &xs[j].column(b), 1.0);
            }
        }
    }
    next
}

/// Solves the bordered system
/// `[0 1ᵀ; 1 GᵀG + λI] [ν; α] = [1; 0]` for the weights `α` of one column.
fn column_weights(gs: &[DMatrix<f64>], b: usize, regularization: f64) -> Option<DVector<f64>> {
    let n = gs.len();
    let mut h = DMatrix::zeros(n + 1, n + 1);
    for i in 0..n {
        h[(0, i + 1)] = 1.0;
        h[(i + 1, 0)] = 1.0;
        for j in i..n {
            let mut dot = gs[i].column(b).dot(&gs[j].column(b));
            if i == j {
                dot += regularization;
            }
            h[(i + 1, j + 1)] = dot;
            h[(j + 1, i + 1)] = dot;
        }
    }
    let mut rhs = DVector::zeros(n + 1);
    rhs[0] = 1.0;

    let solution = h.lu().solve(&rhs)?;
    let alpha = solution.rows(1, n).into_owned();
    alpha.iter().all(|v| v.is_finite()).then_some(alpha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// `z ↦ A z + c` with `‖A‖₂ < 0.8` and its exact fixed point.
    fn contraction(dim: usize, batch: usize, seed: u64) -> (DMatrix<f64>, DMatrix<f64>, DMatrix<f64>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let raw: DMatrix<f64> = DMatrix::from_fn(dim, dim, |_, _| rng.gen_range(-1.0..1.0));
        let a = &raw * (0.8 / raw.norm());
        let c: DMatrix<f64> = DMatrix::from_fn(dim, batch, |_, _| rng.gen_range(-1.0..1.0));
        let identity = DMatrix::<f64>::identity(dim, dim);
        let exact = (identity - &a)
            .lu()
            .solve(&c)
            .expect("I - A should be invertible");
        (a, c, exact)
    }

    fn tight() -> SolverSettings {
        SolverSettings {
            threshold: 60,
            tolerance: 1e-6,
            regularization: 1e-14,
            stop_mode: StopMode::Absolute,
            ..SolverSettings::default()
        }
    }

    #[test]
    fn converges_to_the_fixed_point_of_a_linear_contraction() {
        let (a, c, exact) = contraction(6, 3, 7);
        let mut map = |z: &DMatrix<f64>| &a * z + &c;
        let z0 = DMatrix::zeros(6, 3);

        let solution = anderson(&mut map, &z0, &tight());
        assert!(solution.trace.converged);
        assert!(solution.trace.evaluations < 60);
        assert!((&solution.result - &exact).norm() < 1e-5);

        let short = anderson(&mut map, &z0, &SolverSettings { threshold: 3, ..tight() });
        assert!((&short.result - &exact).norm() >= (&solution.result - &exact).norm());
    }

    #[test]
    fn damped_mixing_still_reaches_the_fixed_point() {
        let (a, c, exact) = contraction(5, 2, 3);
        let mut map = |z: &DMatrix<f64>| &a * z + &c;
        let settings = SolverSettings {
            mixing: 0.5,
            threshold: 120,
            ..tight()
        };
        let solution = anderson(&mut map, &DMatrix::zeros(5, 2), &settings);
        assert!((&solution.result - &exact).norm() < 1e-5);
    }

    #[test]
    fn zero_budget_returns_the_initial_guess_without_evaluating() {
        let mut calls = 0usize;
        let mut map = |z: &DMatrix<f64>| {
            calls += 1;
            z * 0.5
        };
        let z0 = DMatrix::from_element(4, 2, 3.0);
        let solution = solve(&mut map, &z0, 0);
        assert_eq!(solution.result, z0);
        assert!(solution.trace.abs_trace.is_empty());
        assert_eq!(solution.trace.evaluations, 0);
        assert_eq!(calls, 0);
    }

    #[test]
    fn starting_at_a_fixed_point_returns_it() {
        let c = DMatrix::from_fn(3, 2, |i, j| (i + 2 * j) as f64 - 1.5);
        let fixed = &c * 2.0;
        let mut map = |z: &DMatrix<f64>| z * 0.5 + &c;
        let solution = solve(&mut map, &fixed, 10);
        assert!((&solution.result - &fixed).norm() < 1e-12);
        assert_eq!(solution.trace.lowest_step, 0);
        assert!(solution.trace.converged);
    }

    #[test]
    fn returns_the_lowest_residual_iterate() {
        // Residual depends only on the call index: 1, 0.1, 5, 7.
        let offsets = [1.0, 0.1, 5.0, 7.0];
        let mut calls = 0usize;
        let mut map = |z: &DMatrix<f64>| {
            let offset = offsets[calls.min(offsets.len() - 1)];
            calls += 1;
            z.add_scalar(offset)
        };
        let z0 = DMatrix::zeros(2, 2);
        let settings = SolverSettings {
            threshold: 4,
            tolerance: 1e-9,
            stop_mode: StopMode::Absolute,
            ..SolverSettings::default()
        };
        let solution = anderson(&mut map, &z0, &settings);

        assert_eq!(solution.trace.evaluations, 4);
        assert!(!solution.trace.converged);
        assert_eq!(solution.trace.lowest_step, 1);
        assert!((solution.trace.lowest - 0.2).abs() < 1e-12);
        assert_eq!(solution.result, DMatrix::from_element(2, 2, 1.0));
        assert_eq!(solution.trace.lowest_abs(), Some(solution.trace.lowest));
    }

    #[test]
    fn relative_residual_is_scaled_by_the_image_norm() {
        let mut map = |z: &DMatrix<f64>| z.add_scalar(1.0);
        let z0 = DMatrix::from_element(1, 1, 3.0);
        let solution = solve(&mut map, &z0, 1);
        let rel = solution.trace.rel_trace[0];
        assert!((rel - 1.0 / (1e-5 + 4.0)).abs() < 1e-12);
        assert_eq!(solution.trace.abs_trace, vec![1.0]);
    }

    #[test]
    fn repeated_solves_are_bitwise_identical() {
        let (a, c, _) = contraction(8, 4, 11);
        let mut map = |z: &DMatrix<f64>| (&a * z + &c).map(f64::tanh);
        let z0 = DMatrix::zeros(8, 4);
        let first = solve(&mut map, &z0, 12);
        let second = solve(&mut map, &z0, 12);
        assert_eq!(first.result, second.result);
        assert_eq!(first.trace, second.trace);
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: SolverSettings =
            serde_json::from_str(r#"{"threshold": 12, "stop_mode": "absolute"}"#)
                .expect("settings should parse");
        assert_eq!(settings.threshold, 12);
        assert_eq!(settings.stop_mode, StopMode::Absolute);
        assert_eq!(settings.history, 5);
        assert_eq!(settings.tolerance, 1e-3);
    }
}
