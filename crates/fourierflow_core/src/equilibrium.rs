//! Deep-equilibrium block.
//!
//! Early in training the block applies the spectral operator a fixed number
//! of times and differentiates through every application. From
//! `pretraining_steps` on it solves for the fixed point `z* = f(z*, x)` and
//! differentiates implicitly: the upstream gradient is refined by a second
//! fixed-point solve before it is pushed through one retained application.

use crate::config::ModelConfig;
use crate::field::{Field, LatentState};
use crate::solvers::{anderson, SolverSettings, SolverTrace};
use crate::spectral::SpectralPlan;
use crate::spectral_conv::{SpectralCache, SpectralConv2d};
use crate::traits::Parameterized;
use anyhow::{bail, Context, Result};
use nalgebra::DMatrix;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which computation the block performs at a given training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unrolled,
    Equilibrium,
}

impl Phase {
    pub fn at(global_step: u64, pretraining_steps: u64) -> Self {
        if global_step < pretraining_steps {
            Phase::Unrolled
        } else {
            Phase::Equilibrium
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Keep what the backward pass needs.
    Training,
    Inference,
}

/// Linear map used by the adjoint solve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjointMode {
    /// `y ↦ (Jᵀ·1) ⊙ y + g`, one vector-Jacobian product per forward call.
    #[default]
    DiagonalProbe,
    /// `y ↦ Jᵀ·y + g`, one vector-Jacobian product per adjoint iteration.
    Exact,
}

/// Everything [`DeqBlock::backward`] needs from one forward call. Consumed
/// by the backward pass.
#[derive(Debug)]
pub enum DeqTape {
    Unrolled {
        caches: Vec<SpectralCache>,
    },
    Equilibrium {
        /// The retained application `f(z*)`.
        cache: SpectralCache,
        /// `Jᵀ·1` at `z*`, present in [`AdjointMode::DiagonalProbe`].
        probe: Option<LatentState>,
        forward_trace: SolverTrace,
    },
    /// Inference call; not differentiable.
    Detached {
        forward_trace: Option<SolverTrace>,
    },
}

impl DeqTape {
    pub fn phase(&self) -> Option<Phase> {
        match self {
            DeqTape::Unrolled { .. } => Some(Phase::Unrolled),
            DeqTape::Equilibrium { .. } => Some(Phase::Equilibrium),
            DeqTape::Detached { .. } => None,
        }
    }

    pub fn forward_trace(&self) -> Option<&SolverTrace> {
        match self {
            DeqTape::Equilibrium { forward_trace, .. } => Some(forward_trace),
            DeqTape::Detached { forward_trace } => forward_trace.as_ref(),
            DeqTape::Unrolled { .. } => None,
        }
    }

    pub fn is_detached(&self) -> bool {
        matches!(self, DeqTape::Detached { .. })
    }
}

#[derive(Debug, Clone)]
pub struct DeqGradients {
    /// `∂L/∂x` for the injected input.
    pub x: Field,
    /// Adjoint solve history, in the equilibrium phase.
    pub backward_trace: Option<SolverTrace>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeqBlock {
    pub operator: SpectralConv2d,
    pub n_layers: usize,
    pub pretraining_steps: u64,
    pub forward_solver: SolverSettings,
    pub backward_solver: SolverSettings,
    pub adjoint: AdjointMode,
}

impl DeqBlock {
    pub fn from_config<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> Self {
        Self {
            operator: SpectralConv2d::new(
                config.width,
                config.width,
                config.n_modes,
                config.factor,
                config.group_size,
                &config.norm_locs,
                rng,
            ),
            n_layers: config.n_layers,
            pretraining_steps: config.pretraining_steps,
            forward_solver: config.forward_solver,
            backward_solver: config.backward_solver,
            adjoint: config.adjoint,
        }
    }

    pub fn phase(&self, global_step: u64) -> Phase {
        Phase::at(global_step, self.pretraining_steps)
    }

    pub fn forward(
        &self,
        z0: &LatentState,
        x: &Field,
        global_step: u64,
        mode: Mode,
    ) -> Result<(LatentState, DeqTape)> {
        if !z0.backcast.same_layout(&z0.forecast) || !x.same_layout(&z0.backcast) {
            bail!(
                "Input field {:?} x {} does not match latent state {:?} x {}.",
                x.shape(),
                x.channels(),
                z0.shape(),
                z0.channels()
            );
        }
        let plan = self.operator.plan_for(x.shape())?;

        let phase = self.phase(global_step);
        debug!(?phase, ?mode, global_step, "deq forward");
        match phase {
            Phase::Unrolled => self.unrolled(&plan, z0, x, mode),
            Phase::Equilibrium => self.equilibrium(&plan, z0, x, mode),
        }
    }

    fn unrolled(
        &self,
        plan: &SpectralPlan,
        z0: &LatentState,
        x: &Field,
        mode: Mode,
    ) -> Result<(LatentState, DeqTape)> {
        let mut z = z0.clone();
        let mut caches = Vec::with_capacity(self.n_layers);
        for layer in 0..self.n_layers {
            let (next, cache) = self
                .operator
                .forward_with(plan, &z, x)
                .with_context(|| format!("unrolled layer {layer}"))?;
            if mode == Mode::Training {
                caches.push(cache);
            }
            z = next;
        }
        let tape = match mode {
            Mode::Training => DeqTape::Unrolled { caches },
            Mode::Inference => DeqTape::Detached {
                forward_trace: None,
            },
        };
        Ok((z, tape))
    }

    fn equilibrium(
        &self,
        plan: &SpectralPlan,
        z0: &LatentState,
        x: &Field,
        mode: Mode,
    ) -> Result<(LatentState, DeqTape)> {
        let (shape, channels) = (z0.shape(), z0.channels());
        let mut failure: Option<anyhow::Error> = None;
        let solution = {
            let mut map = |columns: &DMatrix<f64>| -> DMatrix<f64> {
                if failure.is_some() {
                    return columns.clone();
                }
                let z = LatentState::unpack(shape, channels, columns);
                match self.operator.forward_with(plan, &z, x) {
                    Ok((next, _)) => next.to_columns(),
                    Err(err) => {
                        failure = Some(err);
                        columns.clone()
                    }
                }
            };
            anderson(&mut map, &z0.to_columns(), &self.forward_solver)
        };
        if let Some(err) = failure {
            return Err(err.context("equilibrium solve"));
        }
        let z_star = LatentState::unpack(shape, channels, &solution.result);
        let forward_trace = solution.trace;

        match mode {
            Mode::Inference => Ok((
                z_star,
                DeqTape::Detached {
                    forward_trace: Some(forward_trace),
                },
            )),
            Mode::Training => {
                let (next, cache) = self
                    .operator
                    .forward_with(plan, &z_star, x)
                    .context("retained application at the fixed point")?;
                let probe = match self.adjoint {
                    AdjointMode::DiagonalProbe => {
                        let ones = Field::from_fn(shape, channels, |_, _, _, _| 1.0);
                        let all_ones = LatentState {
                            backcast: ones.clone(),
                            forecast: ones,
                        };
                        Some(self.operator.state_vjp(&cache, &all_ones))
                    }
                    AdjointMode::Exact => None,
                };
                Ok((
                    next,
                    DeqTape::Equilibrium {
                        cache,
                        probe,
                        forward_trace,
                    },
                ))
            }
        }
    }

    /// Pushes `grad_out` back through the tape, accumulating operator
    /// gradients into `grads` when given.
    pub fn backward(
        &self,
        tape: DeqTape,
        grad_out: &LatentState,
        grads: Option<&mut DeqBlock>,
    ) -> Result<DeqGradients> {
        let mut operator_grads = grads.map(|g| &mut g.operator);
        match tape {
            DeqTape::Detached { .. } => {
                bail!("The DEQ block ran in inference mode and kept nothing to differentiate.")
            }
            DeqTape::Unrolled { caches } => {
                let mut grad_z = grad_out.clone();
                let mut grad_x = Field::zeros(grad_out.shape(), self.operator.in_dim);
                for cache in caches.iter().rev() {
                    check_gradient(cache, &grad_z)?;
                    let (previous, step_x) =
                        self.operator
                            .backward(cache, &grad_z, operator_grads.as_deref_mut());
                    grad_x = grad_x.add(&step_x)?;
                    grad_z = previous;
                }
                Ok(DeqGradients {
                    x: grad_x,
                    backward_trace: None,
                })
            }
            DeqTape::Equilibrium { cache, probe, .. } => {
                check_gradient(&cache, grad_out)?;
                let (shape, channels) = (grad_out.shape(), grad_out.channels());
                let g = grad_out.to_columns();
                let y0 = DMatrix::zeros(g.nrows(), g.ncols());

                let solution = match probe {
                    Some(probe) => {
                        let diagonal = probe.to_columns();
                        let mut map = |y: &DMatrix<f64>| -> DMatrix<f64> { y.component_mul(&diagonal) + &g };
                        anderson(&mut map, &y0, &self.backward_solver)
                    }
                    None => {
                        let mut map = |y: &DMatrix<f64>| -> DMatrix<f64> {
                            let v = LatentState::unpack(shape, channels, y);
                            self.operator.state_vjp(&cache, &v).to_columns() + &g
                        };
                        anderson(&mut map, &y0, &self.backward_solver)
                    }
                };

                let refined = LatentState::unpack(shape, channels, &solution.result);
                let (_, grad_x) = self.operator.backward(&cache, &refined, operator_grads);
                debug!(
                    evaluations = solution.trace.evaluations,
                    lowest = solution.trace.lowest,
                    "deq adjoint solved"
                );
                Ok(DeqGradients {
                    x: grad_x,
                    backward_trace: Some(solution.trace),
                })
            }
        }
    }

    /// Hutchinson estimate of `‖∂f/∂z‖²_F / dim` at the last recorded
    /// application. `None` for inference tapes.
    pub fn jacobian_penalty<R: Rng + ?Sized>(
        &self,
        tape: &DeqTape,
        probes: usize,
        rng: &mut R,
    ) -> Option<f64> {
        let cache = match tape {
            DeqTape::Unrolled { caches } => caches.last()?,
            DeqTape::Equilibrium { cache, .. } => cache,
            DeqTape::Detached { .. } => return None,
        };
        Some(self.operator.jacobian_frobenius_estimate(cache, probes, rng))
    }
}

fn check_gradient(cache: &SpectralCache, grad: &LatentState) -> Result<()> {
    if grad.shape() != cache.shape() || !grad.backcast.same_layout(&grad.forecast) {
        bail!(
            "Gradient {:?} does not match the recorded state {:?}.",
            grad.shape(),
            cache.shape()
        );
    }
    Ok(())
}

impl Parameterized for DeqBlock {
    fn zeros_like(&self) -> Self {
        Self {
            operator: self.operator.zeros_like(),
            ..self.clone()
        }
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&str, &[f64])) {
        self.operator.visit_parameters(visitor);
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&str, &mut [f64])) {
        self.operator.visit_parameters_mut(visitor);
    }
}
