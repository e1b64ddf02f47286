//! The full network: input projection, DEQ block over a two-half latent
//! state, and a per-cell head on the forecast half.

use crate::config::{ConfigError, ModelConfig, NormLocation};
use crate::equilibrium::{DeqBlock, DeqTape, Mode, Phase};
use crate::field::{Field, LatentState};
use crate::nn::{GroupNorm, GroupNormCache, Linear};
use crate::solvers::SolverTrace;
use crate::traits::Parameterized;
use anyhow::{bail, Context, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FourierDeqNet {
    pub config: ModelConfig,
    pub in_proj: Linear,
    pub in_norm: Option<GroupNorm>,
    pub deq: DeqBlock,
    pub out_1: Linear,
    pub out_2: Linear,
}

/// Forward record consumed by [`FourierDeqNet::backward`].
#[derive(Debug)]
pub struct ModelTape {
    input: Field,
    in_norm: Option<GroupNormCache>,
    deq: DeqTape,
    forecast: Field,
    hidden: Field,
}

impl ModelTape {
    pub fn phase(&self) -> Option<Phase> {
        self.deq.phase()
    }

    pub fn forward_trace(&self) -> Option<&SolverTrace> {
        self.deq.forward_trace()
    }
}

#[derive(Debug, Clone)]
pub struct BackwardReport {
    /// `∂L/∂input`.
    pub input_grad: Field,
    pub forward_trace: Option<SolverTrace>,
    pub backward_trace: Option<SolverTrace>,
}

impl FourierDeqNet {
    /// Validates `config` and initialises every layer from `seed`.
    pub fn new(config: ModelConfig, seed: u64) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Ok(Self::with_rng(config, &mut rng))
    }

    fn with_rng<R: Rng + ?Sized>(config: ModelConfig, rng: &mut R) -> Self {
        let width = config.width;
        let in_proj = Linear::new(config.input_dim, width, rng);
        let in_norm = config
            .norm_locs
            .contains(NormLocation::In)
            .then(|| GroupNorm::new(width / config.group_size, width));
        let deq = DeqBlock::from_config(&config, rng);
        let out_1 = Linear::new(width, config.head_width, rng);
        let out_2 = Linear::new(config.head_width, 1, rng);
        Self {
            config,
            in_proj,
            in_norm,
            deq,
            out_1,
            out_2,
        }
    }

    /// Maps a `batch × M × N × input_dim` field to a `batch × M × N × 1`
    /// prediction.
    pub fn forward(&self, input: &Field, global_step: u64, mode: Mode) -> Result<(Field, ModelTape)> {
        if input.channels() != self.config.input_dim {
            bail!(
                "Model expects {} input channels, got {}.",
                self.config.input_dim,
                input.channels()
            );
        }

        let mut projected = self.in_proj.forward(input).context("input projection")?;
        let in_norm = match &self.in_norm {
            Some(norm) => {
                let (normed, cache) = norm.forward(&projected).context("input normalisation")?;
                projected = normed;
                Some(cache)
            }
            None => None,
        };

        let z0 = LatentState::zeros(projected.shape(), self.config.width);
        let (z, deq) = self.deq.forward(&z0, &projected, global_step, mode)?;

        let forecast = z.forecast;
        let hidden = self.out_1.forward(&forecast).context("output head")?;
        let prediction = self.out_2.forward(&hidden).context("output head")?;
        Ok((
            prediction,
            ModelTape {
                input: input.clone(),
                in_norm,
                deq,
                forecast,
                hidden,
            },
        ))
    }

    /// Inference-mode forward that keeps only the prediction.
    pub fn predict(&self, input: &Field, global_step: u64) -> Result<Field> {
        Ok(self.forward(input, global_step, Mode::Inference)?.0)
    }

    /// Back-propagates `grad_prediction`, accumulating parameter gradients
    /// into `grads` (usually from [`Parameterized::zeros_like`]).
    pub fn backward(
        &self,
        tape: ModelTape,
        grad_prediction: &Field,
        grads: &mut FourierDeqNet,
    ) -> Result<BackwardReport> {
        if tape.deq.is_detached() {
            bail!("Cannot differentiate a forward pass run in inference mode.");
        }
        if grad_prediction.shape() != tape.hidden.shape() || grad_prediction.channels() != 1 {
            bail!(
                "Prediction gradient {:?} x {} does not match prediction {:?} x 1.",
                grad_prediction.shape(),
                grad_prediction.channels(),
                tape.hidden.shape()
            );
        }

        let grad_hidden = self
            .out_2
            .backward(&tape.hidden, grad_prediction, Some(&mut grads.out_2));
        let grad_forecast = self
            .out_1
            .backward(&tape.forecast, &grad_hidden, Some(&mut grads.out_1));
        let grad_state = LatentState::new(
            Field::zeros(grad_forecast.shape(), grad_forecast.channels()),
            grad_forecast,
        )?;

        let forward_trace = tape.deq.forward_trace().cloned();
        let deq = self
            .deq
            .backward(tape.deq, &grad_state, Some(&mut grads.deq))
            .context("DEQ block backward")?;

        let mut grad = deq.x;
        if let (Some(norm), Some(cache)) = (&self.in_norm, &tape.in_norm) {
            grad = norm.backward(cache, &grad, grads.in_norm.as_mut());
        }
        let input_grad = self
            .in_proj
            .backward(&tape.input, &grad, Some(&mut grads.in_proj));

        Ok(BackwardReport {
            input_grad,
            forward_trace,
            backward_trace: deq.backward_trace,
        })
    }

    /// Jacobian regulariser at the DEQ block's last recorded application.
    pub fn jacobian_penalty<R: Rng + ?Sized>(
        &self,
        tape: &ModelTape,
        probes: usize,
        rng: &mut R,
    ) -> Option<f64> {
        self.deq.jacobian_penalty(&tape.deq, probes, rng)
    }
}

impl Parameterized for FourierDeqNet {
    fn zeros_like(&self) -> Self {
        Self {
            config: self.config.clone(),
            in_proj: self.in_proj.zeros_like(),
            in_norm: self.in_norm.as_ref().map(GroupNorm::zeros_like),
            deq: self.deq.zeros_like(),
            out_1: self.out_1.zeros_like(),
            out_2: self.out_2.zeros_like(),
        }
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&str, &[f64])) {
        self.in_proj.visit_parameters(visitor);
        if let Some(norm) = &self.in_norm {
            norm.visit_parameters(visitor);
        }
        self.deq.visit_parameters(visitor);
        self.out_1.visit_parameters(visitor);
        self.out_2.visit_parameters(visitor);
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&str, &mut [f64])) {
        self.in_proj.visit_parameters_mut(visitor);
        if let Some(norm) = &mut self.in_norm {
            norm.visit_parameters_mut(visitor);
        }
        self.deq.visit_parameters_mut(visitor);
        self.out_1.visit_parameters_mut(visitor);
        self.out_2.visit_parameters_mut(visitor);
    }
}
