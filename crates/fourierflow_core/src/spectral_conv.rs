//! The operator iterated by the DEQ block: a truncated spectral convolution
//! followed by two residual feed-forward heads that update the backcast and
//! forecast halves of the latent state.

use crate::config::{NormLocation, NormLocations};
use crate::field::{Field, GridShape, LatentState};
use crate::nn::{FeedForward, FeedForwardCache, GroupNorm, GroupNormCache};
use crate::spectral::SpectralPlan;
use crate::traits::Parameterized;
use anyhow::{bail, ensure, Context, Result};
use num_complex::Complex;
use num_traits::Zero;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Complex weight tensor of shape `in × out × modes × modes`, stored as real
/// values with a trailing real/imaginary axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralWeight {
    pub in_dim: usize,
    pub out_dim: usize,
    pub n_modes: usize,
    pub data: Vec<f64>,
}

impl SpectralWeight {
    pub fn zeros(in_dim: usize, out_dim: usize, n_modes: usize) -> Self {
        Self {
            in_dim,
            out_dim,
            n_modes,
            data: vec![0.0; in_dim * out_dim * n_modes * n_modes * 2],
        }
    }

    /// Xavier-normal initialisation, treating the tensor like a
    /// `in × out × modes × modes × 2` convolution kernel.
    pub fn xavier_normal<R: Rng + ?Sized>(
        in_dim: usize,
        out_dim: usize,
        n_modes: usize,
        rng: &mut R,
    ) -> Self {
        let receptive = (n_modes * n_modes * 2) as f64;
        let fan_in = out_dim as f64 * receptive;
        let fan_out = in_dim as f64 * receptive;
        let std = (2.0 / (fan_in + fan_out)).sqrt();
        let mut weight = Self::zeros(in_dim, out_dim, n_modes);
        for v in weight.data.iter_mut() {
            let sample: f64 = rng.sample(StandardNormal);
            *v = sample * std;
        }
        weight
    }

    fn offset(&self, i: usize, o: usize, p: usize, q: usize) -> usize {
        (((i * self.out_dim + o) * self.n_modes + p) * self.n_modes + q) * 2
    }

    pub fn get(&self, i: usize, o: usize, p: usize, q: usize) -> Complex<f64> {
        let at = self.offset(i, o, p, q);
        Complex::new(self.data[at], self.data[at + 1])
    }

    pub fn set(&mut self, i: usize, o: usize, p: usize, q: usize, value: Complex<f64>) {
        let at = self.offset(i, o, p, q);
        self.data[at] = value.re;
        self.data[at + 1] = value.im;
    }

    fn accumulate(&mut self, i: usize, o: usize, p: usize, q: usize, value: Complex<f64>) {
        let at = self.offset(i, o, p, q);
        self.data[at] += value.re;
        self.data[at + 1] += value.im;
    }
}

/// Frequency band of the truncated spectrum. `Low` holds rows `0..n`,
/// `High` the wrapped negative frequencies `M-n..M`; both keep columns
/// `0..n` of the half spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Band {
    Low,
    High,
}

impl Band {
    const ALL: [Band; 2] = [Band::Low, Band::High];

    fn index(self) -> usize {
        match self {
            Band::Low => 0,
            Band::High => 1,
        }
    }

    fn spectrum_row(self, p: usize, height: usize, n_modes: usize) -> usize {
        match self {
            Band::Low => p,
            Band::High => height - n_modes + p,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MixCache {
    plan: SpectralPlan,
    shape: GridShape,
    /// Input spectra indexed by `b * in_dim + i`.
    spectra: Vec<Vec<Complex<f64>>>,
    norms: [Option<GroupNormCache>; 2],
}

#[derive(Debug, Clone)]
pub struct SpectralCache {
    mix: MixCache,
    backcast_ff: FeedForwardCache,
    forecast_ff: FeedForwardCache,
}

impl SpectralCache {
    /// Grid shape of the recorded application.
    pub fn shape(&self) -> GridShape {
        self.mix.shape
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralConv2d {
    pub in_dim: usize,
    pub out_dim: usize,
    pub n_modes: usize,
    /// Low band first, high band second.
    pub fourier_weight: [SpectralWeight; 2],
    pub fourier_norm: Option<GroupNorm>,
    pub backcast_ff: FeedForward,
    pub forecast_ff: FeedForward,
}

impl SpectralConv2d {
    pub fn new<R: Rng + ?Sized>(
        in_dim: usize,
        out_dim: usize,
        n_modes: usize,
        factor: usize,
        group_size: usize,
        norm_locs: &NormLocations,
        rng: &mut R,
    ) -> Self {
        let fourier_weight = [
            SpectralWeight::xavier_normal(in_dim, out_dim, n_modes, rng),
            SpectralWeight::xavier_normal(in_dim, out_dim, n_modes, rng),
        ];
        Self {
            in_dim,
            out_dim,
            n_modes,
            fourier_weight,
            fourier_norm: norm_locs
                .contains(NormLocation::Fourier)
                .then(|| GroupNorm::new(out_dim / group_size, out_dim)),
            forecast_ff: FeedForward::new(out_dim, factor, group_size, norm_locs, rng),
            backcast_ff: FeedForward::new(out_dim, factor, group_size, norm_locs, rng),
        }
    }

    pub fn check_grid(&self, shape: GridShape) -> Result<()> {
        if self.n_modes == 0 {
            bail!("n_modes must be at least 1.");
        }
        if shape.height == 0 || shape.width == 0 {
            bail!("Grid {} x {} has an empty axis.", shape.height, shape.width);
        }
        for (axis, extent) in [("height", shape.height), ("width", shape.width)] {
            if self.n_modes > extent / 2 + 1 {
                bail!(
                    "n_modes = {} exceeds {}/2 + 1 for grid {} {}.",
                    self.n_modes,
                    axis,
                    axis,
                    extent
                );
            }
        }
        Ok(())
    }

    /// Validates the grid and plans its transforms. The plan can be reused by
    /// every application on that grid.
    pub fn plan_for(&self, shape: GridShape) -> Result<SpectralPlan> {
        self.check_grid(shape)?;
        Ok(SpectralPlan::new(shape.height, shape.width))
    }

    /// Truncated spectral convolution: `irfft2(W · rfft2(x))` restricted to
    /// the two retained bands. Output has `out_dim` channels.
    pub fn spectral_mix(&self, x: &Field) -> Result<(Field, MixCache)> {
        let plan = self.plan_for(x.shape())?;
        self.spectral_mix_with(&plan, x)
    }

    pub fn spectral_mix_with(&self, plan: &SpectralPlan, x: &Field) -> Result<(Field, MixCache)> {
        ensure!(
            x.channels() == self.in_dim,
            "Spectral mix expects {} channels, got {}.",
            self.in_dim,
            x.channels()
        );
        let shape = x.shape();
        self.check_grid(shape)?;
        ensure!(
            plan.height() == shape.height && plan.width() == shape.width,
            "Plan for {} x {} used on grid {} x {}.",
            plan.height(),
            plan.width(),
            shape.height,
            shape.width
        );

        let per_sample = shape.cells_per_sample();
        let half = plan.half_width();
        let n = self.n_modes;

        let mut spectra = Vec::with_capacity(shape.batch * self.in_dim);
        for b in 0..shape.batch {
            for i in 0..self.in_dim {
                let grid: Vec<f64> = x
                    .values()
                    .column(i)
                    .rows(b * per_sample, per_sample)
                    .iter()
                    .copied()
                    .collect();
                spectra.push(plan.rfft2(&grid));
            }
        }

        let mut out_spectra = vec![vec![Complex::<f64>::zero(); plan.spectrum_len()]; shape.batch * self.out_dim];
        let mut norms = [None, None];
        for band in Band::ALL {
            let weight = &self.fourier_weight[band.index()];
            let mut block = vec![Complex::<f64>::zero(); shape.batch * self.out_dim * n * n];
            for b in 0..shape.batch {
                for o in 0..self.out_dim {
                    for p in 0..n {
                        let row = band.spectrum_row(p, shape.height, n);
                        for q in 0..n {
                            let mut acc = Complex::zero();
                            for i in 0..self.in_dim {
                                acc += spectra[b * self.in_dim + i][row * half + q] * weight.get(i, o, p, q);
                            }
                            block[((b * self.out_dim + o) * n + p) * n + q] = acc;
                        }
                    }
                }
            }

            if let Some(norm) = &self.fourier_norm {
                let (normed, cache) = norm
                    .forward(&block_to_field(&block, shape.batch, self.out_dim, n))
                    .context("fourier normalisation")?;
                block = field_to_block(&normed, n);
                norms[band.index()] = Some(cache);
            }

            for b in 0..shape.batch {
                for o in 0..self.out_dim {
                    let target = &mut out_spectra[b * self.out_dim + o];
                    for p in 0..n {
                        let row = band.spectrum_row(p, shape.height, n);
                        for q in 0..n {
                            target[row * half + q] = block[((b * self.out_dim + o) * n + p) * n + q];
                        }
                    }
                }
            }
        }

        let mut out = Field::zeros(shape, self.out_dim);
        for b in 0..shape.batch {
            for o in 0..self.out_dim {
                let grid = plan.irfft2(&out_spectra[b * self.out_dim + o]);
                for (local, v) in grid.into_iter().enumerate() {
                    out.values_mut()[(b * per_sample + local, o)] = v;
                }
            }
        }

        Ok((
            out,
            MixCache {
                plan: plan.clone(),
                shape,
                spectra,
                norms,
            },
        ))
    }

    fn spectral_mix_backward(
        &self,
        cache: &MixCache,
        grad_out: &Field,
        mut weight_grads: Option<&mut [SpectralWeight; 2]>,
        mut norm_grads: Option<&mut GroupNorm>,
    ) -> Field {
        let shape = cache.shape;
        let plan = &cache.plan;
        let per_sample = shape.cells_per_sample();
        let half = plan.half_width();
        let n = self.n_modes;

        let mut out_grads = Vec::with_capacity(shape.batch * self.out_dim);
        for b in 0..shape.batch {
            for o in 0..self.out_dim {
                let grid: Vec<f64> = grad_out
                    .values()
                    .column(o)
                    .rows(b * per_sample, per_sample)
                    .iter()
                    .copied()
                    .collect();
                out_grads.push(plan.irfft2_adjoint(&grid));
            }
        }

        let mut input_grads = vec![vec![Complex::<f64>::zero(); plan.spectrum_len()]; shape.batch * self.in_dim];
        for band in Band::ALL {
            let mut block = vec![Complex::<f64>::zero(); shape.batch * self.out_dim * n * n];
            for b in 0..shape.batch {
                for o in 0..self.out_dim {
                    let source = &out_grads[b * self.out_dim + o];
                    for p in 0..n {
                        let row = band.spectrum_row(p, shape.height, n);
                        // Low-band rows that the high band overwrote received no gradient.
                        if band == Band::Low && row >= shape.height - n {
                            continue;
                        }
                        for q in 0..n {
                            block[((b * self.out_dim + o) * n + p) * n + q] = source[row * half + q];
                        }
                    }
                }
            }

            if let (Some(norm), Some(norm_cache)) = (&self.fourier_norm, &cache.norms[band.index()]) {
                let grad_field = block_to_field(&block, shape.batch, self.out_dim, n);
                let pre_norm = norm.backward(norm_cache, &grad_field, norm_grads.as_deref_mut());
                block = field_to_block(&pre_norm, n);
            }

            let weight = &self.fourier_weight[band.index()];
            for b in 0..shape.batch {
                for p in 0..n {
                    let row = band.spectrum_row(p, shape.height, n);
                    for q in 0..n {
                        let at = row * half + q;
                        for o in 0..self.out_dim {
                            let g = block[((b * self.out_dim + o) * n + p) * n + q];
                            if g.is_zero() {
                                continue;
                            }
                            for i in 0..self.in_dim {
                                let x = cache.spectra[b * self.in_dim + i][at];
                                input_grads[b * self.in_dim + i][at] += g * weight.get(i, o, p, q).conj();
                                if let Some(grads) = weight_grads.as_deref_mut() {
                                    grads[band.index()].accumulate(i, o, p, q, g * x.conj());
                                }
                            }
                        }
                    }
                }
            }
        }

        let mut grad_in = Field::zeros(shape, self.in_dim);
        for b in 0..shape.batch {
            for i in 0..self.in_dim {
                let grid = plan.rfft2_adjoint(&input_grads[b * self.in_dim + i]);
                for (local, v) in grid.into_iter().enumerate() {
                    grad_in.values_mut()[(b * per_sample + local, i)] = v;
                }
            }
        }
        grad_in
    }

    /// One operator application `f(z, x)`.
    ///
    /// The residual `x - backcast` is mixed spectrally, then each half of
    /// the state is updated by its own residual feed-forward head.
    pub fn forward(&self, z: &LatentState, x: &Field) -> Result<(LatentState, SpectralCache)> {
        let plan = self.plan_for(x.shape())?;
        self.forward_with(&plan, z, x)
    }

    /// [`Self::forward`] with a plan from [`Self::plan_for`].
    pub fn forward_with(
        &self,
        plan: &SpectralPlan,
        z: &LatentState,
        x: &Field,
    ) -> Result<(LatentState, SpectralCache)> {
        ensure!(
            self.in_dim == self.out_dim,
            "The latent update needs in_dim == out_dim, got {} and {}.",
            self.in_dim,
            self.out_dim
        );
        if !x.same_layout(&z.backcast) {
            bail!(
                "Input field {:?} x {} does not match latent state {:?} x {}.",
                x.shape(),
                x.channels(),
                z.shape(),
                z.channels()
            );
        }

        let residual = x.sub(&z.backcast)?;
        let (mixed, mix) = self.spectral_mix_with(plan, &residual)?;
        let (backcast, backcast_ff) = self
            .backcast_ff
            .forward(&mixed, &z.backcast)
            .context("backcast head")?;
        let (forecast, forecast_ff) = self
            .forecast_ff
            .forward(&mixed, &z.forecast)
            .context("forecast head")?;

        Ok((
            LatentState { backcast, forecast },
            SpectralCache {
                mix,
                backcast_ff,
                forecast_ff,
            },
        ))
    }

    /// Returns `(∂L/∂z, ∂L/∂x)`; parameter gradients go into `grads` when given.
    pub fn backward(
        &self,
        cache: &SpectralCache,
        grad_out: &LatentState,
        grads: Option<&mut SpectralConv2d>,
    ) -> (LatentState, Field) {
        let (g_weights, g_norm, g_backcast_ff, g_forecast_ff) = match grads {
            Some(g) => (
                Some(&mut g.fourier_weight),
                g.fourier_norm.as_mut(),
                Some(&mut g.backcast_ff),
                Some(&mut g.forecast_ff),
            ),
            None => (None, None, None, None),
        };

        let (g_mixed_b, g_backcast) =
            self.backcast_ff
                .backward(&cache.backcast_ff, &grad_out.backcast, g_backcast_ff);
        let (g_mixed_f, g_forecast) =
            self.forecast_ff
                .backward(&cache.forecast_ff, &grad_out.forecast, g_forecast_ff);
        let g_mixed = g_mixed_b.with_values(g_mixed_b.values() + g_mixed_f.values());

        let g_residual = self.spectral_mix_backward(&cache.mix, &g_mixed, g_weights, g_norm);
        let g_backcast = g_backcast.with_values(g_backcast.values() - g_residual.values());

        (
            LatentState {
                backcast: g_backcast,
                forecast: g_forecast,
            },
            g_residual,
        )
    }

    /// Vector-Jacobian product `vᵀ ∂f/∂z` at the point recorded in `cache`.
    pub fn state_vjp(&self, cache: &SpectralCache, v: &LatentState) -> LatentState {
        self.backward(cache, v, None).0
    }

    /// Hutchinson estimate of `‖∂f/∂z‖²_F` divided by the state size, using
    /// `probes` Gaussian vectors.
    pub fn jacobian_frobenius_estimate<R: Rng + ?Sized>(
        &self,
        cache: &SpectralCache,
        probes: usize,
        rng: &mut R,
    ) -> f64 {
        let shape = cache.mix.shape;
        let channels = self.out_dim;
        let numel = (2 * shape.cells() * channels) as f64;
        if probes == 0 || numel == 0.0 {
            return 0.0;
        }
        let mut total = 0.0;
        for _ in 0..probes {
            let mut draw = |_: usize, _: usize, _: usize, _: usize| rng.sample::<f64, _>(StandardNormal);
            let backcast = Field::from_fn(shape, channels, &mut draw);
            let forecast = Field::from_fn(shape, channels, &mut draw);
            let product = self.state_vjp(cache, &LatentState { backcast, forecast });
            total += product.norm().powi(2);
        }
        total / probes as f64 / numel
    }
}

fn block_to_field(block: &[Complex<f64>], batch: usize, channels: usize, n: usize) -> Field {
    let shape = GridShape::new(batch, n, 2 * n);
    Field::from_fn(shape, channels, |b, p, col, o| {
        let v = block[((b * channels + o) * n + p) * n + col / 2];
        if col % 2 == 0 {
            v.re
        } else {
            v.im
        }
    })
}

fn field_to_block(field: &Field, n: usize) -> Vec<Complex<f64>> {
    let shape = field.shape();
    let channels = field.channels();
    let mut block = vec![Complex::<f64>::zero(); shape.batch * channels * n * n];
    for b in 0..shape.batch {
        for o in 0..channels {
            for p in 0..n {
                for q in 0..n {
                    block[((b * channels + o) * n + p) * n + q] =
                        Complex::new(field.get(b, p, 2 * q, o), field.get(b, p, 2 * q + 1, o));
                }
            }
        }
    }
    block
}

impl Parameterized for SpectralConv2d {
    fn zeros_like(&self) -> Self {
        Self {
            in_dim: self.in_dim,
            out_dim: self.out_dim,
            n_modes: self.n_modes,
            fourier_weight: [
                SpectralWeight::zeros(self.in_dim, self.out_dim, self.n_modes),
                SpectralWeight::zeros(self.in_dim, self.out_dim, self.n_modes),
            ],
            fourier_norm: self.fourier_norm.as_ref().map(GroupNorm::zeros_like),
            backcast_ff: self.backcast_ff.zeros_like(),
            forecast_ff: self.forecast_ff.zeros_like(),
        }
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&str, &[f64])) {
        for weight in &self.fourier_weight {
            visitor("fourier_weight", &weight.data);
        }
        if let Some(norm) = &self.fourier_norm {
            norm.visit_parameters(visitor);
        }
        self.backcast_ff.visit_parameters(visitor);
        self.forecast_ff.visit_parameters(visitor);
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&str, &mut [f64])) {
        for weight in &mut self.fourier_weight {
            visitor("fourier_weight", &mut weight.data);
        }
        if let Some(norm) = &mut self.fourier_norm {
            norm.visit_parameters_mut(visitor);
        }
        self.backcast_ff.visit_parameters_mut(visitor);
        self.forecast_ff.visit_parameters_mut(visitor);
    }
}
