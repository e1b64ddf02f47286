pub mod autodiff;
pub mod config;
pub mod equilibrium;
pub mod field;
pub mod model;
pub mod nn;
pub mod solvers;
pub mod spectral;
pub mod spectral_conv;
/// The `fourierflow_core` crate provides the numerical core of a Fourier neural operator
/// wrapped in a deep-equilibrium block, for surrogate models of 2D turbulent flows.
/// Everything runs in `f64` on the CPU, with hand-written reverse-mode gradients.
///
/// Key components:
/// - **Traits**: `FixedPointMap` (maps the solvers iterate), `Parameterized` (layers with trainable tensors).
/// - **Spectral**: orthonormal `rfft2`/`irfft2` with exact adjoints, and the truncated spectral operator.
/// - **Solvers**: Anderson-accelerated fixed-point iteration with residual traces.
/// - **Equilibrium**: the DEQ block, unrolled during pretraining, implicit-gradient afterwards.
/// - **Model**: `FourierDeqNet`, configured from JSON through `ModelConfig`.
pub mod traits;

pub use config::{ConfigError, ModelConfig, NormLocation, NormLocations};
pub use equilibrium::{AdjointMode, DeqBlock, Mode, Phase};
pub use field::{Field, GridShape, LatentState};
pub use model::{BackwardReport, FourierDeqNet, ModelTape};
pub use solvers::{SolverSettings, SolverTrace, StopMode};
