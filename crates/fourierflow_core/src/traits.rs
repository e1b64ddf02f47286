use nalgebra::DMatrix;

/// A mapping whose fixed points the solvers look for.
///
/// States are packed one batch sample per column, so a map must return a
/// matrix with the same shape as its input.
pub trait FixedPointMap {
    fn apply(&mut self, z: &DMatrix<f64>) -> DMatrix<f64>;
}

impl<F> FixedPointMap for F
where
    F: FnMut(&DMatrix<f64>) -> DMatrix<f64>,
{
    fn apply(&mut self, z: &DMatrix<f64>) -> DMatrix<f64> {
        self(z)
    }
}

/// A layer (or model) that owns trainable parameters.
///
/// Gradients are stored in a value of the same type, created with
/// `zeros_like`, so parameters and gradients can be visited in lockstep.
pub trait Parameterized {
    /// Returns a copy of `self` with every parameter set to zero.
    fn zeros_like(&self) -> Self
    where
        Self: Sized;

    /// Visits every parameter tensor as a flat slice, in a fixed order.
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&str, &[f64]));

    /// Mutable counterpart of `visit_parameters`, same order.
    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&str, &mut [f64]));
}
