use nalgebra::DMatrix;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

use crate::error::SimResult;

/// A trait for types the instruction list can be evaluated over.
/// `f64` for plain evaluation, `Dual` for exact Jacobian columns.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {
    fn lift(value: f64) -> Self {
        Self::from_f64(value).unwrap_or_else(Self::nan)
    }
}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// A system of first order ODEs in the stock variables.
pub trait DynamicalSystem {
    /// Number of stock variables.
    fn dimension(&self) -> usize;

    /// Evaluates the stock derivatives.
    /// t: current time
    /// x: candidate stock values
    /// out: buffer receiving dx/dt
    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) -> SimResult<()>;

    /// d(dx/dt)/dx evaluated at `x`, rows indexed by derivative, columns by stock.
    fn jacobian(&self, t: f64, x: &[f64]) -> SimResult<DMatrix<f64>>;
}

/// A single-step method with an embedded (or step-doubling) error estimate.
pub trait Steppable {
    /// Order of the propagated solution, used by the step size controller.
    fn order(&self) -> usize;

    /// Advances `state` from `t` by `dt`, writing the local error estimate into `err`.
    /// On failure `state` is left untouched.
    fn step(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &mut [f64],
        dt: f64,
        err: &mut [f64],
    ) -> SimResult<()>;

    /// Drops any state carried between steps.
    fn reset(&mut self) {}
}
