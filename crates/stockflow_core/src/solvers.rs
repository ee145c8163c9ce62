use nalgebra::{DMatrix, DVector};

use crate::error::{NumericError, SimResult, StructuralError};
use crate::traits::{DynamicalSystem, Steppable};

/// Forward Euler. The error estimate is always zero.
pub struct ExplicitEuler {
    k: Vec<f64>,
}

impl ExplicitEuler {
    pub fn new(dim: usize) -> Self {
        Self { k: vec![0.0; dim] }
    }
}

impl Steppable for ExplicitEuler {
    fn order(&self) -> usize {
        1
    }

    fn step(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &mut [f64],
        dt: f64,
        err: &mut [f64],
    ) -> SimResult<()> {
        system.apply(t, state, &mut self.k)?;
        for i in 0..state.len() {
            state[i] += dt * self.k[i];
            err[i] = 0.0;
        }
        Ok(())
    }
}

/// Heun's method with a third order error estimate.
pub struct Rk2 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    tmp: Vec<f64>,
}

impl Rk2 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }
}

impl Steppable for Rk2 {
    fn order(&self) -> usize {
        2
    }

    fn step(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &mut [f64],
        dt: f64,
        err: &mut [f64],
    ) -> SimResult<()> {
        // k1 = f(t, y)
        system.apply(t, state, &mut self.k1)?;

        // k2 = f(t + dt, y + dt*k1)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i];
        }
        system.apply(t + dt, &self.tmp, &mut self.k2)?;

        // k3 = f(t + dt/2, y + dt*(k1 + k2)/4)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + 0.25 * dt * (self.k1[i] + self.k2[i]);
        }
        system.apply(t + 0.5 * dt, &self.tmp, &mut self.k3)?;

        // y_next = y + dt/6 * (k1 + 4k3 + k2)
        for i in 0..state.len() {
            state[i] += dt / 6.0 * (self.k1[i] + 4.0 * self.k3[i] + self.k2[i]);
            err[i] = dt / 3.0 * (2.0 * self.k3[i] - self.k1[i] - self.k2[i]);
        }
        Ok(())
    }
}

/// Runge-Kutta-Fehlberg 4(5). Propagates the fifth order solution.
pub struct Rkf45 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    k5: Vec<f64>,
    k6: Vec<f64>,
    tmp: Vec<f64>,
}

impl Rkf45 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            k5: vec![0.0; dim],
            k6: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }
}

impl Steppable for Rkf45 {
    fn order(&self) -> usize {
        4
    }

    fn step(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &mut [f64],
        dt: f64,
        err: &mut [f64],
    ) -> SimResult<()> {
        let c2 = 0.25;
        let c3 = 3.0 / 8.0;
        let c4 = 12.0 / 13.0;
        let c6 = 0.5;

        let a21 = 0.25;

        let a31 = 3.0 / 32.0;
        let a32 = 9.0 / 32.0;

        let a41 = 1932.0 / 2197.0;
        let a42 = -7200.0 / 2197.0;
        let a43 = 7296.0 / 2197.0;

        let a51 = 439.0 / 216.0;
        let a52 = -8.0;
        let a53 = 3680.0 / 513.0;
        let a54 = -845.0 / 4104.0;

        let a61 = -8.0 / 27.0;
        let a62 = 2.0;
        let a63 = -3544.0 / 2565.0;
        let a64 = 1859.0 / 4104.0;
        let a65 = -11.0 / 40.0;

        // fifth order weights
        let b1 = 16.0 / 135.0;
        let b3 = 6656.0 / 12825.0;
        let b4 = 28561.0 / 56430.0;
        let b5 = -9.0 / 50.0;
        let b6 = 2.0 / 55.0;

        // fifth minus fourth order weights
        let e1 = 1.0 / 360.0;
        let e3 = -128.0 / 4275.0;
        let e4 = -2197.0 / 75240.0;
        let e5 = 1.0 / 50.0;
        let e6 = 2.0 / 55.0;

        // k1
        system.apply(t, state, &mut self.k1)?;

        // k2
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * (a21 * self.k1[i]);
        }
        system.apply(t + c2 * dt, &self.tmp, &mut self.k2)?;

        // k3
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * (a31 * self.k1[i] + a32 * self.k2[i]);
        }
        system.apply(t + c3 * dt, &self.tmp, &mut self.k3)?;

        // k4
        for i in 0..state.len() {
            self.tmp[i] =
                state[i] + dt * (a41 * self.k1[i] + a42 * self.k2[i] + a43 * self.k3[i]);
        }
        system.apply(t + c4 * dt, &self.tmp, &mut self.k4)?;

        // k5
        for i in 0..state.len() {
            self.tmp[i] = state[i]
                + dt * (a51 * self.k1[i] + a52 * self.k2[i] + a53 * self.k3[i] + a54 * self.k4[i]);
        }
        system.apply(t + dt, &self.tmp, &mut self.k5)?;

        // k6
        for i in 0..state.len() {
            self.tmp[i] = state[i]
                + dt * (a61 * self.k1[i]
                    + a62 * self.k2[i]
                    + a63 * self.k3[i]
                    + a64 * self.k4[i]
                    + a65 * self.k5[i]);
        }
        system.apply(t + c6 * dt, &self.tmp, &mut self.k6)?;

        for i in 0..state.len() {
            state[i] += dt
                * (b1 * self.k1[i]
                    + b3 * self.k3[i]
                    + b4 * self.k4[i]
                    + b5 * self.k5[i]
                    + b6 * self.k6[i]);
            err[i] = dt
                * (e1 * self.k1[i]
                    + e3 * self.k3[i]
                    + e4 * self.k4[i]
                    + e5 * self.k5[i]
                    + e6 * self.k6[i]);
        }
        Ok(())
    }
}

const NEWTON_MAX_ITER: usize = 50;
const NEWTON_TOL: f64 = 1e-12;

/// Implicit Runge-Kutta method given by its Butcher tableau. Stage
/// derivatives are found by simplified Newton iteration on the Jacobian at
/// the start of the step; the error is estimated by step doubling.
pub struct ImplicitRk {
    a: Vec<Vec<f64>>,
    b: Vec<f64>,
    c: Vec<f64>,
    order: usize,
    dim: usize,
    half: Vec<f64>,
}

impl ImplicitRk {
    /// Backward Euler.
    pub fn rk1_imp(dim: usize) -> Self {
        Self::with_tableau(vec![vec![1.0]], vec![1.0], vec![1.0], 1, dim)
    }

    /// Implicit midpoint, the one stage Gauss-Legendre method.
    pub fn rk2_imp(dim: usize) -> Self {
        Self::with_tableau(vec![vec![0.5]], vec![1.0], vec![0.5], 2, dim)
    }

    /// Two stage Gauss-Legendre.
    pub fn rk4_imp(dim: usize) -> Self {
        let r = 3.0f64.sqrt() / 6.0;
        Self::with_tableau(
            vec![vec![0.25, 0.25 - r], vec![0.25 + r, 0.25]],
            vec![0.5, 0.5],
            vec![0.5 - r, 0.5 + r],
            4,
            dim,
        )
    }

    fn with_tableau(a: Vec<Vec<f64>>, b: Vec<f64>, c: Vec<f64>, order: usize, dim: usize) -> Self {
        Self {
            a,
            b,
            c,
            order,
            dim,
            half: vec![0.0; dim],
        }
    }

    fn stages(&self) -> usize {
        self.b.len()
    }

    /// One implicit step of size `dt` from `(t, y)`, overwriting `y`.
    fn advance(&self, system: &impl DynamicalSystem, t: f64, y: &mut [f64], dt: f64) -> SimResult<()> {
        let (s, n) = (self.stages(), self.dim);
        let mut f0 = vec![0.0; n];
        system.apply(t, y, &mut f0)?;
        let jac = system.jacobian(t, y)?;

        // I - dt * (A kron J)
        let mut m = DMatrix::<f64>::identity(s * n, s * n);
        for i in 0..s {
            for j in 0..s {
                let aij = self.a[i][j];
                if aij == 0.0 {
                    continue;
                }
                for r in 0..n {
                    for col in 0..n {
                        m[(i * n + r, j * n + col)] -= dt * aij * jac[(r, col)];
                    }
                }
            }
        }
        let lu = m.lu();
        if !lu.is_invertible() {
            return Err(NumericError::SingularJacobian { t }.into());
        }

        let mut k: Vec<f64> = (0..s).flat_map(|_| f0.iter().copied()).collect();
        let mut stage = vec![0.0; n];
        let mut fk = vec![0.0; n];
        let mut converged = false;

        for _ in 0..NEWTON_MAX_ITER {
            let mut residual = DVector::<f64>::zeros(s * n);
            for i in 0..s {
                for r in 0..n {
                    let mut sum = 0.0;
                    for j in 0..s {
                        sum += self.a[i][j] * k[j * n + r];
                    }
                    stage[r] = y[r] + dt * sum;
                }
                system.apply(t + self.c[i] * dt, &stage, &mut fk)?;
                for r in 0..n {
                    residual[i * n + r] = fk[r] - k[i * n + r];
                }
            }
            let delta = lu
                .solve(&residual)
                .ok_or(NumericError::SingularJacobian { t })?;
            let mut size = 0.0f64;
            let mut scale = 1.0f64;
            for (kv, d) in k.iter_mut().zip(delta.iter()) {
                *kv += d;
                size = size.max(d.abs());
                scale = scale.max(kv.abs());
            }
            if !size.is_finite() {
                break;
            }
            if size <= NEWTON_TOL * scale {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(NumericError::StageDivergence { t }.into());
        }

        for r in 0..n {
            let mut sum = 0.0;
            for i in 0..s {
                sum += self.b[i] * k[i * n + r];
            }
            y[r] += dt * sum;
        }
        Ok(())
    }
}

impl Steppable for ImplicitRk {
    fn order(&self) -> usize {
        self.order
    }

    fn step(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &mut [f64],
        dt: f64,
        err: &mut [f64],
    ) -> SimResult<()> {
        let mut full = state.to_vec();
        self.advance(system, t, &mut full, dt)?;

        self.half.copy_from_slice(state);
        let mut half = std::mem::take(&mut self.half);
        let result = self
            .advance(system, t, &mut half, 0.5 * dt)
            .and_then(|_| self.advance(system, t + 0.5 * dt, &mut half, 0.5 * dt));
        if result.is_ok() {
            let denom = f64::from(2u32.pow(self.order as u32) - 1);
            for i in 0..state.len() {
                err[i] = (half[i] - full[i]) / denom;
                state[i] = half[i];
            }
        }
        self.half = half;
        result
    }
}

/// The stepper chosen at reset.
pub enum Stepper {
    Rk2(Rk2),
    Rkf45(Rkf45),
    Implicit(ImplicitRk),
}

impl Stepper {
    /// Adaptive stepper for a solver order and variant. First order
    /// explicit integration is not adaptive; use [`ExplicitEuler`].
    pub fn adaptive(order: u32, implicit: bool, dim: usize) -> SimResult<Self> {
        Ok(match (order, implicit) {
            (1, false) => return Err(StructuralError::ExplicitFirstOrder.into()),
            (1, true) => Stepper::Implicit(ImplicitRk::rk1_imp(dim)),
            (2, false) => Stepper::Rk2(Rk2::new(dim)),
            (2, true) => Stepper::Implicit(ImplicitRk::rk2_imp(dim)),
            (4, false) => Stepper::Rkf45(Rkf45::new(dim)),
            (4, true) => Stepper::Implicit(ImplicitRk::rk4_imp(dim)),
            (order, _) => return Err(StructuralError::UnsupportedOrder(order).into()),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stepper::Rk2(_) => "rk2",
            Stepper::Rkf45(_) => "rkf45",
            Stepper::Implicit(s) => match s.order {
                1 => "rk1imp",
                2 => "rk2imp",
                _ => "rk4imp",
            },
        }
    }
}

impl Steppable for Stepper {
    fn order(&self) -> usize {
        match self {
            Stepper::Rk2(s) => s.order(),
            Stepper::Rkf45(s) => s.order(),
            Stepper::Implicit(s) => s.order(),
        }
    }

    fn step(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &mut [f64],
        dt: f64,
        err: &mut [f64],
    ) -> SimResult<()> {
        match self {
            Stepper::Rk2(s) => s.step(system, t, state, dt, err),
            Stepper::Rkf45(s) => s.step(system, t, state, dt, err),
            Stepper::Implicit(s) => s.step(system, t, state, dt, err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOutcome {
    /// The requested interval was covered.
    Completed,
    /// The step budget ran out first. Not an error.
    MaxStepsReached,
}

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;

/// Step size controller wrapped around a stepper.
pub struct AdaptiveDriver {
    stepper: Stepper,
    h: f64,
    step_min: f64,
    step_max: f64,
    eps_abs: f64,
    eps_rel: f64,
    trial: Vec<f64>,
    err: Vec<f64>,
}

impl AdaptiveDriver {
    pub fn new(stepper: Stepper, dim: usize, step_min: f64, step_max: f64, eps_abs: f64, eps_rel: f64) -> Self {
        Self {
            stepper,
            h: step_max,
            step_min,
            step_max,
            eps_abs,
            eps_rel,
            trial: vec![0.0; dim],
            err: vec![0.0; dim],
        }
    }

    pub fn stepper(&self) -> &Stepper {
        &self.stepper
    }

    /// Back to the initial step size.
    pub fn reset(&mut self) {
        self.h = self.step_max;
        self.stepper.reset();
    }

    /// Largest error relative to its tolerance. NaN errors count as infinite.
    fn error_ratio(&self) -> f64 {
        let mut ratio = 0.0f64;
        for (e, y) in self.err.iter().zip(&self.trial) {
            let tol = self.eps_abs + self.eps_rel * y.abs();
            let r = if tol > 0.0 { e.abs() / tol } else { e.abs() / f64::MIN_POSITIVE };
            if r.is_nan() {
                return f64::INFINITY;
            }
            ratio = ratio.max(r);
        }
        ratio
    }

    /// Advances `state` from `*t` towards `t1`, taking at most `max_steps`
    /// accepted steps.
    pub fn apply(
        &mut self,
        system: &impl DynamicalSystem,
        t: &mut f64,
        t1: f64,
        state: &mut [f64],
        max_steps: usize,
    ) -> SimResult<DriverOutcome> {
        let order = self.stepper.order() as f64;
        let mut accepted = 0;
        while *t < t1 {
            if accepted == max_steps {
                return Ok(DriverOutcome::MaxStepsReached);
            }
            let h = self.h.min(t1 - *t);
            self.trial.copy_from_slice(state);
            self.stepper.step(system, *t, &mut self.trial, h, &mut self.err)?;
            let ratio = self.error_ratio();

            if ratio > 1.1 {
                let factor = (SAFETY * ratio.powf(-1.0 / order)).max(MIN_FACTOR);
                let next = h * factor;
                if next < self.step_min || next <= f64::EPSILON * t.abs().max(1.0) {
                    log::warn!("step size {next:e} below minimum at t={t}");
                    return Err(NumericError::StepSizeUnderflow {
                        t: *t,
                        step_min: self.step_min,
                    }
                    .into());
                }
                log::debug!("rejected step h={h:e} at t={t}, retrying with {next:e}");
                self.h = next;
                continue;
            }

            state.copy_from_slice(&self.trial);
            *t += h;
            accepted += 1;
            if ratio < 0.5 {
                let factor = if ratio == 0.0 {
                    MAX_FACTOR
                } else {
                    (SAFETY * ratio.powf(-1.0 / (order + 1.0))).min(MAX_FACTOR)
                };
                self.h = (h * factor).clamp(self.step_min.max(f64::MIN_POSITIVE), self.step_max);
            } else {
                self.h = h.max(self.step_min);
            }
        }
        Ok(DriverOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// x' = -x, y' = x - y
    struct Decay;

    impl DynamicalSystem for Decay {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) -> SimResult<()> {
            out[0] = -x[0];
            out[1] = x[0] - x[1];
            Ok(())
        }

        fn jacobian(&self, _t: f64, _x: &[f64]) -> SimResult<DMatrix<f64>> {
            Ok(DMatrix::from_row_slice(2, 2, &[-1.0, 0.0, 1.0, -1.0]))
        }
    }

    fn exact(t: f64) -> [f64; 2] {
        [(-t).exp(), t * (-t).exp()]
    }

    fn integrate(stepper: Stepper) -> [f64; 2] {
        let mut driver = AdaptiveDriver::new(stepper, 2, 0.0, 0.05, 1e-10, 1e-10);
        let mut t = 0.0;
        let mut state = [1.0, 0.0];
        let outcome = driver.apply(&Decay, &mut t, 1.0, &mut state, 1_000_000).unwrap();
        assert_eq!(outcome, DriverOutcome::Completed);
        assert_relative_eq!(t, 1.0, epsilon = 1e-12);
        state
    }

    #[test]
    fn adaptive_steppers_reach_the_exact_solution() {
        let expected = exact(1.0);
        for order in [1, 2, 4] {
            for implicit in [false, true] {
                if order == 1 && !implicit {
                    continue;
                }
                let got = integrate(Stepper::adaptive(order, implicit, 2).unwrap());
                assert_relative_eq!(got[0], expected[0], max_relative = 1e-4);
                assert_relative_eq!(got[1], expected[1], max_relative = 1e-4);
            }
        }
    }

    #[test]
    fn euler_takes_a_plain_step() {
        let mut euler = ExplicitEuler::new(2);
        let mut state = [1.0, 0.0];
        let mut err = [1.0, 1.0];
        euler.step(&Decay, 0.0, &mut state, 0.1, &mut err).unwrap();
        assert_eq!(state, [0.9, 0.1]);
        assert_eq!(err, [0.0, 0.0]);
    }

    #[test]
    fn unsupported_configurations() {
        assert_eq!(
            Stepper::adaptive(3, false, 1).err(),
            Some(StructuralError::UnsupportedOrder(3).into())
        );
        assert_eq!(
            Stepper::adaptive(1, false, 1).err(),
            Some(StructuralError::ExplicitFirstOrder.into())
        );
    }

    #[test]
    fn step_budget_is_benign() {
        let stepper = Stepper::adaptive(4, false, 2).unwrap();
        let mut driver = AdaptiveDriver::new(stepper, 2, 0.0, 0.01, 1e-3, 1e-2);
        let mut t = 0.0;
        let mut state = [1.0, 0.0];
        let outcome = driver.apply(&Decay, &mut t, f64::MAX, &mut state, 3).unwrap();
        assert_eq!(outcome, DriverOutcome::MaxStepsReached);
        assert_relative_eq!(t, 0.03, epsilon = 1e-12);
    }

    /// x' = x^2 blows up at t = 1.
    struct Blowup;

    impl DynamicalSystem for Blowup {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) -> SimResult<()> {
            out[0] = x[0] * x[0];
            Ok(())
        }

        fn jacobian(&self, _t: f64, x: &[f64]) -> SimResult<DMatrix<f64>> {
            Ok(DMatrix::from_element(1, 1, 2.0 * x[0]))
        }
    }

    #[test]
    fn step_floor_is_enforced() {
        let stepper = Stepper::adaptive(4, false, 1).unwrap();
        let mut driver = AdaptiveDriver::new(stepper, 1, 1e-3, 0.1, 1e-8, 1e-8);
        let mut t = 0.0;
        let mut state = [1.0];
        let err = driver.apply(&Blowup, &mut t, 2.0, &mut state, 100_000).err();
        assert!(matches!(
            err,
            Some(crate::error::SimError::Numeric(NumericError::StepSizeUnderflow { .. }))
        ));
        assert!(t < 1.0);
    }
}
