//! Compiled derivatives integrated back must reproduce the function they
//! were taken from.

use anyhow::{Context, Result};
use approx::assert_relative_eq;
use stockflow_core::{
    differentiate_name, ItemId, Model, OperationType, SimError, Simulation, SimulationConfig,
    StructuralError, VariableType,
};

/// `t + 0.1` and its square, a differentiator feeding an integral, and a
/// flow variable `f` receiving the function under test.
struct Fixture {
    sim: Simulation,
    plus: ItemId,
    tsq: ItemId,
    deriv: ItemId,
    f: ItemId,
    stock: String,
}

impl Fixture {
    fn new() -> Result<Self> {
        let mut m = Model::new();
        let root = Model::ROOT;
        let integ = m.add_operation(root, OperationType::Integrate)?;
        let offs = m.add_constant(root, 0.1)?;
        let t = m.add_operation(root, OperationType::Time)?;
        let plus = m.add_operation(root, OperationType::Add)?;
        let tsq = m.add_operation(root, OperationType::Multiply)?;
        let deriv = m.add_operation(root, OperationType::Differentiate)?;
        let f = m.add_variable(root, "f", VariableType::Flow)?;
        m.connect(t, plus, 0)?;
        m.connect(offs, plus, 1)?;
        m.connect(plus, tsq, 0)?;
        m.connect(plus, tsq, 1)?;
        m.connect(deriv, integ, 0)?;
        let stock = m.value_id(integ).context("integral has a stock")?;

        let config = SimulationConfig {
            step_min: 1e-6,
            step_max: 1e-3,
            eps_abs: 1e-3,
            eps_rel: 1e-2,
            order: 4,
            ..Default::default()
        };
        Ok(Self {
            sim: Simulation::with_config(m, config),
            plus,
            tsq,
            deriv,
            f,
            stock,
        })
    }

    /// Wires `op` as the function under test.
    fn observe(&mut self, op: ItemId) -> Result<()> {
        let (deriv, f) = (self.deriv, self.f);
        let m = self.sim.model_mut();
        m.connect(op, deriv, 0)?;
        m.connect(op, f, 0)?;
        Ok(())
    }

    fn f(&self) -> f64 {
        self.sim.value(":f").unwrap_or(f64::NAN)
    }

    fn check_consistent(&mut self, rounds: usize) -> Result<()> {
        self.sim.reset()?;
        self.sim.set_n_steps(1);
        self.sim.step()?;
        let f0 = self.f();
        self.sim.set_value(&self.stock, f0)?;
        self.sim.set_n_steps(800);
        for _ in 0..rounds {
            self.sim.step()?;
        }
        let integrated = self.sim.value(&self.stock).context("stock value")?;
        assert_relative_eq!(self.f() / integrated, 1.0, max_relative = 0.003);
        assert!((self.f() - f0).abs() > 0.1 * f0.abs());
        Ok(())
    }
}

#[test]
fn name_round_trip() {
    let dx = differentiate_name("x");
    let d2x = differentiate_name(&dx);
    let d3x = differentiate_name(&d2x);
    assert_eq!(dx, "dx/dt");
    assert_eq!(d2x, "d^{2}x/dt^{2}");
    assert_eq!(d3x, "d^{3}x/dt^{3}");
    assert_eq!(differentiate_name("d^nx/dt^n"), "dd^nx/dt^n/dt");
    assert_eq!(differentiate_name("d^2x/dt^3"), "dd^2x/dt^3/dt");
}

#[test]
fn subtract() -> Result<()> {
    let mut fx = Fixture::new()?;
    let m = fx.sim.model_mut();
    let t = m.add_operation(Model::ROOT, OperationType::Time)?;
    let minus = m.add_operation(Model::ROOT, OperationType::Subtract)?;
    m.connect(t, minus, 0)?;
    m.connect(fx.tsq, minus, 1)?;
    fx.observe(minus)?;
    fx.check_consistent(1)
}

#[test]
fn pow() -> Result<()> {
    let mut fx = Fixture::new()?;
    let m = fx.sim.model_mut();
    let pow = m.add_operation(Model::ROOT, OperationType::Pow)?;
    m.connect(fx.plus, pow, 0)?;
    m.connect(fx.tsq, pow, 1)?;
    fx.observe(pow)?;
    fx.check_consistent(2)
}

#[test]
fn divide() -> Result<()> {
    let mut fx = Fixture::new()?;
    let m = fx.sim.model_mut();
    let t = m.add_operation(Model::ROOT, OperationType::Time)?;
    let div = m.add_operation(Model::ROOT, OperationType::Divide)?;
    m.connect(t, div, 0)?;
    m.connect(fx.plus, div, 0)?;
    m.connect(fx.tsq, div, 1)?;
    fx.observe(div)?;
    fx.check_consistent(1)
}

#[test]
fn log() -> Result<()> {
    let mut fx = Fixture::new()?;
    let m = fx.sim.model_mut();
    let log = m.add_operation(Model::ROOT, OperationType::Log)?;
    let exp = m.add_operation(Model::ROOT, OperationType::Exp)?;
    m.connect(fx.plus, exp, 0)?;
    m.connect(exp, log, 0)?;
    m.connect(fx.tsq, log, 1)?;
    fx.observe(log)?;
    fx.check_consistent(1)
}

#[test]
fn single_argument_functions() -> Result<()> {
    for op in OperationType::FUNCTIONS {
        let mut fx = Fixture::new()?;
        let m = fx.sim.model_mut();
        let fun = m.add_operation(Model::ROOT, op)?;
        m.connect(fx.plus, fun, 0)?;
        fx.observe(fun)?;
        if op.differentiable() {
            fx.check_consistent(1).with_context(|| format!("function {op}"))?;
        } else {
            let err = fx.sim.reset().err().context("reset should fail")?;
            assert_eq!(
                err,
                SimError::Structural(StructuralError::NotDifferentiable {
                    op,
                    item: Some(fun)
                }),
                "function {op}"
            );
        }
    }
    Ok(())
}

#[test]
fn second_derivative_of_a_cubic() -> Result<()> {
    // d2/dt2 (t+0.1)^3 = 6 (t+0.1)
    let mut fx = Fixture::new()?;
    let m = fx.sim.model_mut();
    let cube = m.add_operation(Model::ROOT, OperationType::Multiply)?;
    m.connect(fx.tsq, cube, 0)?;
    m.connect(fx.plus, cube, 1)?;
    let d1 = m.add_operation(Model::ROOT, OperationType::Differentiate)?;
    let d2 = m.add_operation(Model::ROOT, OperationType::Differentiate)?;
    let out = m.add_variable(Model::ROOT, "d2", VariableType::Flow)?;
    m.connect(cube, d1, 0)?;
    m.connect(d1, d2, 0)?;
    m.connect(d2, out, 0)?;
    fx.observe(cube)?;
    fx.sim.reset()?;
    fx.sim.set_n_steps(100);
    fx.sim.step()?;
    let t = fx.sim.t();
    assert_relative_eq!(
        fx.sim.value(":d2").context("d2")?,
        6.0 * (t + 0.1),
        max_relative = 1e-12
    );
    Ok(())
}
