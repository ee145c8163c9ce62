//! Compilation of a model into an equation system and the integrator state
//! machine stepping it.

use std::io::Write;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::autodiff::Dual;
use crate::cycle::find_cycle;
use crate::dag::{Integral, PlotBinding, SystemOfEquations};
use crate::error::{NumericError, SimResult, StructuralError};
use crate::eval_op::{check_equation_order, eval_all, EvalOp};
use crate::godley_eval::GodleyEvaluator;
use crate::graph::{ItemId, Model};
use crate::solvers::{AdaptiveDriver, DriverOutcome, ExplicitEuler, Stepper};
use crate::traits::{DynamicalSystem, Scalar, Steppable};
use crate::variable::{VariableType, VariableValues};

/// Solver settings, checked on every reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// 1, 2 or 4.
    pub order: u32,
    pub implicit: bool,
    pub step_min: f64,
    /// Largest adaptive step, and the fixed step of explicit Euler.
    pub step_max: f64,
    pub eps_abs: f64,
    pub eps_rel: f64,
    /// Steps taken per call to [`Simulation::step`].
    pub n_steps: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            order: 4,
            implicit: false,
            step_min: 0.0,
            step_max: 0.01,
            eps_abs: 1e-3,
            eps_rel: 1e-2,
            n_steps: 1,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> SimResult<()> {
        let invalid = |msg: &str| -> SimResult<()> {
            Err(StructuralError::InvalidConfig(msg.to_string()).into())
        };
        if !matches!(self.order, 1 | 2 | 4) {
            return Err(StructuralError::UnsupportedOrder(self.order).into());
        }
        if !(self.step_max.is_finite() && self.step_max > 0.0) {
            return invalid("step_max must be positive");
        }
        if !(self.step_min >= 0.0 && self.step_min <= self.step_max) {
            return invalid("step_min must lie in [0, step_max]");
        }
        if !(self.eps_abs >= 0.0 && self.eps_rel >= 0.0) {
            return invalid("tolerances must be non-negative");
        }
        if self.n_steps == 0 {
            return invalid("n_steps must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimState {
    Uninitialized,
    Ready,
    Stepping,
    Failed,
}

/// The compiled model as an ODE in its stocks.
#[derive(Debug, Clone)]
pub struct EquationSystem {
    ops: Vec<EvalOp>,
    godley: GodleyEvaluator,
    integrals: Vec<Integral>,
    /// Flow array as primed at compile time; every evaluation starts from it.
    flow_defaults: Vec<f64>,
    n_stocks: usize,
    slots: Vec<NamedSlot>,
}

/// Where a named variable lives in the flow or stock array.
#[derive(Debug, Clone)]
struct NamedSlot {
    id: String,
    stock: bool,
    idx: usize,
}

fn named_slots(values: &VariableValues) -> Vec<NamedSlot> {
    values
        .iter()
        .filter_map(|(id, v)| {
            v.idx.map(|idx| NamedSlot {
                id: id.to_string(),
                stock: v.ty.is_stock(),
                idx,
            })
        })
        .collect()
}

impl EquationSystem {
    pub fn ops(&self) -> &[EvalOp] {
        &self.ops
    }

    pub fn integrals(&self) -> &[Integral] {
        &self.integrals
    }

    pub fn godley(&self) -> &GodleyEvaluator {
        &self.godley
    }

    pub fn flow_len(&self) -> usize {
        self.flow_defaults.len()
    }

    fn eval_flows<T: Scalar>(&self, t: f64, state: &[T]) -> Vec<T> {
        let mut flow: Vec<T> = self.flow_defaults.iter().map(|&v| T::lift(v)).collect();
        eval_all(&self.ops, t, &mut flow, state);
        flow
    }

    /// Writes the stock derivatives into `result` and returns the flows
    /// they were computed from.
    fn eval<T: Scalar>(&self, t: f64, state: &[T], result: &mut [T]) -> Vec<T> {
        let flow = self.eval_flows(t, state);
        for r in result.iter_mut() {
            *r = T::zero();
        }
        self.godley.eval(state, &flow, result);
        for integral in &self.integrals {
            if let Some(r) = result.get_mut(integral.stock) {
                *r = integral.input.read(&flow, state);
            }
        }
        flow
    }

    /// The flow array at `(t, state)`.
    pub fn flows(&self, t: f64, state: &[f64]) -> Vec<f64> {
        self.eval_flows(t, state)
    }
}

impl DynamicalSystem for EquationSystem {
    fn dimension(&self) -> usize {
        self.n_stocks
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) -> SimResult<()> {
        let flow = self.eval(t, x, out);
        if out.iter().chain(&flow).all(|v| v.is_finite()) {
            return Ok(());
        }
        let (name, item) = first_non_finite(&self.slots, &self.ops, x, &flow)
            .or_else(|| {
                let i = out.iter().position(|v| !v.is_finite())?;
                let stock = self.slots.iter().find(|s| s.stock && s.idx == i)?;
                Some((stock.id.clone(), None))
            })
            .unwrap_or_else(|| ("derivative".to_string(), None));
        Err(NumericError::NonFinite { name, item }.into())
    }

    fn jacobian(&self, t: f64, x: &[f64]) -> SimResult<DMatrix<f64>> {
        let dim = self.n_stocks;
        let mut jacobian = DMatrix::zeros(dim, dim);
        let mut dual_state = vec![Dual::constant(0.0); dim];
        let mut dual_out = vec![Dual::constant(0.0); dim];

        for j in 0..dim {
            for i in 0..dim {
                let v = x.get(i).copied().unwrap_or(0.0);
                dual_state[i] = Dual::new(v, if i == j { 1.0 } else { 0.0 });
            }
            self.eval(t, &dual_state, &mut dual_out);
            for i in 0..dim {
                jacobian[(i, j)] = dual_out[i].eps;
            }
        }
        Ok(jacobian)
    }
}

enum Integrator {
    Euler(ExplicitEuler),
    Adaptive(AdaptiveDriver),
}

impl Integrator {
    fn name(&self) -> &'static str {
        match self {
            Integrator::Euler(_) => "euler",
            Integrator::Adaptive(d) => d.stepper().name(),
        }
    }
}

/// A model together with everything needed to simulate it.
pub struct Simulation {
    model: Model,
    dirty: bool,
    config: SimulationConfig,
    values: VariableValues,
    system: Option<EquationSystem>,
    plots: Vec<PlotBinding>,
    integrator: Option<Integrator>,
    t: f64,
    state: SimState,
    log_sink: Option<Box<dyn Write>>,
}

impl Simulation {
    pub fn new(model: Model) -> Self {
        Self::with_config(model, SimulationConfig::default())
    }

    pub fn with_config(model: Model, config: SimulationConfig) -> Self {
        Self {
            model,
            dirty: true,
            config,
            values: VariableValues::new(),
            system: None,
            plots: Vec::new(),
            integrator: None,
            t: 0.0,
            state: SimState::Uninitialized,
            log_sink: None,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Mutable model access. Any edit forces a reset before the next step.
    pub fn model_mut(&mut self) -> &mut Model {
        self.dirty = true;
        &mut self.model
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SimulationConfig) {
        self.config = config;
        self.dirty = true;
    }

    /// Steps per call. Takes effect without a reset.
    pub fn set_n_steps(&mut self, n_steps: usize) {
        self.config.n_steps = n_steps.max(1);
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub fn state(&self) -> SimState {
        self.state
    }

    pub fn values(&self) -> &VariableValues {
        &self.values
    }

    pub fn value(&self, id: &str) -> Option<f64> {
        self.values.value(id)
    }

    /// Overwrites a live value, such as a constant of integration or a
    /// parameter, between steps. The value holds until something computes
    /// over it or the next reset.
    pub fn set_value(&mut self, id: &str, v: f64) -> SimResult<()> {
        let Some(entry) = self.values.get(id) else {
            return Err(StructuralError::UnknownVariable(id.to_string()).into());
        };
        if let (Some(idx), false, Some(system)) =
            (entry.idx, entry.ty.is_stock(), self.system.as_mut())
        {
            if let Some(slot) = system.flow_defaults.get_mut(idx) {
                *slot = v;
            }
        }
        self.values.set_value(id, v);
        Ok(())
    }

    pub fn system(&self) -> Option<&EquationSystem> {
        self.system.as_ref()
    }

    pub fn plots(&self) -> &[PlotBinding] {
        &self.plots
    }

    /// Current value feeding each input of a plot.
    pub fn plot_values(&self, plot: ItemId) -> Option<Vec<Option<f64>>> {
        let binding = self.plots.iter().find(|p| p.plot == plot)?;
        Some(
            binding
                .inputs
                .iter()
                .map(|o| o.map(|o| o.read(&self.values.flow_vars, &self.values.stock_vars)))
                .collect(),
        )
    }

    /// Each reset writes a header line, each step a line of values.
    pub fn set_log_sink(&mut self, sink: Option<Box<dyn Write>>) {
        self.log_sink = sink;
    }

    /// Retypes every icon of a value id.
    pub fn convert_var_type(&mut self, value_id: &str, ty: VariableType) -> SimResult<()> {
        self.model.convert_var_type(value_id, ty)?;
        self.dirty = true;
        Ok(())
    }

    /// Checks, compiles and primes the model. On error nothing derived from
    /// the model changes.
    pub fn construct_equations(&mut self) -> SimResult<()> {
        if let Some(item) = find_cycle(&self.model) {
            return Err(StructuralError::Cycle { item: Some(item) }.into());
        }
        let dag = SystemOfEquations::new(&self.model)?;

        let mut values = self.values.clone();
        for (id, ty, init) in dag.variables() {
            values.ensure(id, ty, init);
        }
        values.garbage_collect(&dag.live_ids());
        values.reset()?;
        let compiled = dag.linearize(&mut values)?;
        if !check_equation_order(&compiled.ops, values.flow_vars.len()) {
            return Err(StructuralError::EquationOrder.into());
        }
        let godley = GodleyEvaluator::new(&self.model, &values);

        let n_stocks = values.stock_vars.len();
        if n_stocks == 0 {
            values.stock_vars.push(0.0);
        }
        let system = EquationSystem {
            ops: compiled.ops,
            godley,
            integrals: compiled.integrals,
            flow_defaults: values.flow_vars.clone(),
            n_stocks: n_stocks.max(1),
            slots: named_slots(&values),
        };
        values.flow_vars = system.flows(self.t, &values.stock_vars);

        log::debug!(
            "compiled {} instructions, {} integrals, {} stocks, {} flow slots",
            system.ops.len(),
            system.integrals.len(),
            n_stocks,
            system.flow_len()
        );
        self.values = values;
        self.system = Some(system);
        self.plots = compiled.plots;
        self.dirty = false;
        // stocks were reinitialised; stepping needs a fresh integrator
        self.integrator = None;
        self.state = SimState::Uninitialized;
        Ok(())
    }

    /// Recompiles, rewinds time to zero and selects the stepper.
    pub fn reset(&mut self) -> SimResult<()> {
        self.config.validate()?;
        let t = self.t;
        self.t = 0.0;
        if let Err(e) = self.construct_equations() {
            self.t = t;
            return Err(e);
        }
        let dim = self.values.stock_vars.len();
        let c = &self.config;
        let integrator = if c.order == 1 && !c.implicit {
            Integrator::Euler(ExplicitEuler::new(dim))
        } else {
            let stepper = Stepper::adaptive(c.order, c.implicit, dim)?;
            Integrator::Adaptive(AdaptiveDriver::new(
                stepper, dim, c.step_min, c.step_max, c.eps_abs, c.eps_rel,
            ))
        };
        log::info!(
            "reset: {} stepper on {} stocks, step_max={}",
            integrator.name(),
            dim,
            c.step_max
        );
        self.integrator = Some(integrator);
        self.state = SimState::Ready;
        self.log_header();
        Ok(())
    }

    /// Advances the simulation by `n_steps` steps. On error time and
    /// stocks keep their pre-step values.
    pub fn step(&mut self) -> SimResult<DriverOutcome> {
        if self.dirty || self.system.is_none() || self.integrator.is_none() {
            self.reset()?;
        }
        if self.state == SimState::Failed {
            log::info!("retrying after failed step at t={}", self.t);
        }
        self.state = SimState::Stepping;
        match self.advance() {
            Ok((t, stocks, flows, outcome)) => {
                self.t = t;
                self.values.stock_vars = stocks;
                self.values.flow_vars = flows;
                self.state = SimState::Ready;
                self.log_values();
                Ok(outcome)
            }
            Err(e) => {
                log::warn!("step failed at t={}: {e}", self.t);
                self.state = SimState::Failed;
                if let Some(Integrator::Adaptive(driver)) = self.integrator.as_mut() {
                    driver.reset();
                }
                Err(e)
            }
        }
    }

    fn advance(&mut self) -> SimResult<(f64, Vec<f64>, Vec<f64>, DriverOutcome)> {
        let (Some(system), Some(integrator)) = (self.system.as_ref(), self.integrator.as_mut())
        else {
            return Err(StructuralError::InvalidConfig("simulation not reset".into()).into());
        };
        let mut t = self.t;
        let mut stocks = self.values.stock_vars.clone();
        let outcome = match integrator {
            Integrator::Euler(euler) => {
                let mut err = vec![0.0; stocks.len()];
                for _ in 0..self.config.n_steps {
                    euler.step(system, t, &mut stocks, self.config.step_max, &mut err)?;
                    t += self.config.step_max;
                }
                DriverOutcome::Completed
            }
            Integrator::Adaptive(driver) => {
                driver.apply(system, &mut t, f64::MAX, &mut stocks, self.config.n_steps)?
            }
        };
        let flows = system.flows(t, &stocks);
        if let Some((name, item)) = first_non_finite(&system.slots, &system.ops, &stocks, &flows) {
            return Err(NumericError::NonFinite { name, item }.into());
        }
        Ok((t, stocks, flows, outcome))
    }

    /// Evaluates stock derivatives at an arbitrary state.
    pub fn eval_equations(&mut self, result: &mut [f64], t: f64, state: &[f64]) -> SimResult<()> {
        self.compiled()?.apply(t, state, result)
    }

    pub fn jacobian(&mut self, t: f64, state: &[f64]) -> SimResult<DMatrix<f64>> {
        self.compiled()?.jacobian(t, state)
    }

    fn compiled(&mut self) -> SimResult<&EquationSystem> {
        if self.dirty || self.system.is_none() {
            self.construct_equations()?;
        }
        self.system
            .as_ref()
            .ok_or_else(|| StructuralError::InvalidConfig("no compiled equations".into()).into())
    }

    /// Name of the first variable, then operation, holding a non-finite
    /// value. Empty when everything is finite.
    pub fn diagnose_non_finite(&self) -> String {
        let ops = self.system.as_ref().map_or(&[][..], |s| s.ops.as_slice());
        first_non_finite(
            &named_slots(&self.values),
            ops,
            &self.values.stock_vars,
            &self.values.flow_vars,
        )
        .map(|(name, _)| name)
        .unwrap_or_default()
    }

    fn log_header(&mut self) {
        let Some(sink) = self.log_sink.as_mut() else {
            return;
        };
        let mut line = String::from("#time");
        for (id, _) in self.values.iter() {
            if !VariableValues::is_protected(id) {
                line.push(' ');
                line.push_str(id);
            }
        }
        if let Err(e) = writeln!(sink, "{line}") {
            log::warn!("simulation log write failed: {e}");
        }
    }

    fn log_values(&mut self) {
        let Some(sink) = self.log_sink.as_mut() else {
            return;
        };
        let mut line = self.t.to_string();
        for (id, _) in self.values.iter() {
            if !VariableValues::is_protected(id) {
                let v = self.values.value(id).unwrap_or(f64::NAN);
                line.push(' ');
                line.push_str(&v.to_string());
            }
        }
        if let Err(e) = writeln!(sink, "{line}") {
            log::warn!("simulation log write failed: {e}");
        }
    }
}

/// First named value, then instruction output, that is not finite.
fn first_non_finite(
    slots: &[NamedSlot],
    ops: &[EvalOp],
    stocks: &[f64],
    flows: &[f64],
) -> Option<(String, Option<ItemId>)> {
    for slot in slots {
        let array = if slot.stock { stocks } else { flows };
        if array.get(slot.idx).is_some_and(|x| !x.is_finite()) {
            return Some((slot.id.clone(), None));
        }
    }
    ops.iter()
        .find(|op| flows.get(op.out).is_some_and(|x| !x.is_finite()))
        .map(|op| (op.op.operation().type_name().to_string(), op.item))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OperationType;
    use approx::assert_relative_eq;
    use std::sync::{Arc, Mutex};

    /// dx/dt = -x with x(0) = 1.
    fn decay() -> (Model, ItemId) {
        let mut m = Model::new();
        let int = m.add_integral(Model::ROOT, "x").unwrap();
        m.set_init(int, "1").unwrap();
        let k = m.add_constant(Model::ROOT, -1.0).unwrap();
        let mul = m.add_operation(Model::ROOT, OperationType::Multiply).unwrap();
        m.connect(int, mul, 0).unwrap();
        m.connect(k, mul, 1).unwrap();
        m.connect(mul, int, 0).unwrap();
        (m, int)
    }

    #[test]
    fn config_validation() {
        let mut c = SimulationConfig::default();
        assert!(c.validate().is_ok());
        c.order = 3;
        assert_eq!(c.validate(), Err(StructuralError::UnsupportedOrder(3).into()));
        c.order = 2;
        c.step_min = 1.0;
        assert!(matches!(
            c.validate(),
            Err(crate::error::SimError::Structural(StructuralError::InvalidConfig(_)))
        ));
    }

    #[test]
    fn euler_steps_at_step_max() {
        let (m, _) = decay();
        let config = SimulationConfig {
            order: 1,
            n_steps: 10,
            step_max: 0.1,
            ..Default::default()
        };
        let mut sim = Simulation::with_config(m, config);
        sim.step().unwrap();
        assert_relative_eq!(sim.t(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(sim.value(":x").unwrap(), 0.9f64.powi(10), epsilon = 1e-12);
    }

    #[test]
    fn adaptive_decay_matches_exponential() {
        let (m, _) = decay();
        let config = SimulationConfig {
            n_steps: 100,
            eps_abs: 1e-9,
            eps_rel: 1e-9,
            ..Default::default()
        };
        let mut sim = Simulation::with_config(m, config);
        assert_eq!(sim.step().unwrap(), DriverOutcome::MaxStepsReached);
        assert_relative_eq!(sim.t(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(sim.value(":x").unwrap(), (-1.0f64).exp(), max_relative = 1e-7);
    }

    #[test]
    fn jacobian_is_exact() {
        let (m, _) = decay();
        let mut sim = Simulation::new(m);
        let j = sim.jacobian(0.0, &[3.0]).unwrap();
        assert_eq!(j[(0, 0)], -1.0);
        let mut out = [0.0];
        sim.eval_equations(&mut out, 0.0, &[3.0]).unwrap();
        assert_eq!(out, [-3.0]);
    }

    #[test]
    fn model_without_stocks_gets_a_dummy() {
        let mut m = Model::new();
        let t = m.add_operation(Model::ROOT, OperationType::Time).unwrap();
        let y = m.add_variable(Model::ROOT, "y", VariableType::Flow).unwrap();
        m.connect(t, y, 0).unwrap();
        let mut sim = Simulation::new(m);
        sim.reset().unwrap();
        assert_eq!(sim.system().unwrap().dimension(), 1);
        sim.step().unwrap();
        assert_relative_eq!(sim.value(":y").unwrap(), sim.t());
    }

    #[test]
    fn non_finite_fails_and_keeps_state() {
        // dx/dt = sqrt(t - 1)
        let mut m = Model::new();
        let int = m.add_integral(Model::ROOT, "x").unwrap();
        let t = m.add_operation(Model::ROOT, OperationType::Time).unwrap();
        let k = m.add_constant(Model::ROOT, -1.0).unwrap();
        let add = m.add_operation(Model::ROOT, OperationType::Add).unwrap();
        let sq = m.add_operation(Model::ROOT, OperationType::Sqrt).unwrap();
        m.connect(t, add, 0).unwrap();
        m.connect(k, add, 1).unwrap();
        m.connect(add, sq, 0).unwrap();
        m.connect(sq, int, 0).unwrap();
        let config = SimulationConfig {
            order: 1,
            ..Default::default()
        };
        let mut sim = Simulation::with_config(m, config);
        let err = sim.step().unwrap_err();
        assert_eq!(
            err,
            NumericError::NonFinite {
                name: "sqrt".into(),
                item: Some(sq)
            }
            .into()
        );
        assert_eq!(err.item(), Some(sq));
        assert_eq!(sim.state(), SimState::Failed);
        assert_eq!(sim.t(), 0.0);
        assert_eq!(sim.value(":x"), Some(0.0));
        // the primed flows already hold sqrt(-1)
        assert_eq!(sim.diagnose_non_finite(), "sqrt");
    }

    #[test]
    fn unsupported_order_leaves_state_untouched() {
        let (m, _) = decay();
        let mut sim = Simulation::new(m);
        sim.step().unwrap();
        let t = sim.t();
        sim.set_config(SimulationConfig {
            order: 3,
            ..Default::default()
        });
        assert_eq!(sim.reset(), Err(StructuralError::UnsupportedOrder(3).into()));
        assert_eq!(sim.t(), t);
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn log_sink_gets_header_and_lines() {
        let (m, _) = decay();
        let buf = SharedBuf::default();
        let mut sim = Simulation::new(m);
        sim.set_log_sink(Some(Box::new(buf.clone())));
        sim.step().unwrap();
        sim.step().unwrap();
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("#time"));
        assert!(lines[0].contains(":x"));
    }
}
