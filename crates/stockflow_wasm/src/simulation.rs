//! WASM handle around a core `Simulation`.

use crate::model::{build_model, parse_model};
use js_sys::Float64Array;
use serde::Serialize;
use serde_wasm_bindgen::to_value;
use std::collections::HashMap;
use stockflow_core::{DriverOutcome, ItemId, SimState, Simulation};
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmSimulation {
    pub(crate) sim: Simulation,
    labels: HashMap<String, ItemId>,
}

/// Result of one `step` call.
#[derive(Debug, Serialize)]
pub(crate) struct StepReport {
    pub(crate) t: f64,
    pub(crate) completed: bool,
    pub(crate) state: &'static str,
}

pub(crate) fn state_name(state: SimState) -> &'static str {
    match state {
        SimState::Uninitialized => "uninitialized",
        SimState::Ready => "ready",
        SimState::Stepping => "stepping",
        SimState::Failed => "failed",
    }
}

fn js_err(context: &str, e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&format!("{}: {}", context, e))
}

impl WasmSimulation {
    pub(crate) fn from_json(json: &str) -> anyhow::Result<Self> {
        let built = build_model(&parse_model(json)?)?;
        Ok(Self {
            sim: Simulation::with_config(built.model, built.config),
            labels: built.labels,
        })
    }

    pub(crate) fn step_report(&mut self) -> Result<StepReport, String> {
        let outcome = self.sim.step().map_err(|e| e.to_string())?;
        Ok(StepReport {
            t: self.sim.t(),
            completed: outcome == DriverOutcome::Completed,
            state: state_name(self.sim.state()),
        })
    }

    pub(crate) fn jacobian_rows(&mut self, t: f64, state: &[f64]) -> Result<Vec<f64>, String> {
        let jac = self.sim.jacobian(t, state).map_err(|e| e.to_string())?;
        // row-major for JS consumers
        Ok(jac.transpose().as_slice().to_vec())
    }

    fn label(&self, label: &str) -> Result<ItemId, JsValue> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| JsValue::from_str(&format!("Unknown item '{}'", label)))
    }
}

#[wasm_bindgen]
impl WasmSimulation {
    /// Builds a simulation from a JSON model description.
    #[wasm_bindgen(constructor)]
    pub fn new(model_json: &str) -> Result<WasmSimulation, JsValue> {
        console_error_panic_hook::set_once();
        Self::from_json(model_json).map_err(|e| js_err("Model construction failed", format!("{:#}", e)))
    }

    pub fn reset(&mut self) -> Result<(), JsValue> {
        self.sim.reset().map_err(|e| js_err("Reset failed", e))
    }

    pub fn step(&mut self) -> Result<JsValue, JsValue> {
        let report = self.step_report().map_err(|e| js_err("Step failed", e))?;
        to_value(&report).map_err(|e| js_err("Serialization error", e))
    }

    pub fn set_n_steps(&mut self, n_steps: u32) {
        self.sim.set_n_steps(n_steps as usize);
    }

    pub fn get_t(&self) -> f64 {
        self.sim.t()
    }

    pub fn get_state(&self) -> String {
        state_name(self.sim.state()).to_string()
    }

    /// Current value of a variable, `undefined` when it has none.
    pub fn value(&self, value_id: &str) -> Option<f64> {
        self.sim.value(value_id)
    }

    pub fn set_value(&mut self, value_id: &str, value: f64) -> Result<(), JsValue> {
        self.sim
            .set_value(value_id, value)
            .map_err(|e| js_err("Set value failed", e))
    }

    /// Value id of a labelled variable or integral.
    pub fn value_id(&self, label: &str) -> Result<String, JsValue> {
        let item = self.label(label)?;
        self.sim
            .model()
            .value_id(item)
            .ok_or_else(|| JsValue::from_str(&format!("'{}' carries no value", label)))
    }

    pub fn plot_values(&self, label: &str) -> Result<JsValue, JsValue> {
        let plot = self.label(label)?;
        let values = self
            .sim
            .plot_values(plot)
            .ok_or_else(|| JsValue::from_str(&format!("'{}' is not a compiled plot", label)))?;
        to_value(&values).map_err(|e| js_err("Serialization error", e))
    }

    pub fn get_stocks(&self) -> Float64Array {
        Float64Array::from(self.sim.values().stock_vars.as_slice())
    }

    pub fn diagnose_non_finite(&self) -> String {
        self.sim.diagnose_non_finite()
    }

    pub fn eval_equations(&mut self, t: f64, state: &[f64]) -> Result<Vec<f64>, JsValue> {
        let mut out = vec![0.0; state.len()];
        self.sim
            .eval_equations(&mut out, t, state)
            .map_err(|e| js_err("Evaluation failed", e))?;
        Ok(out)
    }

    /// Jacobian of the stock derivatives, flattened row-major.
    pub fn compute_jacobian(&mut self, t: f64, state: &[f64]) -> Result<Vec<f64>, JsValue> {
        self.jacobian_rows(t, state)
            .map_err(|e| js_err("Jacobian failed", e))
    }
}
