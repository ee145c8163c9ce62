//! WASM bridge for `stockflow_core`: models arrive as JSON descriptions,
//! results leave as plain numbers or serialized reports.

pub mod model;
pub mod simulation;

pub use simulation::WasmSimulation;
