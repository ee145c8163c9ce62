//! The `stockflow_core` crate compiles stock-flow wiring diagrams into
//! ordered instruction lists and integrates the resulting ODEs.
//!
//! Key components:
//! - **Graph**: `Model` (items, ports, wires, groups) and accounting tables.
//! - **Cycle detection**: rejects algebraic loops not broken by an integral.
//! - **DAG**: hash-consed expressions, symbolic time derivatives, linearization.
//! - **Evaluator**: `EvalOp` list run over `f64` or `Dual` for exact Jacobians.
//! - **Simulation**: value store, stepper selection and the step state machine.
pub mod autodiff;
pub mod cycle;
pub mod dag;
pub mod error;
pub mod eval_op;
pub mod godley_eval;
pub mod graph;
pub mod simulation;
pub mod solvers;
pub mod traits;
pub mod variable;

pub use cycle::{cycle_check, find_cycle};
pub use dag::{differentiate_name, Compiled, SystemOfEquations};
pub use error::{NumericError, SimError, SimResult, StructuralError};
pub use graph::{AssetClass, GodleyTable, GroupId, ItemId, ItemKind, Model, OperationType, PortId, WireId};
pub use simulation::{EquationSystem, SimState, Simulation, SimulationConfig};
pub use solvers::DriverOutcome;
pub use variable::{VariableType, VariableValues};
