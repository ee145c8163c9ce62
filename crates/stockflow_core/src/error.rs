use thiserror::Error;

use crate::graph::{ItemId, OperationType};
use crate::variable::VariableType;

/// Errors in the structure of the model or the requested solver setup.
/// These abort a compile or reset before any derived state is touched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StructuralError {
    #[error("cyclic network detected")]
    Cycle { item: Option<ItemId> },
    #[error("integral not wired")]
    UnwiredIntegral { item: ItemId },
    #[error("input {port} of {op} operation is not wired")]
    UnwiredInput {
        item: ItemId,
        op: OperationType,
        port: usize,
    },
    #[error("derivative of {op} is undefined")]
    NotDifferentiable {
        op: OperationType,
        item: Option<ItemId>,
    },
    #[error("no integral defines stock {0}")]
    UndefinedIntegral(String),
    #[error("order {0} solver not supported")]
    UnsupportedOrder(u32),
    #[error("first order explicit solver not available")]
    ExplicitFirstOrder,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("variable {0} doesn't exist")]
    UnknownVariable(String),
    #[error("cannot convert a variable whose input is wired ({0})")]
    ConvertWiredVariable(String),
    #[error("convert_var_type not supported for type={0}")]
    InvalidRetype(VariableType),
    #[error("variable {0} is defined more than once")]
    MultipleDefinitions(String),
    #[error("circular definition of initial value for {0}")]
    CircularInit(String),
    #[error("unknown variable {name} in initial value of {var}")]
    UnknownInitReference { name: String, var: String },
    #[error("more than one duplicated column detected for {0}")]
    DuplicateColumn(String),
    #[error("invalid wire: {0}")]
    InvalidWire(String),
    #[error("item {0:?} does not exist")]
    UnknownItem(ItemId),
    #[error("instruction list reads a slot before it is written")]
    EquationOrder,
}

/// Failures of the numerical machinery while stepping.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NumericError {
    #[error("invalid arithmetic operation detected: {name} is not finite")]
    NonFinite {
        name: String,
        item: Option<ItemId>,
    },
    #[error("step size dropped below step_min={step_min} at t={t}")]
    StepSizeUnderflow { t: f64, step_min: f64 },
    #[error("singular Jacobian in implicit stage solve at t={t}")]
    SingularJacobian { t: f64 },
    #[error("implicit stage iteration failed to converge at t={t}")]
    StageDivergence { t: f64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error(transparent)]
    Numeric(#[from] NumericError),
}

impl SimError {
    /// The item a user interface should highlight, if the error has one.
    pub fn item(&self) -> Option<ItemId> {
        match self {
            SimError::Structural(e) => match e {
                StructuralError::Cycle { item } => *item,
                StructuralError::UnwiredIntegral { item } => Some(*item),
                StructuralError::UnwiredInput { item, .. } => Some(*item),
                StructuralError::NotDifferentiable { item, .. } => *item,
                StructuralError::UnknownItem(item) => Some(*item),
                _ => None,
            },
            SimError::Numeric(NumericError::NonFinite { item, .. }) => *item,
            SimError::Numeric(_) => None,
        }
    }
}

pub type SimResult<T> = Result<T, SimError>;
