use serde::{Deserialize, Serialize};
use std::fmt;

/// Every operation an icon on the canvas can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    // nullary
    Constant,
    Time,
    // unary plumbing
    Copy,
    Integrate,
    Differentiate,
    // binary
    Add,
    Subtract,
    Multiply,
    Divide,
    Pow,
    Log,
    // unary functions
    Sqrt,
    Exp,
    Ln,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Abs,
    Floor,
    Frac,
}

impl OperationType {
    /// The unary functions, in declaration order.
    pub const FUNCTIONS: [OperationType; 15] = [
        OperationType::Sqrt,
        OperationType::Exp,
        OperationType::Ln,
        OperationType::Sin,
        OperationType::Cos,
        OperationType::Tan,
        OperationType::Asin,
        OperationType::Acos,
        OperationType::Atan,
        OperationType::Sinh,
        OperationType::Cosh,
        OperationType::Tanh,
        OperationType::Abs,
        OperationType::Floor,
        OperationType::Frac,
    ];

    /// Number of input ports.
    pub fn num_args(self) -> usize {
        use OperationType::*;
        match self {
            Constant | Time => 0,
            Add | Subtract | Multiply | Divide | Pow | Log => 2,
            _ => 1,
        }
    }

    /// Inputs that fold any number of wires into one argument.
    pub fn multi_wire(self) -> bool {
        use OperationType::*;
        matches!(self, Add | Subtract | Multiply | Divide)
    }

    /// Piecewise constant or discontinuous operations, whose time
    /// derivative is not defined by the chain rule.
    pub fn differentiable(self) -> bool {
        !matches!(self, OperationType::Floor | OperationType::Frac)
    }

    pub fn type_name(self) -> &'static str {
        use OperationType::*;
        match self {
            Constant => "constant",
            Time => "time",
            Copy => "copy",
            Integrate => "integrate",
            Differentiate => "differentiate",
            Add => "add",
            Subtract => "subtract",
            Multiply => "multiply",
            Divide => "divide",
            Pow => "pow",
            Log => "log",
            Sqrt => "sqrt",
            Exp => "exp",
            Ln => "ln",
            Sin => "sin",
            Cos => "cos",
            Tan => "tan",
            Asin => "asin",
            Acos => "acos",
            Atan => "atan",
            Sinh => "sinh",
            Cosh => "cosh",
            Tanh => "tanh",
            Abs => "abs",
            Floor => "floor",
            Frac => "frac",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}
