use crate::graph::{ItemId, OperationType};
use crate::traits::Scalar;

/// Instruction opcodes. Each reads at most two slots and writes one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Writes a literal.
    Constant(f64),
    /// Writes the simulation time.
    Time,
    Copy,
    Add,
    Subtract,
    Multiply,
    Divide,
    Pow,
    /// ln(a) / ln(b)
    Log,
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
    /// a - floor(a)
    Frac,
}

impl OpCode {
    /// The opcode evaluating an operation icon, if it evaluates at all.
    pub fn from_operation(op: OperationType, value: f64) -> Option<Self> {
        use OperationType as O;
        Some(match op {
            O::Constant => OpCode::Constant(value),
            O::Time => OpCode::Time,
            O::Copy => OpCode::Copy,
            O::Integrate | O::Differentiate => return None,
            O::Add => OpCode::Add,
            O::Subtract => OpCode::Subtract,
            O::Multiply => OpCode::Multiply,
            O::Divide => OpCode::Divide,
            O::Pow => OpCode::Pow,
            O::Log => OpCode::Log,
            O::Sqrt => OpCode::Sqrt,
            O::Exp => OpCode::Exp,
            O::Ln => OpCode::Ln,
            O::Sin => OpCode::Sin,
            O::Cos => OpCode::Cos,
            O::Tan => OpCode::Tan,
            O::Asin => OpCode::Asin,
            O::Acos => OpCode::Acos,
            O::Atan => OpCode::Atan,
            O::Sinh => OpCode::Sinh,
            O::Cosh => OpCode::Cosh,
            O::Tanh => OpCode::Tanh,
            O::Abs => OpCode::Abs,
            O::Floor => OpCode::Floor,
            O::Frac => OpCode::Frac,
        })
    }

    pub fn operation(self) -> OperationType {
        use OperationType as O;
        match self {
            OpCode::Constant(_) => O::Constant,
            OpCode::Time => O::Time,
            OpCode::Copy => O::Copy,
            OpCode::Add => O::Add,
            OpCode::Subtract => O::Subtract,
            OpCode::Multiply => O::Multiply,
            OpCode::Divide => O::Divide,
            OpCode::Pow => O::Pow,
            OpCode::Log => O::Log,
            OpCode::Sqrt => O::Sqrt,
            OpCode::Exp => O::Exp,
            OpCode::Ln => O::Ln,
            OpCode::Sin => O::Sin,
            OpCode::Cos => O::Cos,
            OpCode::Tan => O::Tan,
            OpCode::Asin => O::Asin,
            OpCode::Acos => O::Acos,
            OpCode::Atan => O::Atan,
            OpCode::Sinh => O::Sinh,
            OpCode::Cosh => O::Cosh,
            OpCode::Tanh => O::Tanh,
            OpCode::Abs => O::Abs,
            OpCode::Floor => O::Floor,
            OpCode::Frac => O::Frac,
        }
    }

    pub fn num_args(self) -> usize {
        match self {
            OpCode::Constant(_) | OpCode::Time => 0,
            OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::Pow
            | OpCode::Log => 2,
            _ => 1,
        }
    }
}

/// A slot reference: the flow array, or the stock array when `flow` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand {
    pub idx: usize,
    pub flow: bool,
}

impl Operand {
    pub fn flow(idx: usize) -> Self {
        Self { idx, flow: true }
    }

    pub fn stock(idx: usize) -> Self {
        Self { idx, flow: false }
    }

    pub fn read<T: Scalar>(self, flow: &[T], stock: &[T]) -> T {
        let array = if self.flow { flow } else { stock };
        array.get(self.idx).copied().unwrap_or_else(T::nan)
    }
}

/// One instruction of the compiled equation list.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOp {
    pub op: OpCode,
    pub in1: Option<Operand>,
    pub in2: Option<Operand>,
    /// Flow slot written.
    pub out: usize,
    /// Icon the instruction was compiled from, for diagnostics.
    pub item: Option<ItemId>,
}

impl EvalOp {
    pub fn new(op: OpCode, in1: Option<Operand>, in2: Option<Operand>, out: usize) -> Self {
        Self {
            op,
            in1,
            in2,
            out,
            item: None,
        }
    }

    pub fn with_item(mut self, item: Option<ItemId>) -> Self {
        self.item = item;
        self
    }

    pub fn eval<T: Scalar>(&self, t: f64, flow: &mut [T], stock: &[T]) {
        let a = self.in1.map_or_else(T::nan, |o| o.read(flow, stock));
        let b = self.in2.map_or_else(T::nan, |o| o.read(flow, stock));
        let r = match self.op {
            OpCode::Constant(v) => T::lift(v),
            OpCode::Time => T::lift(t),
            OpCode::Copy => a,
            OpCode::Add => a + b,
            OpCode::Subtract => a - b,
            OpCode::Multiply => a * b,
            OpCode::Divide => a / b,
            OpCode::Pow => a.powf(b),
            OpCode::Log => a.ln() / b.ln(),
            OpCode::Sqrt => a.sqrt(),
            OpCode::Exp => a.exp(),
            OpCode::Ln => a.ln(),
            OpCode::Sin => a.sin(),
            OpCode::Cos => a.cos(),
            OpCode::Tan => a.tan(),
            OpCode::Asin => a.asin(),
            OpCode::Acos => a.acos(),
            OpCode::Atan => a.atan(),
            OpCode::Sinh => a.sinh(),
            OpCode::Cosh => a.cosh(),
            OpCode::Tanh => a.tanh(),
            OpCode::Abs => a.abs(),
            OpCode::Floor => a.floor(),
            OpCode::Frac => a - a.floor(),
        };
        if let Some(slot) = flow.get_mut(self.out) {
            *slot = r;
        }
    }
}

/// Runs the instruction list in order.
pub fn eval_all<T: Scalar>(ops: &[EvalOp], t: f64, flow: &mut [T], stock: &[T]) {
    for op in ops {
        op.eval(t, flow, stock);
    }
}

/// True when every instruction reads only flow slots that no instruction
/// writes (constants, parameters, unwired defaults) or that an earlier
/// instruction has already written.
pub fn check_equation_order(ops: &[EvalOp], flow_len: usize) -> bool {
    let mut ready = vec![true; flow_len];
    for op in ops {
        match ready.get_mut(op.out) {
            Some(slot) => *slot = false,
            None => return false,
        }
    }
    for op in ops {
        let args = [op.in1, op.in2];
        for arg in args.iter().take(op.op.num_args()) {
            match arg {
                None => return false,
                Some(o) if o.flow && !ready.get(o.idx).copied().unwrap_or(false) => return false,
                Some(_) => {}
            }
        }
        ready[op.out] = true;
    }
    true
}
