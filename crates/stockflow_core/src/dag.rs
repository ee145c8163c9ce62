//! Expression DAG built from the wiring diagram, symbolic time derivatives
//! over it, and its linearization into an instruction list.
//!
//! Operation nodes are hash-consed, so an icon feeding several consumers,
//! or a subexpression reappearing inside a derivative, is computed once.
//! Variables are leaves; a flow variable's wired definition is looked up
//! separately and compiled into the variable's own slot.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{SimResult, StructuralError};
use crate::eval_op::{EvalOp, OpCode, Operand};
use crate::graph::{FlowCoef, ItemId, ItemKind, Model, OperationType};
use crate::variable::{VariableType, VariableValues, ONE, ZERO};

pub type NodeRef = usize;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Constant(f64),
    Time,
    Variable {
        value_id: String,
        ty: VariableType,
    },
    /// `args[port]` lists the nodes wired into each input port.
    Operation {
        op: OperationType,
        args: Vec<Vec<NodeRef>>,
        item: Option<ItemId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Constant(u64),
    Time,
    Variable(String),
    Operation(OperationType, Vec<Vec<NodeRef>>),
}

/// Name of the time derivative of `name`: `x` gives `dx/dt`, `dx/dt`
/// gives `d^{2}x/dt^{2}` and so on. Anything else is wrapped as a plain
/// identifier.
pub fn differentiate_name(name: &str) -> String {
    if let Some(inner) = name
        .strip_prefix('d')
        .and_then(|s| s.strip_suffix("/dt"))
        .filter(|s| !s.is_empty())
    {
        return format!("d^{{2}}{inner}/dt^{{2}}");
    }
    if let Some((order, inner)) = higher_order(name) {
        let order = order + 1;
        return format!("d^{{{order}}}{inner}/dt^{{{order}}}");
    }
    format!("d{name}/dt")
}

/// Parses `d^{n}x/dt^{n}` with matching orders.
fn higher_order(name: &str) -> Option<(u32, &str)> {
    let rest = name.strip_prefix("d^{")?;
    let close = rest.find('}')?;
    let order: u32 = rest[..close].parse().ok()?;
    let suffix = format!("/dt^{{{order}}}");
    let inner = rest[close + 1..].strip_suffix(suffix.as_str())?;
    (!inner.is_empty()).then_some((order, inner))
}

/// A stock paired with the slot whose value is its time derivative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Integral {
    pub stock: usize,
    pub input: Operand,
    pub item: ItemId,
}

/// Slots feeding each input port of a plot, refreshed on every compile.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotBinding {
    pub plot: ItemId,
    pub inputs: Vec<Option<Operand>>,
}

#[derive(Debug, Clone, Default)]
pub struct Compiled {
    pub ops: Vec<EvalOp>,
    pub integrals: Vec<Integral>,
    pub plots: Vec<PlotBinding>,
}

#[derive(Debug, Clone)]
struct VarInfo {
    ty: VariableType,
    init: String,
}

pub struct SystemOfEquations<'a> {
    model: &'a Model,
    nodes: Vec<Node>,
    keys: HashMap<Key, NodeRef>,
    zero: NodeRef,
    one: NodeRef,
    vars: BTreeMap<String, VarInfo>,
    /// value id -> (source item, defining icon)
    definitions: BTreeMap<String, (ItemId, ItemId)>,
    /// stock value id -> (source item, integral item)
    integral_sources: BTreeMap<String, (ItemId, ItemId)>,
    /// stock value id -> signed flows, from the first table defining it
    godley_stocks: BTreeMap<String, Vec<(String, f64)>>,
    item_nodes: BTreeMap<ItemId, NodeRef>,
    in_progress: BTreeSet<ItemId>,
    derivatives: HashMap<NodeRef, NodeRef>,
    plots: Vec<(ItemId, Vec<Option<NodeRef>>)>,
}

impl<'a> SystemOfEquations<'a> {
    /// Builds the DAG. The model is expected to have passed the cycle check.
    pub fn new(model: &'a Model) -> SimResult<Self> {
        let mut system = Self {
            model,
            nodes: Vec::new(),
            keys: HashMap::new(),
            zero: 0,
            one: 0,
            vars: BTreeMap::new(),
            definitions: BTreeMap::new(),
            integral_sources: BTreeMap::new(),
            godley_stocks: BTreeMap::new(),
            item_nodes: BTreeMap::new(),
            in_progress: BTreeSet::new(),
            derivatives: HashMap::new(),
            plots: Vec::new(),
        };
        system.zero = system.variable(ZERO, VariableType::Constant);
        system.one = system.variable(ONE, VariableType::Constant);
        system.collect_variables()?;

        let integrals: Vec<String> = system.integral_sources.keys().cloned().collect();
        for stock in integrals {
            system.integral_input(&stock)?;
        }
        let defined: Vec<String> = system.definitions.keys().cloned().collect();
        for id in defined {
            system.definition(&id)?;
        }
        for id in model.all_items() {
            let Some(item) = model.item(id) else { continue };
            if let ItemKind::Plot(_) = item.kind {
                let mut inputs = Vec::new();
                for port in 0..item.inputs.len() {
                    let node = match model.input_sources(id, port).first() {
                        Some(&src) => Some(system.item_node(src)?),
                        None => None,
                    };
                    inputs.push(node);
                }
                system.plots.push((id, inputs));
            }
        }
        Ok(system)
    }

    fn collect_variables(&mut self) -> SimResult<()> {
        let model = self.model;
        for id in model.all_items() {
            let Some(item) = model.item(id) else { continue };
            match &item.kind {
                ItemKind::Variable(v) => {
                    let vid = model.value_id_from(id, &v.name);
                    self.note_var(&vid, v.ty, &v.init);
                    if v.ty.lhs() {
                        if let Some(&src) = model.input_sources(id, 0).first() {
                            if self.definitions.insert(vid.clone(), (src, id)).is_some() {
                                return Err(StructuralError::MultipleDefinitions(vid).into());
                            }
                        }
                    }
                }
                ItemKind::Integral(i) => {
                    let vid = model.value_id_from(id, &i.stock_name);
                    self.note_var(&vid, VariableType::Integral, &i.init);
                    let Some(&src) = model.input_sources(id, 0).first() else {
                        return Err(StructuralError::UnwiredIntegral { item: id }.into());
                    };
                    if self.integral_sources.insert(vid.clone(), (src, id)).is_some() {
                        return Err(StructuralError::MultipleDefinitions(vid).into());
                    }
                }
                ItemKind::Godley(icon) => {
                    let table = &icon.table;
                    for (col, name) in table.column_variables() {
                        let vid = model.value_id_from(id, &name);
                        if self.godley_stocks.contains_key(&vid) {
                            continue;
                        }
                        let sign = if table.sign_convention_reversed(col) {
                            -1.0
                        } else {
                            1.0
                        };
                        let flows = (1..table.rows())
                            .filter(|&row| !table.initial_condition_row(row))
                            .map(|row| FlowCoef::parse(table.cell(row, col)))
                            .filter(|fc| !fc.name.is_empty() && fc.coef != 0.0)
                            .map(|fc| (model.value_id_from(id, &fc.name), sign * fc.coef))
                            .collect();
                        self.godley_stocks.insert(vid, flows);
                    }
                }
                ItemKind::Operation(_) | ItemKind::Plot(_) => {}
            }
        }

        for (vid, info) in &self.vars {
            let integral = self.integral_sources.contains_key(vid);
            let godley = self.godley_stocks.contains_key(vid);
            if (integral && godley)
                || (info.ty.is_stock() && self.definitions.contains_key(vid))
            {
                return Err(StructuralError::MultipleDefinitions(vid.clone()).into());
            }
            if info.ty == VariableType::Integral && !integral {
                return Err(StructuralError::UndefinedIntegral(vid.clone()).into());
            }
        }
        Ok(())
    }

    fn note_var(&mut self, vid: &str, ty: VariableType, init: &str) {
        let info = self.vars.entry(vid.to_string()).or_insert(VarInfo {
            ty,
            init: String::new(),
        });
        info.ty = info.ty.merge(ty);
        if info.init.is_empty() {
            info.init = init.trim().to_string();
        }
    }

    /// Every live value id with its merged type and initial value.
    pub fn variables(&self) -> impl Iterator<Item = (&str, VariableType, &str)> {
        self.vars
            .iter()
            .map(|(id, info)| (id.as_str(), info.ty, info.init.as_str()))
    }

    pub fn live_ids(&self) -> BTreeSet<String> {
        self.vars.keys().cloned().collect()
    }

    pub fn node(&self, n: NodeRef) -> Option<&Node> {
        self.nodes.get(n)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    // ---- node construction ----

    fn intern(&mut self, key: Key, node: Node) -> NodeRef {
        if let Some(&n) = self.keys.get(&key) {
            return n;
        }
        self.nodes.push(node);
        let n = self.nodes.len() - 1;
        self.keys.insert(key, n);
        n
    }

    fn variable(&mut self, id: &str, ty: VariableType) -> NodeRef {
        self.intern(
            Key::Variable(id.to_string()),
            Node::Variable {
                value_id: id.to_string(),
                ty,
            },
        )
    }

    fn var_node(&mut self, id: &str) -> NodeRef {
        let ty = self.vars.get(id).map(|v| v.ty).unwrap_or_default();
        self.variable(id, ty)
    }

    fn constant(&mut self, c: f64) -> NodeRef {
        if c == 0.0 {
            self.zero
        } else if c == 1.0 {
            self.one
        } else {
            self.intern(Key::Constant(c.to_bits()), Node::Constant(c))
        }
    }

    fn time(&mut self) -> NodeRef {
        self.intern(Key::Time, Node::Time)
    }

    fn operation(&mut self, op: OperationType, args: Vec<Vec<NodeRef>>, item: Option<ItemId>) -> NodeRef {
        self.intern(
            Key::Operation(op, args.clone()),
            Node::Operation { op, args, item },
        )
    }

    fn func(&mut self, op: OperationType, a: NodeRef) -> NodeRef {
        self.operation(op, vec![vec![a]], None)
    }

    fn add(&mut self, a: NodeRef, b: NodeRef) -> NodeRef {
        if a == self.zero {
            b
        } else if b == self.zero {
            a
        } else {
            self.operation(OperationType::Add, vec![vec![a], vec![b]], None)
        }
    }

    fn sub(&mut self, a: NodeRef, b: NodeRef) -> NodeRef {
        if b == self.zero {
            a
        } else if a == b {
            self.zero
        } else {
            self.operation(OperationType::Subtract, vec![vec![a], vec![b]], None)
        }
    }

    fn mul(&mut self, a: NodeRef, b: NodeRef) -> NodeRef {
        if a == self.zero || b == self.zero {
            self.zero
        } else if a == self.one {
            b
        } else if b == self.one {
            a
        } else {
            self.operation(OperationType::Multiply, vec![vec![a], vec![b]], None)
        }
    }

    fn div(&mut self, a: NodeRef, b: NodeRef) -> NodeRef {
        if a == self.zero {
            self.zero
        } else if b == self.one {
            a
        } else {
            self.operation(OperationType::Divide, vec![vec![a], vec![b]], None)
        }
    }

    fn neg(&mut self, a: NodeRef) -> NodeRef {
        let zero = self.zero;
        self.sub(zero, a)
    }

    fn product(&mut self, factors: &[NodeRef]) -> NodeRef {
        let mut acc = self.one;
        for &f in factors {
            acc = self.mul(acc, f);
        }
        acc
    }

    // ---- graph to DAG ----

    fn single_input(&mut self, item: ItemId, op: OperationType, port: usize) -> SimResult<NodeRef> {
        match self.model.input_sources(item, port).first() {
            Some(&src) => self.item_node(src),
            None => Err(StructuralError::UnwiredInput { item, op, port }.into()),
        }
    }

    fn port_inputs(&mut self, item: ItemId, port: usize) -> SimResult<Vec<NodeRef>> {
        self.model
            .input_sources(item, port)
            .into_iter()
            .map(|src| self.item_node(src))
            .collect()
    }

    /// The node computing an item's output.
    fn item_node(&mut self, id: ItemId) -> SimResult<NodeRef> {
        if let Some(&n) = self.item_nodes.get(&id) {
            return Ok(n);
        }
        if !self.in_progress.insert(id) {
            return Err(StructuralError::Cycle { item: Some(id) }.into());
        }
        let model = self.model;
        let item = model.try_item(id)?;
        let node = match &item.kind {
            ItemKind::Operation(o) => match o.op {
                OperationType::Constant => self.constant(o.value),
                OperationType::Time => self.time(),
                OperationType::Copy => self.single_input(id, o.op, 0)?,
                OperationType::Differentiate => {
                    let x = self.single_input(id, o.op, 0)?;
                    self.derivative(x).map_err(|e| match e {
                        crate::error::SimError::Structural(StructuralError::NotDifferentiable {
                            op,
                            item: None,
                        }) => StructuralError::NotDifferentiable { op, item: Some(id) }.into(),
                        e => e,
                    })?
                }
                OperationType::Integrate => {
                    return Err(StructuralError::UnwiredIntegral { item: id }.into())
                }
                op if op.multi_wire() => {
                    let lhs = self.port_inputs(id, 0)?;
                    let rhs = self.port_inputs(id, 1)?;
                    self.operation(op, vec![lhs, rhs], Some(id))
                }
                op => {
                    let mut args = Vec::with_capacity(op.num_args());
                    for port in 0..op.num_args() {
                        args.push(vec![self.single_input(id, op, port)?]);
                    }
                    self.operation(op, args, Some(id))
                }
            },
            ItemKind::Variable(_) | ItemKind::Integral(_) => {
                let vid = model.value_id(id).unwrap_or_default();
                self.var_node(&vid)
            }
            ItemKind::Godley(_) | ItemKind::Plot(_) => {
                return Err(StructuralError::InvalidWire(format!("item {id} has no output")).into())
            }
        };
        self.in_progress.remove(&id);
        self.item_nodes.insert(id, node);
        Ok(node)
    }

    fn definition(&mut self, id: &str) -> SimResult<Option<NodeRef>> {
        match self.definitions.get(id).copied() {
            Some((src, _)) => self.item_node(src).map(Some),
            None => Ok(None),
        }
    }

    fn integral_input(&mut self, stock: &str) -> SimResult<Option<NodeRef>> {
        match self.integral_sources.get(stock).copied() {
            Some((src, _)) => self.item_node(src).map(Some),
            None => Ok(None),
        }
    }

    // ---- symbolic differentiation ----

    /// d/dt of node `n`.
    pub fn derivative(&mut self, n: NodeRef) -> SimResult<NodeRef> {
        if let Some(&d) = self.derivatives.get(&n) {
            return Ok(d);
        }
        let node = self.nodes.get(n).cloned().ok_or_else(|| {
            StructuralError::InvalidWire(format!("dangling expression node {n}"))
        })?;
        let d = match node {
            Node::Constant(_) => self.zero,
            Node::Time => self.one,
            Node::Variable { value_id, ty } => self.variable_derivative(&value_id, ty)?,
            Node::Operation { op, args, item } => self.operation_derivative(n, op, &args, item)?,
        };
        self.derivatives.insert(n, d);
        Ok(d)
    }

    fn variable_derivative(&mut self, id: &str, ty: VariableType) -> SimResult<NodeRef> {
        if ty == VariableType::Integral {
            return Ok(self.integral_input(id)?.unwrap_or(self.zero));
        }
        if let Some(flows) = self.godley_stocks.get(id).cloned() {
            let mut acc = self.zero;
            for (flow, coef) in flows {
                let f = self.var_node(&flow);
                let c = self.constant(coef);
                let term = self.mul(c, f);
                acc = self.add(acc, term);
            }
            return Ok(acc);
        }
        match self.definition(id)? {
            Some(def) => self.derivative(def),
            None => Ok(self.zero),
        }
    }

    /// d/dt of a product, by the product rule over all factors.
    fn product_derivative(&mut self, factors: &[NodeRef]) -> SimResult<NodeRef> {
        let mut acc = self.zero;
        for i in 0..factors.len() {
            let df = self.derivative(factors[i])?;
            if df == self.zero {
                continue;
            }
            let others: Vec<NodeRef> = factors
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, &f)| f)
                .collect();
            let rest = self.product(&others);
            let term = self.mul(df, rest);
            acc = self.add(acc, term);
        }
        Ok(acc)
    }

    fn sum_derivative(&mut self, terms: &[NodeRef]) -> SimResult<NodeRef> {
        let mut acc = self.zero;
        for &t in terms {
            let d = self.derivative(t)?;
            acc = self.add(acc, d);
        }
        Ok(acc)
    }

    fn operation_derivative(
        &mut self,
        n: NodeRef,
        op: OperationType,
        args: &[Vec<NodeRef>],
        item: Option<ItemId>,
    ) -> SimResult<NodeRef> {
        use OperationType as O;
        if !op.differentiable() {
            return Err(StructuralError::NotDifferentiable { op, item }.into());
        }
        let port = |i: usize| args.get(i).cloned().unwrap_or_default();
        let first = |i: usize| -> SimResult<NodeRef> {
            args.get(i)
                .and_then(|p| p.first().copied())
                .ok_or_else(|| StructuralError::NotDifferentiable { op, item }.into())
        };
        Ok(match op {
            O::Add => {
                let all: Vec<NodeRef> = args.iter().flatten().copied().collect();
                self.sum_derivative(&all)?
            }
            O::Subtract => {
                let a = self.sum_derivative(&port(0))?;
                let b = self.sum_derivative(&port(1))?;
                self.sub(a, b)
            }
            O::Multiply => {
                let all: Vec<NodeRef> = args.iter().flatten().copied().collect();
                self.product_derivative(&all)?
            }
            O::Divide => {
                let (num, den) = (port(0), port(1));
                let dn = self.product_derivative(&num)?;
                let dd = self.product_derivative(&den)?;
                let n_ = self.product(&num);
                let d_ = self.product(&den);
                let a = self.mul(dn, d_);
                let b = self.mul(n_, dd);
                let top = self.sub(a, b);
                let bottom = self.mul(d_, d_);
                self.div(top, bottom)
            }
            O::Pow => {
                let (x, y) = (first(0)?, first(1)?);
                let (dx, dy) = (self.derivative(x)?, self.derivative(y)?);
                // y x^(y-1) dx + x^y ln(x) dy
                let mut acc = self.zero;
                if dx != self.zero {
                    let one = self.one;
                    let ym1 = self.sub(y, one);
                    let p = self.operation(O::Pow, vec![vec![x], vec![ym1]], None);
                    let yp = self.mul(y, p);
                    acc = self.mul(yp, dx);
                }
                if dy != self.zero {
                    let lnx = self.func(O::Ln, x);
                    let t = self.mul(n, lnx);
                    let t = self.mul(t, dy);
                    acc = self.add(acc, t);
                }
                acc
            }
            O::Log => {
                // d(ln x / ln b) = (dx/x - (ln x/ln b) db/b) / ln b
                let (x, b) = (first(0)?, first(1)?);
                let (dx, db) = (self.derivative(x)?, self.derivative(b)?);
                let dx_x = self.div(dx, x);
                let db_b = self.div(db, b);
                let t = self.mul(n, db_b);
                let top = self.sub(dx_x, t);
                let lnb = self.func(O::Ln, b);
                self.div(top, lnb)
            }
            O::Sqrt
            | O::Exp
            | O::Ln
            | O::Sin
            | O::Cos
            | O::Tan
            | O::Asin
            | O::Acos
            | O::Atan
            | O::Sinh
            | O::Cosh
            | O::Tanh
            | O::Abs => {
                let x = first(0)?;
                let dx = self.derivative(x)?;
                if dx == self.zero {
                    return Ok(self.zero);
                }
                let fprime = self.function_derivative(op, x, n);
                self.mul(fprime, dx)
            }
            O::Floor | O::Frac | O::Constant | O::Time | O::Copy | O::Integrate | O::Differentiate => {
                return Err(StructuralError::NotDifferentiable { op, item }.into())
            }
        })
    }

    /// f'(x) for a unary function, where `fx` is the node computing f(x).
    fn function_derivative(&mut self, op: OperationType, x: NodeRef, fx: NodeRef) -> NodeRef {
        use OperationType as O;
        let one = self.one;
        match op {
            O::Sqrt => {
                let half = self.constant(0.5);
                self.div(half, fx)
            }
            O::Exp => fx,
            O::Ln => self.div(one, x),
            O::Sin => self.func(O::Cos, x),
            O::Cos => {
                let s = self.func(O::Sin, x);
                self.neg(s)
            }
            O::Tan => {
                let sq = self.mul(fx, fx);
                self.add(one, sq)
            }
            O::Asin | O::Acos => {
                let sq = self.mul(x, x);
                let d = self.sub(one, sq);
                let root = self.func(O::Sqrt, d);
                let r = self.div(one, root);
                if op == O::Acos {
                    self.neg(r)
                } else {
                    r
                }
            }
            O::Atan => {
                let sq = self.mul(x, x);
                let d = self.add(one, sq);
                self.div(one, d)
            }
            O::Sinh => self.func(O::Cosh, x),
            O::Cosh => self.func(O::Sinh, x),
            O::Tanh => {
                let sq = self.mul(fx, fx);
                self.sub(one, sq)
            }
            // sign(x)
            O::Abs => self.div(x, fx),
            _ => self.zero,
        }
    }

    // ---- linearization ----

    /// Emits the instruction list, allocating temporaries in `values`,
    /// whose named slots must already be assigned.
    pub fn linearize(&self, values: &mut VariableValues) -> SimResult<Compiled> {
        let mut lin = Linearizer {
            dag: self,
            values,
            ops: Vec::new(),
            marks: vec![Mark::Unvisited; self.nodes.len()],
            defined: BTreeMap::new(),
        };
        let mut integrals = Vec::new();

        for id in self.definitions.keys() {
            let slot = lin.named_slot(id)?;
            if slot.flow {
                lin.emit_definition(id, slot.idx)?;
            }
        }
        for (stock, &(src, item)) in &self.integral_sources {
            let input = match self.item_nodes.get(&src) {
                Some(&n) => lin.emit(n, None)?,
                None => return Err(StructuralError::UnwiredIntegral { item }.into()),
            };
            let Some(idx) = lin.values.get(stock).and_then(|v| v.idx) else {
                return Err(StructuralError::UnknownVariable(stock.clone()).into());
            };
            integrals.push(Integral {
                stock: idx,
                input,
                item,
            });
        }
        let mut plots = Vec::new();
        for (plot, inputs) in &self.plots {
            let mut bound = Vec::with_capacity(inputs.len());
            for input in inputs {
                bound.push(match input {
                    Some(n) => Some(lin.emit(*n, None)?),
                    None => None,
                });
            }
            plots.push(PlotBinding {
                plot: *plot,
                inputs: bound,
            });
        }
        Ok(Compiled {
            ops: lin.ops,
            integrals,
            plots,
        })
    }

    fn node_item(&self, n: NodeRef) -> Option<ItemId> {
        match self.nodes.get(n)? {
            Node::Operation { item, .. } => *item,
            Node::Variable { value_id, .. } => self.definitions.get(value_id).map(|d| d.1),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done(Operand),
}

struct Linearizer<'s, 'a, 'v> {
    dag: &'s SystemOfEquations<'a>,
    values: &'v mut VariableValues,
    ops: Vec<EvalOp>,
    marks: Vec<Mark>,
    /// Defined flow variables: false while their definition is being emitted.
    defined: BTreeMap<String, bool>,
}

impl Linearizer<'_, '_, '_> {
    fn push(&mut self, op: EvalOp) {
        self.ops.push(op);
    }

    fn out_slot(&mut self, target: Option<usize>) -> usize {
        target.unwrap_or_else(|| self.values.alloc_temp(0.0))
    }

    fn named_slot(&self, id: &str) -> SimResult<Operand> {
        let v = self
            .values
            .get(id)
            .ok_or_else(|| StructuralError::UnknownVariable(id.to_string()))?;
        let idx = v
            .idx
            .ok_or_else(|| StructuralError::UnknownVariable(id.to_string()))?;
        Ok(if v.ty.is_stock() {
            Operand::stock(idx)
        } else {
            Operand::flow(idx)
        })
    }

    /// Compiles the definition of flow variable `id` into its slot.
    fn emit_definition(&mut self, id: &str, slot: usize) -> SimResult<()> {
        match self.defined.get(id) {
            Some(true) => return Ok(()),
            Some(false) => {
                return Err(StructuralError::Cycle {
                    item: self.dag.definitions.get(id).map(|d| d.1),
                }
                .into())
            }
            None => {}
        }
        let Some(&(src, _)) = self.dag.definitions.get(id) else {
            return Ok(());
        };
        let Some(&def) = self.dag.item_nodes.get(&src) else {
            return Ok(());
        };
        self.defined.insert(id.to_string(), false);
        self.emit(def, Some(slot))?;
        self.defined.insert(id.to_string(), true);
        Ok(())
    }

    /// Emits node `n`, returning where its value lives. With a target the
    /// value is also placed in that flow slot.
    fn emit(&mut self, n: NodeRef, target: Option<usize>) -> SimResult<Operand> {
        let own = match self.marks.get(n).copied() {
            Some(Mark::Done(o)) => o,
            Some(Mark::InProgress) => {
                return Err(StructuralError::Cycle {
                    item: self.dag.node_item(n),
                }
                .into())
            }
            Some(Mark::Unvisited) => {
                self.marks[n] = Mark::InProgress;
                let o = self.emit_node(n, target)?;
                self.marks[n] = Mark::Done(o);
                o
            }
            None => {
                return Err(
                    StructuralError::InvalidWire(format!("dangling expression node {n}")).into(),
                )
            }
        };
        match target {
            Some(t) if own != Operand::flow(t) => {
                self.push(EvalOp::new(OpCode::Copy, Some(own), None, t));
                Ok(Operand::flow(t))
            }
            _ => Ok(own),
        }
    }

    fn emit_node(&mut self, n: NodeRef, target: Option<usize>) -> SimResult<Operand> {
        let dag = self.dag;
        match &dag.nodes[n] {
            Node::Constant(c) => {
                let out = self.out_slot(target);
                self.push(EvalOp::new(OpCode::Constant(*c), None, None, out));
                Ok(Operand::flow(out))
            }
            Node::Time => {
                let out = self.out_slot(target);
                self.push(EvalOp::new(OpCode::Time, None, None, out));
                Ok(Operand::flow(out))
            }
            Node::Variable { value_id, .. } => {
                let slot = self.named_slot(value_id)?;
                if slot.flow {
                    self.emit_definition(value_id, slot.idx)?;
                }
                Ok(slot)
            }
            Node::Operation { op, args, item } => {
                let code = OpCode::from_operation(*op, 0.0).ok_or_else(|| {
                    StructuralError::InvalidWire(format!("{op} has no evaluation"))
                })?;
                let result = if op.multi_wire() {
                    let (acc, identity) = match op {
                        OperationType::Add | OperationType::Subtract => (OpCode::Add, ZERO),
                        _ => (OpCode::Multiply, ONE),
                    };
                    let lhs = self.fold(args.first().map_or(&[][..], Vec::as_slice), acc, identity, *item)?;
                    let rhs = self.fold(args.get(1).map_or(&[][..], Vec::as_slice), acc, identity, *item)?;
                    let out = self.out_slot(target);
                    self.push(EvalOp::new(code, Some(lhs), Some(rhs), out).with_item(*item));
                    out
                } else {
                    let mut operands = Vec::with_capacity(2);
                    for port in args.iter().take(2) {
                        let Some(&a) = port.first() else {
                            return Err(StructuralError::UnwiredInput {
                                item: item.unwrap_or(ItemId(0)),
                                op: *op,
                                port: operands.len(),
                            }
                            .into());
                        };
                        operands.push(self.emit(a, None)?);
                    }
                    let out = self.out_slot(target);
                    self.push(
                        EvalOp::new(code, operands.first().copied(), operands.get(1).copied(), out)
                            .with_item(*item),
                    );
                    out
                };
                Ok(Operand::flow(result))
            }
        }
    }

    /// Folds the wires of one multi-wire port with `acc`. An empty port
    /// reads the identity constant.
    fn fold(
        &mut self,
        terms: &[NodeRef],
        acc: OpCode,
        identity: &str,
        item: Option<ItemId>,
    ) -> SimResult<Operand> {
        let Some((&head, rest)) = terms.split_first() else {
            return self.named_slot(identity);
        };
        let mut value = self.emit(head, None)?;
        if rest.is_empty() {
            return Ok(value);
        }
        let tmp = self.values.alloc_temp(0.0);
        for &t in rest {
            let operand = self.emit(t, None)?;
            self.push(EvalOp::new(acc, Some(value), Some(operand), tmp).with_item(item));
            value = Operand::flow(tmp);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivative_names() {
        assert_eq!(differentiate_name("x"), "dx/dt");
        assert_eq!(differentiate_name("dx/dt"), "d^{2}x/dt^{2}");
        assert_eq!(differentiate_name("d^{2}x/dt^{2}"), "d^{3}x/dt^{3}");
        assert_eq!(differentiate_name("d^nx/dt^n"), "dd^nx/dt^n/dt");
        assert_eq!(differentiate_name("d^2x/dt^3"), "dd^2x/dt^3/dt");
        assert_eq!(differentiate_name("d^{2}x/dt^{3}"), "dd^{2}x/dt^{3}/dt");
        assert_eq!(differentiate_name(""), "d/dt");
    }

    fn model_with_time_squared() -> (Model, ItemId) {
        let mut m = Model::new();
        let t = m.add_operation(Model::ROOT, OperationType::Time).unwrap();
        let sq = m.add_operation(Model::ROOT, OperationType::Multiply).unwrap();
        m.connect(t, sq, 0).unwrap();
        m.connect(t, sq, 1).unwrap();
        let y = m.add_variable(Model::ROOT, "y", VariableType::Flow).unwrap();
        m.connect(sq, y, 0).unwrap();
        (m, sq)
    }

    #[test]
    fn product_rule_folds_constants() {
        let (m, sq) = model_with_time_squared();
        let mut dag = SystemOfEquations::new(&m).unwrap();
        let n = dag.item_nodes[&sq];
        let d = dag.derivative(n).unwrap();
        // d(t*t) = 1*t + 1*t, folded to t + t
        let time = dag.keys[&Key::Time];
        assert_eq!(
            dag.node(d),
            Some(&Node::Operation {
                op: OperationType::Add,
                args: vec![vec![time], vec![time]],
                item: None
            })
        );
    }

    #[test]
    fn shared_subexpressions_compile_once() {
        let (mut m, sq) = model_with_time_squared();
        let z = m.add_variable(Model::ROOT, "z", VariableType::Flow).unwrap();
        m.connect(sq, z, 0).unwrap();
        let dag = SystemOfEquations::new(&m).unwrap();
        let mut values = VariableValues::new();
        for (id, ty, init) in dag.variables() {
            values.ensure(id, ty, init);
        }
        values.reset().unwrap();
        let compiled = dag.linearize(&mut values).unwrap();
        let multiplies = compiled
            .ops
            .iter()
            .filter(|op| op.op == OpCode::Multiply)
            .count();
        assert_eq!(multiplies, 1);
        assert!(crate::eval_op::check_equation_order(
            &compiled.ops,
            values.flow_vars.len()
        ));
    }

    #[test]
    fn floor_is_not_differentiable() {
        let mut m = Model::new();
        let t = m.add_operation(Model::ROOT, OperationType::Time).unwrap();
        let fl = m.add_operation(Model::ROOT, OperationType::Floor).unwrap();
        let d = m.add_operation(Model::ROOT, OperationType::Differentiate).unwrap();
        let y = m.add_variable(Model::ROOT, "y", VariableType::Flow).unwrap();
        m.connect(t, fl, 0).unwrap();
        m.connect(fl, d, 0).unwrap();
        m.connect(d, y, 0).unwrap();
        let err = SystemOfEquations::new(&m).err().unwrap();
        assert_eq!(
            err,
            StructuralError::NotDifferentiable {
                op: OperationType::Floor,
                item: Some(fl)
            }
            .into()
        );
    }

    #[test]
    fn aliasing_loop_is_a_cycle() {
        let mut m = Model::new();
        let x1 = m.add_variable(Model::ROOT, "x", VariableType::Flow).unwrap();
        let x2 = m.add_variable(Model::ROOT, "x", VariableType::Flow).unwrap();
        let e = m.add_operation(Model::ROOT, OperationType::Exp).unwrap();
        m.connect(x2, e, 0).unwrap();
        m.connect(e, x1, 0).unwrap();
        let dag = SystemOfEquations::new(&m).unwrap();
        let mut values = VariableValues::new();
        for (id, ty, init) in dag.variables() {
            values.ensure(id, ty, init);
        }
        values.reset().unwrap();
        let err = dag.linearize(&mut values).err().unwrap();
        assert!(matches!(
            err,
            crate::error::SimError::Structural(StructuralError::Cycle { .. })
        ));
    }

    #[test]
    fn double_definition_is_rejected() {
        let mut m = Model::new();
        let c = m.add_constant(Model::ROOT, 1.0).unwrap();
        let x1 = m.add_variable(Model::ROOT, "x", VariableType::Flow).unwrap();
        let x2 = m.add_variable(Model::ROOT, "x", VariableType::Flow).unwrap();
        m.connect(c, x1, 0).unwrap();
        m.connect(c, x2, 0).unwrap();
        assert_eq!(
            SystemOfEquations::new(&m).err(),
            Some(StructuralError::MultipleDefinitions(":x".into()).into())
        );
    }
}
