use serde::{Deserialize, Serialize};

use super::godley::GodleyIcon;
use super::{GroupId, OperationType, PortId};
use crate::variable::VariableType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationItem {
    pub op: OperationType,
    /// Only meaningful for `constant`.
    #[serde(default)]
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableItem {
    pub name: String,
    pub ty: VariableType,
    /// Initial value expression, e.g. `"10"` or `"2*x"`.
    #[serde(default)]
    pub init: String,
}

/// An integration operator. Its output is the stock named `stock_name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegralItem {
    pub stock_name: String,
    #[serde(default)]
    pub init: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotItem {
    pub title: String,
}

/// Closed set of node variants. Passes over the model match on this
/// rather than dispatching through the item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemKind {
    Operation(OperationItem),
    Variable(VariableItem),
    Integral(IntegralItem),
    Godley(GodleyIcon),
    Plot(PlotItem),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Enclosing group; ownership runs the other way.
    pub group: GroupId,
    pub kind: ItemKind,
    pub output: Option<PortId>,
    pub inputs: Vec<PortId>,
}

impl Item {
    pub fn as_operation(&self) -> Option<&OperationItem> {
        match &self.kind {
            ItemKind::Operation(op) => Some(op),
            _ => None,
        }
    }

    pub fn as_variable(&self) -> Option<&VariableItem> {
        match &self.kind {
            ItemKind::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_integral(&self) -> Option<&IntegralItem> {
        match &self.kind {
            ItemKind::Integral(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_godley(&self) -> Option<&GodleyIcon> {
        match &self.kind {
            ItemKind::Godley(g) => Some(g),
            _ => None,
        }
    }

    /// Items whose output is defined by integration or aggregation
    /// over time rather than by instantaneous substitution of inputs.
    pub fn is_feedback_boundary(&self) -> bool {
        matches!(self.kind, ItemKind::Integral(_) | ItemKind::Godley(_))
    }

    /// Operation type for diagnostics.
    pub fn operation_type(&self) -> Option<OperationType> {
        match &self.kind {
            ItemKind::Operation(op) => Some(op.op),
            ItemKind::Integral(_) => Some(OperationType::Integrate),
            _ => None,
        }
    }
}

/// Input port count for a freshly created item of this kind.
pub(crate) fn input_count(kind: &ItemKind, plot_inputs: usize) -> usize {
    match kind {
        ItemKind::Operation(op) => op.op.num_args(),
        ItemKind::Variable(v) => usize::from(v.ty.lhs()),
        ItemKind::Integral(_) => 1,
        ItemKind::Godley(_) => 0,
        ItemKind::Plot(_) => plot_inputs,
    }
}

pub(crate) fn has_output(kind: &ItemKind) -> bool {
    !matches!(kind, ItemKind::Godley(_) | ItemKind::Plot(_))
}
