//! Value ids and the store mapping them to slots in the flat flow and
//! stock arrays.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{SimResult, StructuralError};
use crate::graph::{FlowCoef, GroupId};

/// Always present; the compiler folds derivatives onto these.
pub const ZERO: &str = "constant:zero";
pub const ONE: &str = "constant:one";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    #[default]
    Undefined,
    Constant,
    Parameter,
    Flow,
    /// Stock owned by an integral.
    Integral,
    /// Stock owned by an accounting table.
    Stock,
    /// Compiler temporary.
    TempFlow,
}

impl VariableType {
    /// Whether icons of this type take an input wire defining them.
    pub fn lhs(self) -> bool {
        matches!(self, VariableType::Flow | VariableType::TempFlow)
    }

    /// Whether the value lives in the stock array.
    pub fn is_stock(self) -> bool {
        matches!(self, VariableType::Integral | VariableType::Stock)
    }

    /// Type of a value id seen through two icons. Stock types win, then
    /// the first known type.
    pub fn merge(self, other: VariableType) -> VariableType {
        if self.is_stock() || other == VariableType::Undefined {
            self
        } else if other.is_stock() || self == VariableType::Undefined {
            other
        } else {
            self
        }
    }

    pub fn type_name(self) -> &'static str {
        match self {
            VariableType::Undefined => "undefined",
            VariableType::Constant => "constant",
            VariableType::Parameter => "parameter",
            VariableType::Flow => "flow",
            VariableType::Integral => "integral",
            VariableType::Stock => "stock",
            VariableType::TempFlow => "tempFlow",
        }
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Qualifies `name` by `scope`. Leading `:` marks a global name.
pub fn value_id(scope: Option<GroupId>, name: &str) -> String {
    let name = name.trim();
    if name.starts_with(':') {
        return name.to_string();
    }
    match scope {
        Some(group) => format!("{group}:{name}"),
        None => format!(":{name}"),
    }
}

/// The name part of a value id.
pub fn uq_name(id: &str) -> &str {
    id.split_once(':').map_or(id, |(_, name)| name)
}

/// Resolves `name` relative to the scope of an existing value id.
fn sibling_id(of: &str, name: &str) -> String {
    if name.starts_with(':') {
        return name.to_string();
    }
    match of.split_once(':') {
        Some((scope, _)) => format!("{scope}:{name}"),
        None => format!(":{name}"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableValue {
    pub ty: VariableType,
    /// Slot in the flow or stock array, assigned by `reset`.
    pub idx: Option<usize>,
    /// Initial value expression such as `"3"`, `"-x"` or `"2*y"`.
    pub init: String,
    pub name: String,
}

impl VariableValue {
    pub fn new(ty: VariableType, name: impl Into<String>, init: impl Into<String>) -> Self {
        Self {
            ty,
            idx: None,
            init: init.into(),
            name: name.into(),
        }
    }
}

/// All named quantities of a model together with the arrays holding their
/// current values. Temporaries occupy flow slots past the named ones.
#[derive(Debug, Clone)]
pub struct VariableValues {
    entries: BTreeMap<String, VariableValue>,
    pub flow_vars: Vec<f64>,
    pub stock_vars: Vec<f64>,
}

impl Default for VariableValues {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableValues {
    pub fn new() -> Self {
        let mut values = Self {
            entries: BTreeMap::new(),
            flow_vars: Vec::new(),
            stock_vars: Vec::new(),
        };
        values.make_consistent();
        values
    }

    /// Restores the protected constants.
    pub fn make_consistent(&mut self) {
        self.entries
            .entry(ZERO.to_string())
            .or_insert_with(|| VariableValue::new(VariableType::Constant, "0", "0"));
        self.entries
            .entry(ONE.to_string())
            .or_insert_with(|| VariableValue::new(VariableType::Constant, "1", "1"));
    }

    pub fn is_protected(id: &str) -> bool {
        id == ZERO || id == ONE
    }

    pub fn get(&self, id: &str) -> Option<&VariableValue> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VariableValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Creates or updates the entry for a live variable. An undefined type
    /// never overrides a known one.
    pub fn ensure(&mut self, id: &str, ty: VariableType, init: &str) -> &mut VariableValue {
        let entry = self
            .entries
            .entry(id.to_string())
            .or_insert_with(|| VariableValue::new(ty, uq_name(id), ""));
        if ty != VariableType::Undefined {
            entry.ty = ty;
        }
        entry.init = init.trim().to_string();
        entry
    }

    /// Drops entries not in `live`, keeping the protected constants.
    /// Returns the number purged.
    pub fn garbage_collect(&mut self, live: &BTreeSet<String>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|id, _| live.contains(id) || Self::is_protected(id));
        self.make_consistent();
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            log::debug!("garbage collected {purged} variable values");
        }
        purged
    }

    /// Assigns slots in value id order and writes initial values.
    pub fn reset(&mut self) -> SimResult<()> {
        let (mut flows, mut stocks) = (0, 0);
        for value in self.entries.values_mut() {
            let counter = if value.ty.is_stock() {
                &mut stocks
            } else {
                &mut flows
            };
            value.idx = Some(*counter);
            *counter += 1;
        }
        self.flow_vars = vec![0.0; flows];
        self.stock_vars = vec![0.0; stocks];

        let mut resolved = BTreeMap::new();
        let ids: Vec<String> = self.entries.keys().cloned().collect();
        for id in &ids {
            let mut visiting = BTreeSet::new();
            let v = self.init_value(id, &mut resolved, &mut visiting)?;
            self.set_value(id, v);
        }
        Ok(())
    }

    fn init_value(
        &self,
        id: &str,
        resolved: &mut BTreeMap<String, f64>,
        visiting: &mut BTreeSet<String>,
    ) -> SimResult<f64> {
        if let Some(v) = resolved.get(id) {
            return Ok(*v);
        }
        if !visiting.insert(id.to_string()) {
            return Err(StructuralError::CircularInit(id.to_string()).into());
        }
        let init = self.entries.get(id).map_or("", |e| e.init.as_str());
        let fc = FlowCoef::parse(init);
        let v = if fc.name.is_empty() {
            fc.coef
        } else {
            let other = sibling_id(id, &fc.name);
            if !self.entries.contains_key(&other) {
                return Err(StructuralError::UnknownInitReference {
                    name: fc.name,
                    var: id.to_string(),
                }
                .into());
            }
            fc.coef * self.init_value(&other, resolved, visiting)?
        };
        visiting.remove(id);
        resolved.insert(id.to_string(), v);
        Ok(v)
    }

    /// A fresh flow slot for a compiler temporary.
    pub fn alloc_temp(&mut self, init: f64) -> usize {
        self.flow_vars.push(init);
        self.flow_vars.len() - 1
    }

    /// Current value, if the id exists and has a slot.
    pub fn value(&self, id: &str) -> Option<f64> {
        let entry = self.entries.get(id)?;
        let idx = entry.idx?;
        if entry.ty.is_stock() {
            self.stock_vars.get(idx).copied()
        } else {
            self.flow_vars.get(idx).copied()
        }
    }

    pub fn set_value(&mut self, id: &str, v: f64) {
        let Some(entry) = self.entries.get(id) else {
            return;
        };
        let (Some(idx), stock) = (entry.idx, entry.ty.is_stock()) else {
            return;
        };
        let slot = if stock {
            self.stock_vars.get_mut(idx)
        } else {
            self.flow_vars.get_mut(idx)
        };
        if let Some(slot) = slot {
            *slot = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_id_scoping() {
        assert_eq!(value_id(None, "x"), ":x");
        assert_eq!(value_id(Some(GroupId(7)), " x "), "7:x");
        assert_eq!(value_id(Some(GroupId(7)), ":x"), ":x");
        assert_eq!(uq_name("7:x"), "x");
        assert_eq!(uq_name(":x"), "x");
    }

    #[test]
    fn protected_constants_survive_gc() {
        let mut values = VariableValues::new();
        values.ensure(":x", VariableType::Flow, "");
        values.ensure(":y", VariableType::Parameter, "2");
        let live: BTreeSet<String> = [":y".to_string()].into();
        assert_eq!(values.garbage_collect(&live), 1);
        assert!(values.contains(ZERO));
        assert!(values.contains(ONE));
        assert!(values.contains(":y"));
        assert!(!values.contains(":x"));
    }

    #[test]
    fn reset_assigns_slots_and_inits() {
        let mut values = VariableValues::new();
        values.ensure(":a", VariableType::Parameter, "3");
        values.ensure(":b", VariableType::Flow, "-2*a");
        values.ensure("4:s", VariableType::Stock, "b");
        values.ensure("4:b", VariableType::Flow, "5");
        values.reset().unwrap();
        assert_eq!(values.value(":a"), Some(3.0));
        assert_eq!(values.value(":b"), Some(-6.0));
        assert_eq!(values.value("4:s"), Some(5.0));
        assert_eq!(values.value(ONE), Some(1.0));
        assert_eq!(values.stock_vars.len(), 1);
        // "4:b" sorts before ":a"
        assert_eq!(values.get(":a").unwrap().idx, Some(1));
    }

    #[test]
    fn circular_init_is_rejected() {
        let mut values = VariableValues::new();
        values.ensure(":a", VariableType::Flow, "b");
        values.ensure(":b", VariableType::Flow, "2a");
        assert_eq!(
            values.reset(),
            Err(StructuralError::CircularInit(":a".into()).into())
        );
    }

    #[test]
    fn type_merging_prefers_stocks() {
        use VariableType::*;
        assert_eq!(Flow.merge(Integral), Integral);
        assert_eq!(Stock.merge(Flow), Stock);
        assert_eq!(Undefined.merge(Parameter), Parameter);
        assert_eq!(Parameter.merge(Flow), Parameter);

        let mut values = VariableValues::new();
        values.ensure(":s", Integral, "");
        values.ensure(":s", Undefined, "1");
        let s = values.get(":s").unwrap();
        assert_eq!(s.ty, Integral);
        assert_eq!(s.init, "1");
    }
}
