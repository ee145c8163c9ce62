//! The wiring diagram: items, their ports, the wires between them and the
//! tree of groups that owns everything.

mod accounts;
pub mod godley;
mod item;
pub mod operation;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::ControlFlow;

use crate::error::{SimResult, StructuralError};
use crate::variable::{value_id, VariableType};

pub use godley::{AssetClass, FlowCoef, GodleyIcon, GodleyTable};
pub use item::{IntegralItem, Item, ItemKind, OperationItem, PlotItem, VariableItem};
pub use operation::OperationType;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub usize);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(ItemId);
id_type!(PortId);
id_type!(WireId);
id_type!(GroupId);

#[derive(Debug, Clone)]
pub struct Port {
    pub item: ItemId,
    pub input: bool,
    /// Accepts any number of incoming wires.
    pub multi_wire: bool,
    pub wires: Vec<WireId>,
}

#[derive(Debug, Clone, Copy)]
pub struct Wire {
    pub from: PortId,
    pub to: PortId,
    /// Nearest group enclosing both endpoints.
    pub group: GroupId,
}

#[derive(Debug, Clone, Default)]
pub struct Group {
    pub parent: Option<GroupId>,
    pub title: String,
    pub items: Vec<ItemId>,
    pub groups: Vec<GroupId>,
    pub wires: Vec<WireId>,
    /// Variables forming the group's interface; they are scoped like
    /// the parent's own variables.
    pub io_vars: BTreeSet<ItemId>,
}

/// Arena holding a complete model. Ids are never reused.
#[derive(Debug, Clone)]
pub struct Model {
    items: BTreeMap<ItemId, Item>,
    ports: BTreeMap<PortId, Port>,
    wires: BTreeMap<WireId, Wire>,
    groups: BTreeMap<GroupId, Group>,
    next_id: usize,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    pub const ROOT: GroupId = GroupId(0);

    pub fn new() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(Self::ROOT, Group::default());
        Self {
            items: BTreeMap::new(),
            ports: BTreeMap::new(),
            wires: BTreeMap::new(),
            groups,
            next_id: 1,
        }
    }

    fn fresh(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // ---- lookups ----

    pub fn item(&self, id: ItemId) -> Option<&Item> {
        self.items.get(&id)
    }

    pub(crate) fn item_mut(&mut self, id: ItemId) -> SimResult<&mut Item> {
        self.items
            .get_mut(&id)
            .ok_or_else(|| StructuralError::UnknownItem(id).into())
    }

    pub fn try_item(&self, id: ItemId) -> SimResult<&Item> {
        self.items
            .get(&id)
            .ok_or_else(|| StructuralError::UnknownItem(id).into())
    }

    pub fn port(&self, id: PortId) -> Option<&Port> {
        self.ports.get(&id)
    }

    pub fn wire(&self, id: WireId) -> Option<&Wire> {
        self.wires.get(&id)
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn items(&self) -> impl Iterator<Item = (ItemId, &Item)> {
        self.items.iter().map(|(id, item)| (*id, item))
    }

    pub fn wires(&self) -> impl Iterator<Item = (WireId, &Wire)> {
        self.wires.iter().map(|(id, wire)| (*id, wire))
    }

    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    /// Output ports feeding `port` through its wires.
    pub fn sources(&self, port: PortId) -> Vec<PortId> {
        self.ports.get(&port).map_or_else(Vec::new, |p| {
            p.wires
                .iter()
                .filter_map(|w| self.wires.get(w))
                .filter(|w| w.to == port)
                .map(|w| w.from)
                .collect()
        })
    }

    /// Items wired into input `input` of `item`.
    pub fn input_sources(&self, item: ItemId, input: usize) -> Vec<ItemId> {
        self.items
            .get(&item)
            .and_then(|it| it.inputs.get(input))
            .map(|&port| {
                self.sources(port)
                    .into_iter()
                    .filter_map(|p| self.ports.get(&p).map(|p| p.item))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn input_wired(&self, item: ItemId) -> bool {
        self.items.get(&item).is_some_and(|it| {
            it.inputs
                .iter()
                .any(|p| self.ports.get(p).is_some_and(|p| !p.wires.is_empty()))
        })
    }

    // ---- traversal ----

    /// Pre-order walk over the items of `group` and its descendants. The
    /// walk stops at the first `Break` and returns it.
    pub fn recursive_do<B>(
        &self,
        group: GroupId,
        visit: &mut impl FnMut(ItemId, &Item) -> ControlFlow<B>,
    ) -> ControlFlow<B> {
        let Some(g) = self.groups.get(&group) else {
            return ControlFlow::Continue(());
        };
        for id in &g.items {
            if let Some(item) = self.items.get(id) {
                visit(*id, item)?;
            }
        }
        for sub in &g.groups {
            self.recursive_do(*sub, visit)?;
        }
        ControlFlow::Continue(())
    }

    /// Every item in the model, in group pre-order.
    pub fn all_items(&self) -> Vec<ItemId> {
        let mut ids = Vec::new();
        let _ = self.recursive_do::<()>(Self::ROOT, &mut |id, _| {
            ids.push(id);
            ControlFlow::Continue(())
        });
        ids
    }

    // ---- scoping ----

    /// Scope a group contributes to value ids. The root group has none.
    pub fn scope(&self, group: GroupId) -> Option<GroupId> {
        if group == Self::ROOT {
            None
        } else {
            Some(group)
        }
    }

    /// Scope used for names on `item`; group I/O variables resolve in the
    /// parent group.
    pub fn item_scope(&self, item: ItemId) -> Option<GroupId> {
        let group = self.items.get(&item)?.group;
        let g = self.groups.get(&group)?;
        if g.io_vars.contains(&item) {
            g.parent.and_then(|p| self.scope(p))
        } else {
            self.scope(group)
        }
    }

    /// Qualifies `name` as it would be seen from `item`.
    pub fn value_id_from(&self, item: ItemId, name: &str) -> String {
        value_id(self.item_scope(item), name)
    }

    /// Value id of the quantity an item produces: the variable itself, or
    /// the stock of an integral.
    pub fn value_id(&self, item: ItemId) -> Option<String> {
        match &self.items.get(&item)?.kind {
            ItemKind::Variable(v) => Some(self.value_id_from(item, &v.name)),
            ItemKind::Integral(i) => Some(self.value_id_from(item, &i.stock_name)),
            _ => None,
        }
    }

    /// All variable icons sharing a value id.
    pub fn variables_with_value_id(&self, id: &str) -> Vec<ItemId> {
        self.all_items()
            .into_iter()
            .filter(|&it| {
                self.items.get(&it).is_some_and(|i| i.as_variable().is_some())
                    && self.value_id(it).as_deref() == Some(id)
            })
            .collect()
    }

    // ---- construction ----

    pub fn add_group(&mut self, parent: GroupId, title: impl Into<String>) -> SimResult<GroupId> {
        if !self.groups.contains_key(&parent) {
            return Err(StructuralError::InvalidWire(format!("no group {parent}")).into());
        }
        let id = GroupId(self.fresh());
        self.groups.insert(
            id,
            Group {
                parent: Some(parent),
                title: title.into(),
                ..Group::default()
            },
        );
        if let Some(p) = self.groups.get_mut(&parent) {
            p.groups.push(id);
        }
        Ok(id)
    }

    fn add_item(&mut self, group: GroupId, kind: ItemKind, plot_inputs: usize) -> SimResult<ItemId> {
        if !self.groups.contains_key(&group) {
            return Err(StructuralError::InvalidWire(format!("no group {group}")).into());
        }
        let id = ItemId(self.fresh());
        let multi_wire = match &kind {
            ItemKind::Operation(op) => op.op.multi_wire(),
            _ => false,
        };
        let output = if item::has_output(&kind) {
            Some(self.add_port(id, false, false))
        } else {
            None
        };
        let inputs = (0..item::input_count(&kind, plot_inputs))
            .map(|_| self.add_port(id, true, multi_wire))
            .collect();
        self.items.insert(
            id,
            Item {
                group,
                kind,
                output,
                inputs,
            },
        );
        if let Some(g) = self.groups.get_mut(&group) {
            g.items.push(id);
        }
        Ok(id)
    }

    fn add_port(&mut self, item: ItemId, input: bool, multi_wire: bool) -> PortId {
        let id = PortId(self.fresh());
        self.ports.insert(
            id,
            Port {
                item,
                input,
                multi_wire,
                wires: Vec::new(),
            },
        );
        id
    }

    /// Adds an operation icon. `integrate` becomes an integral owning a
    /// freshly named stock.
    pub fn add_operation(&mut self, group: GroupId, op: OperationType) -> SimResult<ItemId> {
        if op == OperationType::Integrate {
            let name = format!("int{}", self.next_id);
            return self.add_integral(group, name);
        }
        self.add_item(
            group,
            ItemKind::Operation(OperationItem { op, value: 0.0 }),
            0,
        )
    }

    pub fn add_constant(&mut self, group: GroupId, value: f64) -> SimResult<ItemId> {
        self.add_item(
            group,
            ItemKind::Operation(OperationItem {
                op: OperationType::Constant,
                value,
            }),
            0,
        )
    }

    pub fn add_variable(
        &mut self,
        group: GroupId,
        name: impl Into<String>,
        ty: VariableType,
    ) -> SimResult<ItemId> {
        self.add_item(
            group,
            ItemKind::Variable(VariableItem {
                name: name.into(),
                ty,
                init: String::new(),
            }),
            0,
        )
    }

    pub fn add_integral(&mut self, group: GroupId, stock_name: impl Into<String>) -> SimResult<ItemId> {
        self.add_item(
            group,
            ItemKind::Integral(IntegralItem {
                stock_name: stock_name.into(),
                init: String::new(),
            }),
            0,
        )
    }

    pub fn add_godley(&mut self, group: GroupId, table: GodleyTable) -> SimResult<ItemId> {
        let id = self.add_item(group, ItemKind::Godley(GodleyIcon::new(table)), 0)?;
        self.update_godley(id)?;
        Ok(id)
    }

    pub fn add_plot(&mut self, group: GroupId, title: impl Into<String>, inputs: usize) -> SimResult<ItemId> {
        self.add_item(
            group,
            ItemKind::Plot(PlotItem {
                title: title.into(),
            }),
            inputs,
        )
    }

    /// Marks a variable as part of its group's interface.
    pub fn add_io_var(&mut self, item: ItemId) -> SimResult<()> {
        let group = self.try_item(item)?.group;
        if let Some(g) = self.groups.get_mut(&group) {
            g.io_vars.insert(item);
        }
        Ok(())
    }

    // ---- editing ----

    /// Initial value of a variable or integral stock.
    pub fn set_init(&mut self, item: ItemId, init: impl Into<String>) -> SimResult<()> {
        match &mut self.item_mut(item)?.kind {
            ItemKind::Variable(v) => v.init = init.into(),
            ItemKind::Integral(i) => i.init = init.into(),
            _ => return Err(StructuralError::UnknownItem(item).into()),
        }
        Ok(())
    }

    pub fn set_constant_value(&mut self, item: ItemId, value: f64) -> SimResult<()> {
        match &mut self.item_mut(item)?.kind {
            ItemKind::Operation(op) => {
                op.value = value;
                Ok(())
            }
            _ => Err(StructuralError::UnknownItem(item).into()),
        }
    }

    /// Mutable access to a table; call `update_godley` afterwards.
    pub fn godley_table_mut(&mut self, item: ItemId) -> SimResult<&mut GodleyTable> {
        match &mut self.item_mut(item)?.kind {
            ItemKind::Godley(icon) => Ok(&mut icon.table),
            _ => Err(StructuralError::UnknownItem(item).into()),
        }
    }

    /// Wires `from`'s output into input `input` of `to`.
    pub fn connect(&mut self, from: ItemId, to: ItemId, input: usize) -> SimResult<WireId> {
        let out = self.try_item(from)?.output.ok_or_else(|| {
            StructuralError::InvalidWire(format!("item {from} has no output port"))
        })?;
        let inp = self
            .try_item(to)?
            .inputs
            .get(input)
            .copied()
            .ok_or_else(|| StructuralError::InvalidWire(format!("item {to} has no input {input}")))?;
        self.add_wire(out, inp)
    }

    pub fn add_wire(&mut self, from: PortId, to: PortId) -> SimResult<WireId> {
        let (Some(f), Some(t)) = (self.ports.get(&from), self.ports.get(&to)) else {
            return Err(StructuralError::InvalidWire("dangling port".into()).into());
        };
        if f.input || !t.input {
            return Err(StructuralError::InvalidWire("wires run from an output to an input".into()).into());
        }
        if f.item == t.item {
            return Err(StructuralError::InvalidWire(format!("item {} wired to itself", f.item)).into());
        }
        if !t.multi_wire && !t.wires.is_empty() {
            return Err(StructuralError::InvalidWire("input already wired".into()).into());
        }
        let group = self.common_group(f.item, t.item)?;
        let id = WireId(self.fresh());
        self.wires.insert(id, Wire { from, to, group });
        for p in [from, to] {
            if let Some(port) = self.ports.get_mut(&p) {
                port.wires.push(id);
            }
        }
        if let Some(g) = self.groups.get_mut(&group) {
            g.wires.push(id);
        }
        Ok(id)
    }

    fn ancestry(&self, mut group: GroupId) -> Vec<GroupId> {
        let mut chain = vec![group];
        while let Some(parent) = self.groups.get(&group).and_then(|g| g.parent) {
            chain.push(parent);
            group = parent;
        }
        chain
    }

    fn common_group(&self, a: ItemId, b: ItemId) -> SimResult<GroupId> {
        let ga = self.ancestry(self.try_item(a)?.group);
        let gb: BTreeSet<GroupId> = self.ancestry(self.try_item(b)?.group).into_iter().collect();
        Ok(ga.into_iter().find(|g| gb.contains(g)).unwrap_or(Self::ROOT))
    }

    pub fn remove_wire(&mut self, id: WireId) {
        let Some(wire) = self.wires.remove(&id) else {
            return;
        };
        for p in [wire.from, wire.to] {
            if let Some(port) = self.ports.get_mut(&p) {
                port.wires.retain(|w| *w != id);
            }
        }
        if let Some(g) = self.groups.get_mut(&wire.group) {
            g.wires.retain(|w| *w != id);
        }
    }

    /// Deletes an item, its ports and every wire attached to them. The
    /// variables of an accounting table go with it.
    pub fn remove_item(&mut self, id: ItemId) {
        let Some(item) = self.items.remove(&id) else {
            return;
        };
        for port in item.output.iter().chain(&item.inputs) {
            if let Some(p) = self.ports.remove(port) {
                for w in p.wires {
                    self.remove_wire(w);
                }
            }
        }
        if let Some(g) = self.groups.get_mut(&item.group) {
            g.items.retain(|i| *i != id);
            g.io_vars.remove(&id);
        }
        if let ItemKind::Godley(icon) = item.kind {
            for var in icon.stock_vars.into_iter().chain(icon.flow_vars) {
                self.remove_item(var);
            }
        }
        for other in self.items.values_mut() {
            if let ItemKind::Godley(icon) = &mut other.kind {
                icon.stock_vars.retain(|v| *v != id);
                icon.flow_vars.retain(|v| *v != id);
            }
        }
    }

    pub fn remove_group(&mut self, id: GroupId) {
        if id == Self::ROOT {
            return;
        }
        let Some(group) = self.groups.remove(&id) else {
            return;
        };
        for sub in group.groups {
            self.remove_group(sub);
        }
        for item in group.items {
            self.remove_item(item);
        }
        for wire in group.wires {
            self.remove_wire(wire);
        }
        if let Some(parent) = group.parent.and_then(|p| self.groups.get_mut(&p)) {
            parent.groups.retain(|g| *g != id);
        }
    }

    /// Retypes every icon of `value_id`, adding or dropping their input
    /// port as the new type requires.
    pub fn convert_var_type(&mut self, value_id: &str, ty: VariableType) -> SimResult<()> {
        let icons = self.variables_with_value_id(value_id);
        let Some(first) = icons.first() else {
            return Err(StructuralError::UnknownVariable(value_id.to_string()).into());
        };
        let current = self
            .try_item(*first)?
            .as_variable()
            .map(|v| v.ty)
            .unwrap_or_default();
        if current == ty {
            return Ok(());
        }
        if matches!(ty, VariableType::Undefined | VariableType::TempFlow) {
            return Err(StructuralError::InvalidRetype(ty).into());
        }
        if icons.iter().any(|&i| self.input_wired(i)) {
            return Err(StructuralError::ConvertWiredVariable(value_id.to_string()).into());
        }
        let godley_stock = self.items.values().any(|it| {
            it.as_godley()
                .is_some_and(|g| g.stock_vars.iter().any(|v| icons.contains(v)))
        });
        if godley_stock && ty != VariableType::Stock {
            return Err(StructuralError::InvalidRetype(ty).into());
        }
        for icon in icons {
            let needs_input = ty.lhs();
            let item = self.item_mut(icon)?;
            if let ItemKind::Variable(v) = &mut item.kind {
                v.ty = ty;
            }
            let dropped: Vec<PortId> = if needs_input {
                Vec::new()
            } else {
                std::mem::take(&mut item.inputs)
            };
            let add = needs_input && item.inputs.is_empty();
            for port in dropped {
                self.ports.remove(&port);
            }
            if add {
                let port = self.add_port(icon, true, false);
                self.item_mut(icon)?.inputs.push(port);
            }
        }
        Ok(())
    }
}
