//! JSON model descriptions and their translation into a core `Model`.

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use stockflow_core::{
    AssetClass, GodleyTable, GroupId, ItemId, Model, OperationType, SimulationConfig, VariableType,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDesc {
    pub groups: Vec<GroupDesc>,
    pub items: Vec<ItemDesc>,
    pub wires: Vec<WireDesc>,
    pub config: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDesc {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Parent group label; the root when absent.
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemDesc {
    /// Label other entries refer to.
    pub id: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(flatten)]
    pub kind: ItemKindDesc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemKindDesc {
    Operation {
        op: OperationType,
    },
    Constant {
        value: f64,
    },
    Variable {
        name: String,
        #[serde(default = "flow")]
        var_type: VariableType,
        #[serde(default)]
        init: Option<String>,
        /// Exposed through the enclosing group's interface.
        #[serde(default)]
        io: bool,
    },
    Integral {
        name: String,
        #[serde(default)]
        init: Option<String>,
    },
    Godley {
        #[serde(default)]
        title: String,
        /// Row-major cells; row 0 names the stocks.
        cells: Vec<Vec<String>>,
        #[serde(default)]
        asset_classes: Vec<AssetClass>,
        #[serde(default = "yes")]
        double_entry_compliant: bool,
    },
    Plot {
        #[serde(default)]
        title: String,
        inputs: usize,
    },
}

fn flow() -> VariableType {
    VariableType::Flow
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireDesc {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub port: usize,
}

/// A built model plus the item ids its labels resolved to.
pub struct BuiltModel {
    pub model: Model,
    pub labels: HashMap<String, ItemId>,
    pub config: SimulationConfig,
}

pub fn parse_model(json: &str) -> anyhow::Result<ModelDesc> {
    serde_json::from_str(json).context("malformed model description")
}

pub fn build_model(desc: &ModelDesc) -> anyhow::Result<BuiltModel> {
    let mut model = Model::new();

    let mut groups: HashMap<&str, GroupId> = HashMap::new();
    for g in &desc.groups {
        let parent = match &g.parent {
            Some(p) => *groups
                .get(p.as_str())
                .ok_or_else(|| anyhow!("group '{}' declared before its parent '{}'", g.id, p))?,
            None => Model::ROOT,
        };
        let id = model
            .add_group(parent, g.title.clone())
            .map_err(|e| anyhow!("group '{}': {}", g.id, e))?;
        if groups.insert(g.id.as_str(), id).is_some() {
            bail!("duplicate group label '{}'", g.id);
        }
    }

    let mut labels = HashMap::new();
    for item in &desc.items {
        let group = match &item.group {
            Some(g) => *groups
                .get(g.as_str())
                .ok_or_else(|| anyhow!("item '{}' refers to unknown group '{}'", item.id, g))?,
            None => Model::ROOT,
        };
        let id = add_item(&mut model, group, &item.kind)
            .with_context(|| format!("item '{}'", item.id))?;
        if labels.insert(item.id.clone(), id).is_some() {
            bail!("duplicate item label '{}'", item.id);
        }
    }

    for wire in &desc.wires {
        let from = lookup(&labels, &wire.from)?;
        let to = lookup(&labels, &wire.to)?;
        model
            .connect(from, to, wire.port)
            .map_err(|e| anyhow!("wire {} -> {}:{}: {}", wire.from, wire.to, wire.port, e))?;
    }

    Ok(BuiltModel {
        model,
        labels,
        config: desc.config.clone(),
    })
}

fn lookup(labels: &HashMap<String, ItemId>, label: &str) -> anyhow::Result<ItemId> {
    labels
        .get(label)
        .copied()
        .ok_or_else(|| anyhow!("unknown item '{}'", label))
}

fn add_item(model: &mut Model, group: GroupId, kind: &ItemKindDesc) -> anyhow::Result<ItemId> {
    let id = match kind {
        ItemKindDesc::Operation { op } => model.add_operation(group, *op)?,
        ItemKindDesc::Constant { value } => model.add_constant(group, *value)?,
        ItemKindDesc::Variable {
            name,
            var_type,
            init,
            io,
        } => {
            if matches!(
                var_type,
                VariableType::Integral | VariableType::Stock | VariableType::TempFlow
            ) {
                bail!("variable type '{}' is owned by the compiler", var_type);
            }
            let id = model.add_variable(group, name.clone(), *var_type)?;
            if let Some(init) = init {
                model.set_init(id, init.clone())?;
            }
            if *io {
                model.add_io_var(id)?;
            }
            id
        }
        ItemKindDesc::Integral { name, init } => {
            let id = model.add_integral(group, name.clone())?;
            if let Some(init) = init {
                model.set_init(id, init.clone())?;
            }
            id
        }
        ItemKindDesc::Godley {
            title,
            cells,
            asset_classes,
            double_entry_compliant,
        } => {
            let mut table = GodleyTable::new(title.clone());
            table.double_entry_compliant = *double_entry_compliant;
            for (r, row) in cells.iter().enumerate() {
                for (c, cell) in row.iter().enumerate() {
                    table.set_cell(r, c, cell.clone());
                }
            }
            for (c, class) in asset_classes.iter().enumerate() {
                table.set_asset_class(c, *class);
            }
            model.add_godley(group, table)?
        }
        ItemKindDesc::Plot { title, inputs } => model.add_plot(group, title.clone(), *inputs)?,
    };
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DECAY: &str = r#"{
        "items": [
            {"id": "x", "kind": "integral", "name": "x", "init": "1"},
            {"id": "k", "kind": "constant", "value": -0.5},
            {"id": "mul", "kind": "operation", "op": "multiply"}
        ],
        "wires": [
            {"from": "x", "to": "mul", "port": 0},
            {"from": "k", "to": "mul", "port": 1},
            {"from": "mul", "to": "x"}
        ],
        "config": {"order": 1, "step_max": 0.1}
    }"#;

    #[test]
    fn decay_model_builds() {
        let desc = parse_model(DECAY).expect("parse");
        let built = build_model(&desc).expect("build");
        assert_eq!(built.labels.len(), 3);
        assert_eq!(built.config.order, 1);
        assert_eq!(built.config.step_max, 0.1);
        assert_eq!(built.config.eps_abs, SimulationConfig::default().eps_abs);
        let x = built.labels["x"];
        assert_eq!(built.model.value_id(x).as_deref(), Some(":x"));
    }

    #[test]
    fn grouped_io_variables_are_scoped() {
        let json = r#"{
            "groups": [{"id": "g", "title": "sector"}],
            "items": [
                {"id": "inner", "group": "g", "kind": "variable", "name": "v"},
                {"id": "port", "group": "g", "kind": "variable", "name": "w", "io": true},
                {"id": "outer", "kind": "variable", "name": "v", "var_type": "parameter", "init": "2"}
            ]
        }"#;
        let built = build_model(&parse_model(json).expect("parse")).expect("build");
        let id = |label: &str| built.model.value_id(built.labels[label]);
        assert_ne!(id("inner"), id("outer"));
        assert_eq!(id("outer").as_deref(), Some(":v"));
        assert_eq!(id("port").as_deref(), Some(":w"));
    }

    #[test]
    fn godley_cells_are_copied() {
        let json = r#"{
            "items": [{
                "id": "bank", "kind": "godley", "title": "bank",
                "cells": [["", "deposits"], ["Initial Conditions", "10"], ["interest", "r"]],
                "asset_classes": ["no_asset_class", "liability"]
            }]
        }"#;
        let built = build_model(&parse_model(json).expect("parse")).expect("build");
        let godleys = built.model.godleys();
        assert_eq!(godleys, vec![built.labels["bank"]]);
    }

    #[test]
    fn unknown_labels_are_reported() {
        let json = r#"{
            "items": [{"id": "a", "kind": "constant", "value": 1}],
            "wires": [{"from": "a", "to": "nowhere"}]
        }"#;
        let err = build_model(&parse_model(json).expect("parse"))
            .err()
            .expect("expected error");
        assert!(err.to_string().contains("unknown item 'nowhere'"));
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let json = r#"{
            "items": [
                {"id": "a", "kind": "constant", "value": 1},
                {"id": "a", "kind": "constant", "value": 2}
            ]
        }"#;
        let err = build_model(&parse_model(json).expect("parse"))
            .err()
            .expect("expected error");
        assert!(err.to_string().contains("duplicate item label 'a'"));
    }

    #[test]
    fn compiler_owned_types_are_rejected() {
        let json = r#"{
            "items": [{"id": "s", "kind": "variable", "name": "s", "var_type": "temp_flow"}]
        }"#;
        let err = build_model(&parse_model(json).expect("parse"))
            .err()
            .expect("expected error");
        assert!(format!("{:#}", err).contains("owned by the compiler"));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_model("{\"items\": 3}").is_err());
    }
}
