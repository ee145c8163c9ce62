//! Keeping accounting tables consistent with the variables they define and
//! with each other.

use std::collections::{BTreeMap, BTreeSet};

use super::{AssetClass, FlowCoef, GodleyTable, Item, ItemId, ItemKind, Model};
use crate::error::{SimResult, StructuralError};
use crate::variable::{uq_name, value_id, VariableType};

impl Model {
    fn godley_table(&self, item: ItemId) -> SimResult<&GodleyTable> {
        self.try_item(item)?
            .as_godley()
            .map(|icon| &icon.table)
            .ok_or_else(|| StructuralError::UnknownItem(item).into())
    }

    /// Accounting table icons in traversal order.
    pub fn godleys(&self) -> Vec<ItemId> {
        self.all_items()
            .into_iter()
            .filter(|&id| self.item(id).is_some_and(|it| it.as_godley().is_some()))
            .collect()
    }

    /// Creates, renames or removes the stock and flow variables of a table
    /// so that they match its current columns and body.
    pub fn update_godley(&mut self, godley: ItemId) -> SimResult<()> {
        let item = self.try_item(godley)?;
        let group = item.group;
        let Some(icon) = item.as_godley() else {
            return Err(StructuralError::UnknownItem(godley).into());
        };
        let table = icon.table.clone();
        let old_stocks = icon.stock_vars.clone();
        let old_flows = icon.flow_vars.clone();

        let mut stocks = Vec::new();
        for (col, name) in table.column_variables() {
            let mut init = FlowCoef::parse(&table.initial_value(col));
            if table.sign_convention_reversed(col) {
                init.coef = -init.coef;
            }
            let var = match self.reusable_var(&old_stocks, &stocks, &name) {
                Some(v) => v,
                None => self.add_variable(group, name, VariableType::Stock)?,
            };
            self.set_init(var, init.to_string())?;
            stocks.push(var);
        }

        let mut flows = Vec::new();
        for name in table.flow_variables() {
            let var = match self.reusable_var(&old_flows, &flows, &name) {
                Some(v) => v,
                None => self.add_variable(group, name, VariableType::Flow)?,
            };
            flows.push(var);
        }

        for stale in old_stocks.iter().chain(&old_flows) {
            if !stocks.contains(stale) && !flows.contains(stale) {
                self.remove_item(*stale);
            }
        }
        if let ItemKind::Godley(icon) = &mut self.item_mut(godley)?.kind {
            icon.stock_vars = stocks;
            icon.flow_vars = flows;
        }
        Ok(())
    }

    fn reusable_var(&self, old: &[ItemId], taken: &[ItemId], name: &str) -> Option<ItemId> {
        old.iter().copied().find(|v| {
            !taken.contains(v)
                && self
                    .item(*v)
                    .and_then(Item::as_variable)
                    .is_some_and(|var| var.name == name)
        })
    }

    /// Coefficient sum per flow value id in one column, skipping the
    /// initial conditions row.
    pub fn flow_signature(&self, godley: ItemId, col: usize) -> SimResult<BTreeMap<String, f64>> {
        let table = self.godley_table(godley)?;
        let mut signature = BTreeMap::new();
        for (name, coef) in table.column_signature(col) {
            *signature
                .entry(self.value_id_from(godley, &name))
                .or_insert(0.0) += coef;
        }
        Ok(signature)
    }

    /// Column names in other tables that could be matched by a new column
    /// of class `class` in `godley`: the counterparty class, occurring in
    /// exactly one other table and not already present in `godley`.
    pub fn matching_table_columns(&self, godley: ItemId, class: AssetClass) -> BTreeSet<String> {
        let mut r = BTreeSet::new();
        let Some(target) = class.matching() else {
            return r;
        };
        let mut duplicated = BTreeSet::new();
        let mut consider = |name: String, own: bool, col_class: AssetClass| {
            if own || r.contains(&name) || col_class != target {
                r.remove(&name);
                duplicated.insert(name);
            } else if !duplicated.contains(&name) {
                r.insert(name);
            }
        };
        for gi in self.godleys() {
            let Ok(table) = self.godley_table(gi) else {
                continue;
            };
            for (col, name) in table.column_variables() {
                consider(name, gi == godley, table.asset_class(col));
            }
        }
        if let Ok(table) = self.godley_table(godley) {
            for (col, name) in table.column_variables() {
                consider(name, false, table.asset_class(col));
            }
        }
        r
    }

    /// Balances every column of another table sharing the name of
    /// `src_col`, using that other column as the source.
    pub fn import_duplicate_column(&mut self, src: ItemId, src_col: usize) -> SimResult<()> {
        let name = self.godley_table(src)?.cell(0, src_col).trim().to_string();
        if name.is_empty() {
            return Ok(());
        }
        let mut targets = Vec::new();
        for gi in self.godleys() {
            if gi == src {
                continue;
            }
            let table = self.godley_table(gi)?;
            for col in 1..table.cols() {
                if table.cell(0, col).trim() == name {
                    targets.push((gi, col));
                }
            }
        }
        for (gi, col) in targets {
            self.balance_duplicate_columns(gi, col)?;
        }
        Ok(())
    }

    /// Makes the one other column sharing `src_col`'s stock mirror it:
    /// every flow in the source appears negated in the destination, flows
    /// absent from the source are cleared, and the initial condition is
    /// copied with its sign reversed.
    pub fn balance_duplicate_columns(&mut self, src: ItemId, src_col: usize) -> SimResult<()> {
        let src_table = self.godley_table(src)?.clone();
        let col_name = src_table.cell(0, src_col).trim();
        if col_name.is_empty() {
            return Ok(());
        }
        let col_id = self.value_id_from(src, col_name);

        let mut matches = Vec::new();
        for gi in self.godleys() {
            if gi == src {
                continue;
            }
            let table = self.godley_table(gi)?;
            for col in 1..table.cols() {
                if self.value_id_from(gi, table.cell(0, col).trim()) == col_id {
                    matches.push((gi, col));
                }
            }
        }
        let (dest, col) = match matches.as_slice() {
            [] => return Ok(()),
            [single] => *single,
            _ => return Err(StructuralError::DuplicateColumn(col_id).into()),
        };

        let src_scope = self.item_scope(src);
        let dest_scope = self.item_scope(dest);
        let src_flows = self.flow_signature(src, src_col)?;
        let dest_flows = self.flow_signature(dest, col)?;
        let dest_table = self.godley_table_mut(dest)?;

        let mut src_row_labels: BTreeMap<String, String> = BTreeMap::new();
        for row in 1..src_table.rows() {
            if !src_table.initial_condition_row(row)
                && !src_table.cell(row, 0).is_empty()
                && !src_table.cell(row, src_col).is_empty()
            {
                let fc = FlowCoef::parse(src_table.cell(row, src_col));
                if !fc.name.is_empty() {
                    src_row_labels.insert(
                        value_id(src_scope, &fc.name),
                        src_table.cell(row, 0).trim().to_string(),
                    );
                }
            } else if src_table.initial_condition_row(row) {
                if let Some(r) = (1..dest_table.rows()).find(|&r| dest_table.initial_condition_row(r)) {
                    let fc = FlowCoef::parse(src_table.cell(row, src_col));
                    dest_table.set_cell(r, col, FlowCoef::new(-fc.coef, fc.name).to_string());
                }
            }
        }

        let mut dest_row_labels: BTreeMap<String, usize> = BTreeMap::new();
        for row in 1..dest_table.rows() {
            if !dest_table.initial_condition_row(row) && !dest_table.cell(row, 0).is_empty() {
                dest_row_labels.insert(dest_table.cell(row, 0).trim().to_string(), row);
            }
        }

        for (flow, &coef) in &src_flows {
            let existing = dest_flows.get(flow).copied().unwrap_or(0.0);
            if coef == -existing {
                continue;
            }
            let entry = FlowCoef::new(-coef - existing, uq_name(flow)).to_string();
            let label = src_row_labels.get(flow).cloned().unwrap_or_default();
            match dest_row_labels.get(&label).copied() {
                Some(row) if dest_table.cell(row, col).is_empty() => {
                    dest_table.set_cell(row, col, entry);
                }
                Some(_) => {
                    let row = dest_table.rows();
                    dest_table.set_cell(row, col, entry);
                }
                None => {
                    let row = dest_table.rows();
                    dest_table.set_cell(row, 0, label.clone());
                    dest_table.set_cell(row, col, entry);
                    dest_row_labels.insert(label, row);
                }
            }
        }

        for (flow, &coef) in &dest_flows {
            if coef == 0.0 || src_flows.get(flow).copied().unwrap_or(0.0) != 0.0 {
                continue;
            }
            for row in 1..dest_table.rows() {
                let fc = FlowCoef::parse(dest_table.cell(row, col));
                if !fc.name.is_empty() && value_id(dest_scope, &fc.name) == *flow {
                    dest_table.clear_cell(row, col);
                }
            }
        }

        log::debug!("balanced column {col_id} of table {dest} against table {src}");
        self.update_godley(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::super::godley::INITIAL_CONDITIONS;
    use super::*;

    fn table(title: &str, column: &str, class: AssetClass) -> GodleyTable {
        let mut t = GodleyTable::new(title);
        t.set_cell(0, 1, column);
        t.set_asset_class(1, class);
        t
    }

    #[test]
    fn update_creates_and_prunes_variables() {
        let mut m = Model::new();
        let mut t = table("firm", "deposits", AssetClass::Liability);
        t.set_cell(1, 1, "100");
        t.set_cell(2, 0, "wages");
        t.set_cell(2, 1, "-w");
        let g = m.add_godley(Model::ROOT, t).unwrap();
        let icon = m.item(g).unwrap().as_godley().unwrap().clone();
        assert_eq!(icon.stock_vars.len(), 1);
        assert_eq!(icon.flow_vars.len(), 1);
        let stock = m.item(icon.stock_vars[0]).unwrap().as_variable().unwrap();
        assert_eq!(stock.ty, VariableType::Stock);
        assert_eq!(stock.init, "-100");

        m.godley_table_mut(g).unwrap().clear_cell(2, 1);
        m.update_godley(g).unwrap();
        assert!(m.item(icon.flow_vars[0]).is_none());
        assert!(m.item(icon.stock_vars[0]).is_some());
    }

    #[test]
    fn matching_columns_need_counterparty_class() {
        let mut m = Model::new();
        let bank = m.add_godley(Model::ROOT, table("bank", "loans", AssetClass::Asset)).unwrap();
        let firm = m.add_godley(Model::ROOT, GodleyTable::new("firm")).unwrap();
        let cols = m.matching_table_columns(firm, AssetClass::Liability);
        assert!(cols.contains("loans"));
        assert!(m.matching_table_columns(firm, AssetClass::Asset).is_empty());
        assert!(m.matching_table_columns(bank, AssetClass::Liability).is_empty());
        assert!(m.matching_table_columns(firm, AssetClass::Equity).is_empty());
    }

    #[test]
    fn balancing_mirrors_source_column() {
        let mut m = Model::new();
        let mut src = table("bank", "loans", AssetClass::Asset);
        src.set_cell(1, 1, "50");
        src.set_cell(2, 0, "lend");
        src.set_cell(2, 1, "l");
        src.set_cell(3, 0, "repay");
        src.set_cell(3, 1, "-2r");
        let mut dst = table("firm", "loans", AssetClass::Liability);
        dst.set_cell(2, 0, "repay");
        dst.set_cell(2, 1, "stale");
        let s = m.add_godley(Model::ROOT, src).unwrap();
        let d = m.add_godley(Model::ROOT, dst).unwrap();
        m.balance_duplicate_columns(s, 1).unwrap();

        let src_sig = m.flow_signature(s, 1).unwrap();
        let dst_sig = m.flow_signature(d, 1).unwrap();
        for (flow, coef) in &src_sig {
            assert_eq!(coef + dst_sig.get(flow).copied().unwrap_or(0.0), 0.0);
        }
        assert!(!dst_sig.contains_key(":stale"));
        let t = m.godley_table(d).unwrap();
        assert_eq!(t.initial_value(1), "-50");
        // the "repay" row was occupied, so the entry lands on a new blank row
        assert_eq!(t.cell(2, 1), "");
        assert_eq!(t.cell(3, 0), "lend");
        assert_eq!(t.cell(3, 1), "-l");
        assert_eq!(t.cell(4, 0), "");
        assert_eq!(t.cell(4, 1), "2r");
        assert_eq!(t.cell(1, 0), INITIAL_CONDITIONS);
    }

    #[test]
    fn two_duplicates_are_rejected() {
        let mut m = Model::new();
        let s = m.add_godley(Model::ROOT, table("a", "x", AssetClass::Asset)).unwrap();
        m.add_godley(Model::ROOT, table("b", "x", AssetClass::Liability)).unwrap();
        m.add_godley(Model::ROOT, table("c", "x", AssetClass::Liability)).unwrap();
        assert_eq!(
            m.balance_duplicate_columns(s, 1),
            Err(StructuralError::DuplicateColumn(":x".into()).into())
        );
    }

    #[test]
    fn import_pulls_from_existing_column() {
        let mut m = Model::new();
        let mut src = table("bank", "deposits", AssetClass::Liability);
        src.set_cell(2, 0, "interest");
        src.set_cell(2, 1, "i");
        m.add_godley(Model::ROOT, src).unwrap();
        let d = m
            .add_godley(Model::ROOT, table("hh", "deposits", AssetClass::Asset))
            .unwrap();
        m.import_duplicate_column(d, 1).unwrap();
        let t = m.godley_table(d).unwrap();
        assert_eq!(t.cell(2, 0), "interest");
        assert_eq!(t.cell(2, 1), "-i");
    }
}
