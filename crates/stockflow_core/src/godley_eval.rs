//! Runtime aggregation of accounting table flows into stock derivatives.

use std::collections::BTreeSet;

use crate::eval_op::Operand;
use crate::graph::{FlowCoef, ItemKind, Model};
use crate::traits::Scalar;
use crate::variable::VariableValues;

#[derive(Debug, Clone, PartialEq)]
struct Contribution {
    stock: usize,
    flow: Operand,
    coef: f64,
}

/// Sparse flow-to-stock matrix compiled from every accounting table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GodleyEvaluator {
    contributions: Vec<Contribution>,
    /// Stocks owned by some table; their derivative starts from zero.
    stocks: Vec<usize>,
}

impl GodleyEvaluator {
    /// Collects contributions from every table. A stock column appearing in
    /// several tables (a balanced duplicate) is taken from the first table
    /// in traversal order only. Flow names unknown to `values` are skipped.
    pub fn new(model: &Model, values: &VariableValues) -> Self {
        let mut evaluator = Self::default();
        let mut seen = BTreeSet::new();
        for godley in model.godleys() {
            let Some(ItemKind::Godley(icon)) = model.item(godley).map(|it| &it.kind) else {
                continue;
            };
            let table = &icon.table;
            for (col, name) in table.column_variables() {
                let stock_id = model.value_id_from(godley, &name);
                let Some(stock) = values
                    .get(&stock_id)
                    .filter(|v| v.ty.is_stock())
                    .and_then(|v| v.idx)
                else {
                    continue;
                };
                if !seen.insert(stock) {
                    continue;
                }
                evaluator.stocks.push(stock);
                let sign = if table.sign_convention_reversed(col) {
                    -1.0
                } else {
                    1.0
                };
                for row in 1..table.rows() {
                    if table.initial_condition_row(row) {
                        continue;
                    }
                    let fc = FlowCoef::parse(table.cell(row, col));
                    if fc.name.is_empty() || fc.coef == 0.0 {
                        continue;
                    }
                    let flow_id = model.value_id_from(godley, &fc.name);
                    let Some(v) = values.get(&flow_id) else {
                        continue;
                    };
                    let Some(idx) = v.idx else {
                        continue;
                    };
                    let flow = if v.ty.is_stock() {
                        Operand::stock(idx)
                    } else {
                        Operand::flow(idx)
                    };
                    evaluator.contributions.push(Contribution {
                        stock,
                        flow,
                        coef: sign * fc.coef,
                    });
                }
            }
        }
        evaluator
    }

    pub fn is_empty(&self) -> bool {
        self.stocks.is_empty()
    }

    /// Stock slots defined by some table.
    pub fn stocks(&self) -> &[usize] {
        &self.stocks
    }

    /// Signed `(flow, coef)` pairs for one stock slot.
    pub fn flows_of(&self, stock: usize) -> impl Iterator<Item = (Operand, f64)> + '_ {
        self.contributions
            .iter()
            .filter(move |c| c.stock == stock)
            .map(|c| (c.flow, c.coef))
    }

    /// Writes d(stock)/dt for every table stock into `result`.
    /// state: stock values
    /// flow: evaluated flow array
    pub fn eval<T: Scalar>(&self, state: &[T], flow: &[T], result: &mut [T]) {
        for &s in &self.stocks {
            if let Some(r) = result.get_mut(s) {
                *r = T::zero();
            }
        }
        for c in &self.contributions {
            let v = c.flow.read(flow, state);
            if let Some(r) = result.get_mut(c.stock) {
                *r = *r + T::lift(c.coef) * v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AssetClass, GodleyTable};
    use crate::variable::VariableType;

    fn setup() -> (Model, VariableValues) {
        let mut m = Model::new();
        let mut bank = GodleyTable::new("bank");
        bank.set_cell(0, 1, "reserves");
        bank.set_cell(0, 2, "deposits");
        bank.set_asset_class(1, AssetClass::Asset);
        bank.set_asset_class(2, AssetClass::Liability);
        bank.set_cell(2, 0, "spend");
        bank.set_cell(2, 1, "2s");
        bank.set_cell(2, 2, "2s");
        bank.set_cell(3, 0, "earn");
        bank.set_cell(3, 2, "-e");
        m.add_godley(Model::ROOT, bank).unwrap();
        let mut twin = GodleyTable::new("twin");
        twin.set_cell(0, 1, "reserves");
        twin.set_cell(2, 1, "e");
        m.add_godley(Model::ROOT, twin).unwrap();

        let mut values = VariableValues::new();
        for (id, ty) in [
            (":reserves", VariableType::Stock),
            (":deposits", VariableType::Stock),
            (":s", VariableType::Flow),
            (":e", VariableType::Flow),
        ] {
            values.ensure(id, ty, "");
        }
        values.reset().unwrap();
        (m, values)
    }

    #[test]
    fn liability_column_reverses_sign() {
        let (m, values) = setup();
        let eval = GodleyEvaluator::new(&m, &values);
        let flow_idx = |id: &str| values.get(id).unwrap().idx.unwrap();
        let mut flow = vec![0.0; values.flow_vars.len()];
        flow[flow_idx(":s")] = 1.5;
        flow[flow_idx(":e")] = 4.0;
        let mut result = vec![99.0; 2];
        eval.eval(&[0.0, 0.0], &flow, &mut result);
        let deposits = values.get(":deposits").unwrap().idx.unwrap();
        let reserves = values.get(":reserves").unwrap().idx.unwrap();
        assert_eq!(result[reserves], 3.0);
        assert_eq!(result[deposits], -(3.0 - 4.0));
    }

    #[test]
    fn shared_column_counted_once() {
        let (m, values) = setup();
        let eval = GodleyEvaluator::new(&m, &values);
        let reserves = values.get(":reserves").unwrap().idx.unwrap();
        assert_eq!(eval.flows_of(reserves).count(), 1);
        assert_eq!(eval.stocks().len(), 2);
    }
}
