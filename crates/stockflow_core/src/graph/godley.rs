//! Double-entry (Godley) accounting tables.
//!
//! Row 0 holds the stock (column) names, column 0 the transaction labels.
//! Every other cell is a signed flow entry such as `"-2*wages"`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::ItemId;

/// Label marking the row that seeds stock initial values.
pub const INITIAL_CONDITIONS: &str = "Initial Conditions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    #[default]
    NoAssetClass,
    Asset,
    Liability,
    Equity,
}

impl AssetClass {
    /// The class a duplicated column must have in a counterparty table.
    pub fn matching(self) -> Option<AssetClass> {
        match self {
            AssetClass::Asset => Some(AssetClass::Liability),
            AssetClass::Liability => Some(AssetClass::Asset),
            _ => None,
        }
    }
}

/// A cell entry decomposed into coefficient and flow name.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowCoef {
    pub coef: f64,
    pub name: String,
}

impl FlowCoef {
    pub fn new(coef: f64, name: impl Into<String>) -> Self {
        Self {
            coef,
            name: name.into(),
        }
    }

    /// Parses `"x"`, `"-x"`, `"2*x"`, `"2x"`, `"-1.5 x"` or a bare number.
    /// A blank cell parses as a zero coefficient with no name.
    pub fn parse(cell: &str) -> Self {
        let s = cell.trim();
        if s.is_empty() {
            return Self::new(0.0, "");
        }
        let (sign, rest) = match s.strip_prefix('-') {
            Some(rest) => (-1.0, rest.trim_start()),
            None => (1.0, s.strip_prefix('+').unwrap_or(s).trim_start()),
        };
        let split = numeric_prefix_len(rest);
        let (coef, name) = if split == 0 {
            (1.0, rest)
        } else {
            match rest[..split].parse::<f64>() {
                Ok(c) => (c, &rest[split..]),
                Err(_) => (1.0, rest),
            }
        };
        let name = name.trim_start();
        let name = name.strip_prefix('*').unwrap_or(name).trim();
        Self::new(sign * coef, name)
    }
}

impl fmt::Display for FlowCoef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            if self.coef == 0.0 {
                Ok(())
            } else {
                write!(f, "{}", self.coef)
            }
        } else if self.coef == 1.0 {
            f.write_str(&self.name)
        } else if self.coef == -1.0 {
            write!(f, "-{}", self.name)
        } else {
            write!(f, "{}{}", self.coef, self.name)
        }
    }
}

/// Length of the leading decimal number in `s`. An exponent is only
/// consumed when digits follow it, so `"2e"` leaves the name `e`.
fn numeric_prefix_len(s: &str) -> usize {
    let b = s.as_bytes();
    let mut i = 0;
    while i < b.len() && b[i].is_ascii_digit() {
        i += 1;
    }
    if i < b.len() && b[i] == b'.' {
        i += 1;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i == 0 || (i == 1 && b[0] == b'.') {
        return 0;
    }
    if i < b.len() && (b[i] == b'e' || b[i] == b'E') {
        let mut j = i + 1;
        if j < b.len() && (b[j] == b'+' || b[j] == b'-') {
            j += 1;
        }
        if j < b.len() && b[j].is_ascii_digit() {
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    i
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GodleyTable {
    pub title: String,
    data: Vec<Vec<String>>,
    asset_class: Vec<AssetClass>,
    /// When set, liability and equity columns carry reversed signs.
    pub double_entry_compliant: bool,
}

impl Default for GodleyTable {
    fn default() -> Self {
        Self::new("")
    }
}

impl GodleyTable {
    /// A 2x2 table: header row plus an initial conditions row.
    pub fn new(title: impl Into<String>) -> Self {
        let mut table = Self {
            title: title.into(),
            data: vec![vec![String::new(); 2]; 2],
            asset_class: vec![AssetClass::NoAssetClass; 2],
            double_entry_compliant: true,
        };
        table.data[1][0] = INITIAL_CONDITIONS.to_string();
        table
    }

    pub fn rows(&self) -> usize {
        self.data.len()
    }

    pub fn cols(&self) -> usize {
        self.data.first().map_or(0, Vec::len)
    }

    pub fn resize(&mut self, rows: usize, cols: usize) {
        self.data.resize_with(rows, Vec::new);
        for row in &mut self.data {
            row.resize(cols, String::new());
        }
        self.asset_class.resize(cols, AssetClass::NoAssetClass);
    }

    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.data
            .get(row)
            .and_then(|r| r.get(col))
            .map_or("", String::as_str)
    }

    /// Writes a cell, growing the table when needed.
    pub fn set_cell(&mut self, row: usize, col: usize, value: impl Into<String>) {
        if row >= self.rows() || col >= self.cols() {
            self.resize(self.rows().max(row + 1), self.cols().max(col + 1));
        }
        self.data[row][col] = value.into();
    }

    pub fn clear_cell(&mut self, row: usize, col: usize) {
        if row < self.rows() && col < self.cols() {
            self.data[row][col].clear();
        }
    }

    pub fn asset_class(&self, col: usize) -> AssetClass {
        self.asset_class.get(col).copied().unwrap_or_default()
    }

    pub fn set_asset_class(&mut self, col: usize, class: AssetClass) {
        if col >= self.asset_class.len() {
            self.resize(self.rows(), col + 1);
        }
        self.asset_class[col] = class;
    }

    pub fn initial_condition_row(&self, row: usize) -> bool {
        self.cell(row, 0).trim() == INITIAL_CONDITIONS
    }

    pub fn sign_convention_reversed(&self, col: usize) -> bool {
        self.double_entry_compliant
            && matches!(
                self.asset_class(col),
                AssetClass::Liability | AssetClass::Equity
            )
    }

    /// Trimmed stock names, one per non-blank column after the label column.
    pub fn column_variables(&self) -> Vec<(usize, String)> {
        (1..self.cols())
            .map(|col| (col, self.cell(0, col).trim().to_string()))
            .filter(|(_, name)| !name.is_empty())
            .collect()
    }

    /// Distinct flow names referenced in the body of the table.
    pub fn flow_variables(&self) -> Vec<String> {
        let mut names = Vec::new();
        for row in 1..self.rows() {
            if self.initial_condition_row(row) {
                continue;
            }
            for col in 1..self.cols() {
                let fc = FlowCoef::parse(self.cell(row, col));
                if !fc.name.is_empty() && !names.contains(&fc.name) {
                    names.push(fc.name);
                }
            }
        }
        names
    }

    /// Coefficient sum per flow name in one column, excluding the
    /// initial conditions row. Keys are the names as written.
    pub fn column_signature(&self, col: usize) -> BTreeMap<String, f64> {
        let mut signature = BTreeMap::new();
        for row in 1..self.rows() {
            if self.initial_condition_row(row) {
                continue;
            }
            let fc = FlowCoef::parse(self.cell(row, col));
            if !fc.name.is_empty() {
                *signature.entry(fc.name).or_insert(0.0) += fc.coef;
            }
        }
        signature
    }

    /// Initial value expression of a column, empty when none is given.
    pub fn initial_value(&self, col: usize) -> String {
        (1..self.rows())
            .find(|&row| self.initial_condition_row(row))
            .map(|row| self.cell(row, col).trim().to_string())
            .unwrap_or_default()
    }
}

/// An accounting table placed on the canvas, together with the variable
/// items it keeps in sync with its columns and body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GodleyIcon {
    pub table: GodleyTable,
    #[serde(default)]
    pub stock_vars: Vec<ItemId>,
    #[serde(default)]
    pub flow_vars: Vec<ItemId>,
}

impl GodleyIcon {
    pub fn new(table: GodleyTable) -> Self {
        Self {
            table,
            stock_vars: Vec::new(),
            flow_vars: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_coef_parses_common_forms() {
        assert_eq!(FlowCoef::parse("x"), FlowCoef::new(1.0, "x"));
        assert_eq!(FlowCoef::parse(" -x "), FlowCoef::new(-1.0, "x"));
        assert_eq!(FlowCoef::parse("2*x"), FlowCoef::new(2.0, "x"));
        assert_eq!(FlowCoef::parse("2.5 wages"), FlowCoef::new(2.5, "wages"));
        assert_eq!(FlowCoef::parse("-3"), FlowCoef::new(-3.0, ""));
        assert_eq!(FlowCoef::parse("2e"), FlowCoef::new(2.0, "e"));
        assert_eq!(FlowCoef::parse("1e3"), FlowCoef::new(1000.0, ""));
        assert_eq!(FlowCoef::parse(""), FlowCoef::new(0.0, ""));
    }

    #[test]
    fn flow_coef_display_reparses() {
        for cell in ["x", "-x", "2x", "-0.5y", "7"] {
            let fc = FlowCoef::parse(cell);
            assert_eq!(FlowCoef::parse(&fc.to_string()), fc);
        }
        assert_eq!(FlowCoef::new(0.0, "").to_string(), "");
    }

    #[test]
    fn liability_columns_reverse_sign_only_when_compliant() {
        let mut table = GodleyTable::new("bank");
        table.set_asset_class(1, AssetClass::Asset);
        table.set_asset_class(2, AssetClass::Liability);
        assert!(!table.sign_convention_reversed(1));
        assert!(table.sign_convention_reversed(2));
        table.double_entry_compliant = false;
        assert!(!table.sign_convention_reversed(2));
    }

    #[test]
    fn signature_skips_initial_conditions() {
        let mut table = GodleyTable::new("t");
        table.set_cell(0, 1, "deposits");
        table.set_cell(1, 1, "100");
        table.set_cell(2, 0, "wages");
        table.set_cell(2, 1, "w");
        table.set_cell(3, 1, "-2w");
        table.set_cell(4, 1, "c");
        let sig = table.column_signature(1);
        assert_eq!(sig.get("w"), Some(&-1.0));
        assert_eq!(sig.get("c"), Some(&1.0));
        assert_eq!(sig.len(), 2);
        assert_eq!(table.initial_value(1), "100");
        assert_eq!(table.flow_variables(), vec!["w".to_string(), "c".to_string()]);
    }
}
