//! Tabular run output as stored in `monitor_result.result`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Prefix of the placeholder columns injected by the rewriter
pub const VARIABLE_PREFIX: &str = "tv_";

/// Separator between table and column inside a placeholder column name
pub const VARIABLE_SEPARATOR: &str = "__";

/// A row moved out of `data` by an exclusion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedRow {
    pub value: Vec<Value>,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// Columns, rows and side channels of one run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultData {
    #[serde(default)]
    pub columns: Vec<String>,

    #[serde(default)]
    pub data: Vec<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Row-aligned placeholder values keyed by `table.column`
    #[serde(default)]
    pub variables: Vec<Map<String, Value>>,

    /// Rows removed by exclusions, keyed by exclusion id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub excluded_results: BTreeMap<String, ExcludedRow>,
}

impl ResultData {
    pub fn new(columns: Vec<String>, data: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            data,
            ..Default::default()
        }
    }

    /// A result carrying only an error message
    pub fn from_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn row_count(&self) -> usize {
        self.data.len()
    }

    /// Move `tv_<table>__<column>` columns out of the table into `variables`.
    ///
    /// Rows keep their order; `variables[i]` always describes `data[i]`.
    pub fn extract_variables(&mut self) {
        let placeholder_columns: Vec<(usize, String)> = self
            .columns
            .iter()
            .enumerate()
            .filter_map(|(index, name)| variable_key(name).map(|key| (index, key)))
            .collect();

        if placeholder_columns.is_empty() {
            if self.variables.len() != self.data.len() {
                self.variables = vec![Map::new(); self.data.len()];
            }
            return;
        }

        let mut variables = Vec::with_capacity(self.data.len());
        for row in &mut self.data {
            let mut vars = Map::new();
            for (index, key) in placeholder_columns.iter().rev() {
                if *index < row.len() {
                    vars.insert(key.clone(), row.remove(*index));
                }
            }
            variables.push(vars);
        }

        for (index, _) in placeholder_columns.iter().rev() {
            self.columns.remove(*index);
        }
        self.variables = variables;
    }

    /// Remove a row and its variables
    pub fn take_row(&mut self, index: usize) -> Option<ExcludedRow> {
        if index >= self.data.len() {
            return None;
        }
        let value = self.data.remove(index);
        let variables = if index < self.variables.len() {
            self.variables.remove(index)
        } else {
            Map::new()
        };
        Some(ExcludedRow { value, variables })
    }

    /// Append a previously removed row
    pub fn push_row(&mut self, row: ExcludedRow) {
        if self.variables.len() < self.data.len() {
            self.variables.resize(self.data.len(), Map::new());
        }
        self.data.push(row.value);
        self.variables.push(row.variables);
    }

    /// Index of the first row whose `variables[key]` renders as `value`
    pub fn find_row(&self, key: &str, value: &str) -> Option<usize> {
        self.variables
            .iter()
            .position(|vars| vars.get(key).is_some_and(|v| value_matches(v, value)))
    }

    /// Render a row as `{column: value}` for exclusion snapshots
    pub fn row_object(&self, row: &[Value]) -> Value {
        let object: Map<String, Value> = self
            .columns
            .iter()
            .cloned()
            .zip(row.iter().cloned())
            .collect();
        Value::Object(object)
    }

    /// Size of the JSON encoding
    pub fn serialized_len(&self) -> crate::Result<usize> {
        Ok(serde_json::to_vec(self)?.len())
    }
}

/// Map a placeholder column name to its `table.column` key
pub fn variable_key(column: &str) -> Option<String> {
    let rest = column.strip_prefix(VARIABLE_PREFIX)?;
    let (table, field) = rest.split_once(VARIABLE_SEPARATOR)?;
    if table.is_empty() || field.is_empty() {
        return None;
    }
    Some(format!("{table}.{field}"))
}

/// Placeholder column name for `table.column`
pub fn variable_column(table: &str, column: &str) -> String {
    format!("{VARIABLE_PREFIX}{table}{VARIABLE_SEPARATOR}{column}")
}

/// Compare a JSON cell with the textual value stored on an exclusion
pub fn value_matches(cell: &Value, value: &str) -> bool {
    match cell {
        Value::String(s) => s == value,
        Value::Null => false,
        other => other.to_string() == value,
    }
}

/// Textual form of a cell, as used for exclusion values
pub fn value_to_text(cell: &Value) -> Option<String> {
    match cell {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
