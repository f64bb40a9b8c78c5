//! Build matrix: axes, exclusions, inclusions and cross-product expansion.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};

/// Upper bound on the number of cells one workflow may expand to.
pub const MAX_CELLS: usize = 256;

/// A scalar matrix value.
///
/// YAML reads an unquoted `3.10` as the float `3.1`; quote version strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatrixValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl std::fmt::Display for MatrixValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatrixValue::Bool(b) => write!(f, "{b}"),
            MatrixValue::Int(i) => write!(f, "{i}"),
            MatrixValue::Float(x) => write!(f, "{x}"),
            MatrixValue::Str(s) => f.write_str(s),
        }
    }
}

/// `strategy.matrix` as written in the workflow file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixSpec {
    /// Extra cells, or extra keys merged into matching cells.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<IndexMap<String, MatrixValue>>,

    /// Partial assignments; every cell matching one is dropped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<IndexMap<String, MatrixValue>>,

    /// Axis name to its values, in file order.
    #[serde(flatten)]
    pub axes: IndexMap<String, Vec<MatrixValue>>,
}

/// One assignment of a value to every axis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatrixCell {
    values: IndexMap<String, String>,
}

impl MatrixCell {
    pub fn new(values: IndexMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, axis: &str) -> Option<&str> {
        self.values.get(axis).map(String::as_str)
    }

    pub fn values(&self) -> &IndexMap<String, String> {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn insert(&mut self, axis: &str, value: &MatrixValue) {
        self.values.insert(axis.to_string(), value.to_string());
    }

    /// True when every key of `partial` is present with the same value.
    fn matches_all(&self, partial: &IndexMap<String, MatrixValue>) -> bool {
        partial
            .iter()
            .all(|(k, v)| self.get(k) == Some(v.to_string().as_str()))
    }

    /// `os=ubuntu-22.04, python-version=3.8`, or `default` for the empty cell.
    pub fn label(&self) -> String {
        if self.values.is_empty() {
            return "default".to_string();
        }
        self.values
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl std::fmt::Display for MatrixCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

impl MatrixSpec {
    /// Number of cells in the plain cross product (before exclude/include).
    pub fn cross_product_len(&self) -> usize {
        self.axes
            .values()
            .fold(1usize, |acc, values| acc.saturating_mul(values.len()))
    }

    /// Expand into cells.
    ///
    /// The cross product is ordered with the first axis outermost. Exclusions
    /// apply to the cross product only. An include entry whose axis keys all
    /// match a cell adds its other keys to that cell; an entry matching no
    /// cell becomes a new cell.
    pub fn expand(&self) -> Result<Vec<MatrixCell>> {
        for (axis, values) in &self.axes {
            if values.is_empty() {
                return Err(WorkflowError::EmptyAxis { axis: axis.clone() });
            }
        }
        for entry in &self.exclude {
            if let Some(key) = entry.keys().find(|k| !self.axes.contains_key(*k)) {
                return Err(WorkflowError::Invalid(format!(
                    "exclude refers to unknown matrix axis '{key}'"
                )));
            }
        }

        let product = self.cross_product_len();
        if product > MAX_CELLS {
            return Err(WorkflowError::TooManyCells {
                count: product,
                max: MAX_CELLS,
            });
        }

        let mut cells = if self.axes.is_empty() && !self.include.is_empty() {
            Vec::new()
        } else {
            vec![MatrixCell::default()]
        };
        for (axis, values) in &self.axes {
            let mut next = Vec::with_capacity(cells.len() * values.len());
            for cell in &cells {
                for value in values {
                    let mut cell = cell.clone();
                    cell.insert(axis, value);
                    next.push(cell);
                }
            }
            cells = next;
        }

        cells.retain(|cell| !self.exclude.iter().any(|ex| cell.matches_all(ex)));

        let base = cells.len();
        for entry in &self.include {
            let mut merged = false;
            for cell in cells.iter_mut().take(base) {
                let compatible = entry
                    .iter()
                    .filter(|(k, _)| self.axes.contains_key(*k))
                    .all(|(k, v)| cell.get(k) == Some(v.to_string().as_str()));
                if compatible {
                    for (k, v) in entry.iter().filter(|(k, _)| !self.axes.contains_key(*k)) {
                        cell.insert(k, v);
                    }
                    merged = true;
                }
            }
            if !merged {
                let mut cell = MatrixCell::default();
                for (k, v) in entry {
                    cell.insert(k, v);
                }
                cells.push(cell);
            }
        }

        if cells.is_empty() {
            return Err(WorkflowError::EmptyMatrix);
        }
        if cells.len() > MAX_CELLS {
            return Err(WorkflowError::TooManyCells {
                count: cells.len(),
                max: MAX_CELLS,
            });
        }
        Ok(cells)
    }
}
