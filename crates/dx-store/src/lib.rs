#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use csv::ReaderBuilder;
use dx_value::{ColumnType, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod metadata;

pub use metadata::{Layer, TransformMetadata, TransformRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("column length ({actual}) does not match table length ({expected})")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("unknown column: {name}")]
    UnknownColumn { name: String },
    #[error("row {row} out of bounds for table of {len} rows")]
    RowOutOfBounds { row: usize, len: usize },
    #[error("csv input has no headers")]
    MissingHeaders,
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    ty: ColumnType,
    values: Vec<Value>,
}

impl Column {
    #[must_use]
    pub fn column_type(&self) -> ColumnType {
        self.ty
    }

    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// An in-process table: aligned column vectors keyed by name, with the
/// declared column order preserved for enumeration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    len: usize,
    order: Vec<String>,
    columns: BTreeMap<String, Column>,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from header-ful CSV text. Cells are typed eagerly:
    /// empty → null, integer/float → number, `true`/`false` → bool,
    /// anything else → text.
    pub fn from_csv_str(input: &str) -> Result<Self, StoreError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_reader(input.as_bytes());

        let headers = reader.headers()?.clone();
        if headers.is_empty() {
            return Err(StoreError::MissingHeaders);
        }

        let mut raw: Vec<Vec<Value>> = vec![Vec::new(); headers.len()];
        for row in reader.records() {
            let record = row?;
            for (idx, values) in raw.iter_mut().enumerate() {
                let field = record.get(idx).unwrap_or_default();
                values.push(parse_cell(field));
            }
        }

        let mut table = Self::new();
        for (name, values) in headers.iter().zip(raw) {
            let ty = infer_column_type(&values);
            table.insert_column(name, ty, values)?;
        }
        Ok(table)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Column names in declared order.
    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.order
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    #[must_use]
    pub fn column_values(&self, name: &str) -> Option<&[Value]> {
        self.columns.get(name).map(|c| c.values.as_slice())
    }

    #[must_use]
    pub fn value(&self, row: usize, name: &str) -> Option<&Value> {
        self.columns.get(name).and_then(|c| c.values.get(row))
    }

    pub fn set_value(&mut self, row: usize, name: &str, value: Value) -> Result<(), StoreError> {
        let len = self.len;
        let column = self
            .columns
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownColumn {
                name: name.to_owned(),
            })?;
        let slot = column
            .values
            .get_mut(row)
            .ok_or(StoreError::RowOutOfBounds { row, len })?;
        *slot = value;
        Ok(())
    }

    /// Insert or replace a column. A replaced column keeps its position in
    /// the declared order; a new one appends. The first column inserted
    /// into an empty table fixes the table length.
    pub fn insert_column(
        &mut self,
        name: &str,
        ty: ColumnType,
        values: Vec<Value>,
    ) -> Result<(), StoreError> {
        if self.columns.is_empty() {
            self.len = values.len();
        } else if values.len() != self.len {
            return Err(StoreError::LengthMismatch {
                expected: self.len,
                actual: values.len(),
            });
        }
        if !self.columns.contains_key(name) {
            self.order.push(name.to_owned());
        }
        self.columns.insert(name.to_owned(), Column { ty, values });
        Ok(())
    }

    /// Drop a column; reports whether it existed. Removing the last column
    /// resets the table length.
    pub fn remove_column(&mut self, name: &str) -> bool {
        let existed = self.columns.remove(name).is_some();
        if existed {
            self.order.retain(|n| n != name);
            if self.columns.is_empty() {
                self.len = 0;
            }
        }
        existed
    }
}

fn parse_cell(field: &str) -> Value {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(value) = trimmed.parse::<i64>() {
        return Value::Number(value as f64);
    }
    if let Ok(value) = trimmed.parse::<f64>() {
        if value.is_finite() {
            return Value::Number(value);
        }
    }
    if let Ok(value) = trimmed.parse::<bool>() {
        return Value::Bool(value);
    }
    Value::Utf8(trimmed.to_owned())
}

/// Declared-type inference over cell values, used for CSV loads and for
/// transforms that omit an explicit type. Nulls are ignored; an all-null
/// column is `text`.
#[must_use]
pub fn infer_column_type(values: &[Value]) -> ColumnType {
    let mut any = false;
    let mut all_numeric = true;
    let mut all_bool = true;
    let mut all_date = true;
    for value in values {
        if value.is_null() {
            continue;
        }
        any = true;
        all_numeric = all_numeric && matches!(value, Value::Number(_));
        all_bool = all_bool && matches!(value, Value::Bool(_));
        all_date = all_date && matches!(value, Value::Utf8(s) if looks_like_iso_date(s));
    }
    if !any {
        ColumnType::Text
    } else if all_numeric {
        ColumnType::Numeric
    } else if all_date {
        ColumnType::Date
    } else if all_bool {
        ColumnType::Categorical
    } else {
        ColumnType::Text
    }
}

fn looks_like_iso_date(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && [0, 1, 2, 3, 5, 6, 8, 9]
            .iter()
            .all(|&i| bytes[i].is_ascii_digit())
}
