use std::collections::BTreeMap;

use dx_value::ColumnType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Working,
    Derived,
}

/// Bookkeeping record for one transform: the defining expression, declared
/// type, layer, per-table execution sequence, and optional partition key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRecord {
    pub column: String,
    pub expr: String,
    pub ty: ColumnType,
    pub layer: Layer,
    /// Execution sequence within the table; `add` assigns the next value
    /// when absent.
    pub order: Option<u64>,
    pub partition_by: Option<String>,
}

/// Two-slot state machine per column name: a `derived` record (replayed
/// from a manifest) and an optionally shadowing `working` record (a newer,
/// not-yet-promoted override). Reads prefer `working`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LayerSlots {
    working: Option<TransformRecord>,
    derived: Option<TransformRecord>,
}

impl LayerSlots {
    fn slot(&self, layer: Layer) -> &Option<TransformRecord> {
        match layer {
            Layer::Working => &self.working,
            Layer::Derived => &self.derived,
        }
    }

    fn slot_mut(&mut self, layer: Layer) -> &mut Option<TransformRecord> {
        match layer {
            Layer::Working => &mut self.working,
            Layer::Derived => &mut self.derived,
        }
    }

    fn visible(&self) -> Option<&TransformRecord> {
        self.working.as_ref().or(self.derived.as_ref())
    }

    fn is_empty(&self) -> bool {
        self.working.is_none() && self.derived.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TableMeta {
    next_order: u64,
    columns: BTreeMap<String, LayerSlots>,
}

/// Transform definitions per table, independent of the table's actual
/// column data. `(table, column, layer)` is unique; a column holds at most
/// one `working` and one `derived` record at a time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformMetadata {
    tables: BTreeMap<String, TableMeta>,
}

impl TransformMetadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record in its layer slot. Returns the assigned
    /// order (the record's own, or the table's next sequence value when the
    /// record carries none).
    pub fn add(&mut self, table: &str, mut record: TransformRecord) -> u64 {
        let meta = self.tables.entry(table.to_owned()).or_default();
        let order = match record.order {
            Some(order) => {
                meta.next_order = meta.next_order.max(order + 1);
                order
            }
            None => {
                let order = meta.next_order;
                meta.next_order += 1;
                order
            }
        };
        record.order = Some(order);
        let layer = record.layer;
        let slots = meta.columns.entry(record.column.clone()).or_default();
        *slots.slot_mut(layer) = Some(record);
        order
    }

    /// Move a column's record between layers (promotion is
    /// `Working → Derived`). The record's `layer` field follows the move; a
    /// record already occupying the target slot is replaced. Reports
    /// whether a record was actually moved.
    pub fn update_layer(&mut self, table: &str, column: &str, from: Layer, to: Layer) -> bool {
        let Some(slots) = self
            .tables
            .get_mut(table)
            .and_then(|meta| meta.columns.get_mut(column))
        else {
            return false;
        };
        let Some(mut record) = slots.slot_mut(from).take() else {
            return false;
        };
        record.layer = to;
        *slots.slot_mut(to) = Some(record);
        true
    }

    /// Promotion shorthand: working → derived.
    pub fn promote(&mut self, table: &str, column: &str) -> bool {
        self.update_layer(table, column, Layer::Working, Layer::Derived)
    }

    /// Remove one layer's record, or both when `layer` is `None`. Reports
    /// whether anything was removed.
    pub fn remove(&mut self, table: &str, column: &str, layer: Option<Layer>) -> bool {
        let Some(meta) = self.tables.get_mut(table) else {
            return false;
        };
        let Some(slots) = meta.columns.get_mut(column) else {
            return false;
        };
        let removed = match layer {
            Some(layer) => slots.slot_mut(layer).take().is_some(),
            None => {
                let any = !slots.is_empty();
                slots.working = None;
                slots.derived = None;
                any
            }
        };
        if slots.is_empty() {
            meta.columns.remove(column);
        }
        removed
    }

    /// Records for a table ordered by execution sequence. With a `layer`
    /// filter, every record in that layer; without one, the shadowed view
    /// (working preferred over derived, one record per column).
    #[must_use]
    pub fn list(&self, table: &str, layer: Option<Layer>) -> Vec<&TransformRecord> {
        let Some(meta) = self.tables.get(table) else {
            return Vec::new();
        };
        let mut records: Vec<&TransformRecord> = match layer {
            Some(layer) => meta
                .columns
                .values()
                .filter_map(|slots| slots.slot(layer).as_ref())
                .collect(),
            None => meta.columns.values().filter_map(LayerSlots::visible).collect(),
        };
        records.sort_by_key(|record| record.order.unwrap_or(u64::MAX));
        records
    }

    /// The record reads resolve to: working shadows derived.
    #[must_use]
    pub fn get(&self, table: &str, column: &str) -> Option<&TransformRecord> {
        self.tables
            .get(table)
            .and_then(|meta| meta.columns.get(column))
            .and_then(LayerSlots::visible)
    }

    #[must_use]
    pub fn exists(&self, table: &str, column: &str) -> bool {
        self.get(table, column).is_some()
    }

    #[must_use]
    pub fn get_layer(&self, table: &str, column: &str) -> Option<Layer> {
        self.get(table, column).map(|record| record.layer)
    }

    #[must_use]
    pub fn has_derived(&self, table: &str, column: &str) -> bool {
        self.get_derived(table, column).is_some()
    }

    /// The derived record even when a working record shadows it.
    #[must_use]
    pub fn get_derived(&self, table: &str, column: &str) -> Option<&TransformRecord> {
        self.tables
            .get(table)
            .and_then(|meta| meta.columns.get(column))
            .and_then(|slots| slots.derived.as_ref())
    }

    /// Names of all columns with any transform record in the table.
    #[must_use]
    pub fn column_names(&self, table: &str) -> Vec<String> {
        self.tables
            .get(table)
            .map(|meta| meta.columns.keys().cloned().collect())
            .unwrap_or_default()
    }
}
