#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};

use dx_deps::{
    CycleError, build_dependency_map, extract_column_refs, find_dependents, has_circular_dependency,
    topological_sort,
};
use dx_eval::{ColumnEvaluator, is_builtin};
use dx_lang::{AstNode, ParseError, parse};
use dx_store::{Layer, StoreError, Table, TransformMetadata, TransformRecord, infer_column_type};
use dx_value::{ColumnType, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("column '{name}' already exists as a source column")]
    SourceColumnCollision { name: String },
    #[error("partition column '{name}' does not exist")]
    MissingPartitionColumn { name: String },
    #[error("filter field '{name}' does not exist")]
    MissingFilterField { name: String },
    #[error("transform '{column}' references missing columns: {missing:?}")]
    MissingDependencies { column: String, missing: Vec<String> },
    #[error("unknown function '{function}' in transform '{column}'")]
    UnknownFunction { column: String, function: String },
    #[error("duplicate column name in batch: {name}")]
    DuplicateBatchColumn { name: String },
    #[error("no transform exists for column '{name}'")]
    UnknownTransform { name: String },
    #[error("column '{column}' has dependent transforms: {dependents:?}")]
    HasDependents {
        column: String,
        dependents: Vec<String>,
    },
}

/// One derived-column definition: the new column name, its formula, and the
/// optional declared type, partition key, and equality filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub create: String,
    pub expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<ColumnType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRequest {
    pub table: String,
    #[serde(flatten)]
    pub spec: ColumnSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub table: String,
    pub transforms: Vec<ColumnSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformOutcome {
    pub created: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub column: String,
    pub reason: String,
}

/// Batch execution is best-effort: definitional problems abort up front,
/// but a per-column runtime failure leaves earlier columns in place and
/// later entries still run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub created: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

/// Validate and run one transform. Nothing is written until every check
/// passes: source-column collision, unknown builtins, partition and filter
/// existence, missing dependencies, and cycles against the table's existing
/// definitions. The new column lands in the `working` layer.
pub fn execute_single_transform(
    table: &mut Table,
    metadata: &mut TransformMetadata,
    request: &TransformRequest,
) -> Result<TransformOutcome, TransformError> {
    let spec = &request.spec;
    let ast = validate_spec(table, metadata, &request.table, spec)?;

    let rows = filtered_rows(table, spec.filter.as_ref());
    let row_count = rows.len();
    let mut out = vec![Value::Null; table.len()];
    for group in partition_rows(table, rows, spec.partition_by.as_deref()) {
        let mut evaluator = ColumnEvaluator::new(table, group);
        for (row, value) in evaluator.evaluate_rows(&ast) {
            out[row] = value;
        }
    }

    let ty = spec.ty.unwrap_or_else(|| infer_column_type(&out));
    table.insert_column(&spec.create, ty, out)?;
    metadata.add(
        &request.table,
        TransformRecord {
            column: spec.create.clone(),
            expr: spec.expr.clone(),
            ty,
            layer: Layer::Working,
            order: None,
            partition_by: spec.partition_by.clone(),
        },
    );
    debug!(
        table = %request.table,
        column = %spec.create,
        rows = row_count,
        "materialized transform column"
    );

    Ok(TransformOutcome {
        created: vec![spec.create.clone()],
    })
}

/// Run a batch of transforms in dependency order. Duplicate `create` names,
/// unparseable expressions and cyclic batches are rejected before anything
/// executes; a later entry may reference an earlier one regardless of the
/// input order.
pub fn execute_batch_transform(
    table: &mut Table,
    metadata: &mut TransformMetadata,
    request: &BatchRequest,
) -> Result<BatchOutcome, TransformError> {
    let mut seen = BTreeSet::new();
    for spec in &request.transforms {
        if !seen.insert(spec.create.as_str()) {
            return Err(TransformError::DuplicateBatchColumn {
                name: spec.create.clone(),
            });
        }
    }

    let mut batch_defs = Vec::with_capacity(request.transforms.len());
    for spec in &request.transforms {
        batch_defs.push((spec.create.clone(), parse(&spec.expr)?));
    }

    // Existing definitions participate so a redefinition cannot smuggle in
    // an indirect cycle; batch entries override same-name records.
    let mut combined = existing_definitions(metadata, &request.table);
    combined.extend(build_dependency_map(&batch_defs));
    let order = topological_sort(&combined)?;

    let by_name: HashMap<&str, &ColumnSpec> = request
        .transforms
        .iter()
        .map(|spec| (spec.create.as_str(), spec))
        .collect();

    let mut outcome = BatchOutcome::default();
    for name in &order {
        let Some(spec) = by_name.get(name.as_str()) else {
            continue;
        };
        let single = TransformRequest {
            table: request.table.clone(),
            spec: (*spec).clone(),
        };
        match execute_single_transform(table, metadata, &single) {
            Ok(result) => outcome.created.extend(result.created),
            Err(err) => {
                warn!(
                    table = %request.table,
                    column = %spec.create,
                    error = %err,
                    "batch transform entry failed; continuing"
                );
                outcome.failed.push(BatchFailure {
                    column: spec.create.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
    Ok(outcome)
}

/// Flip `working` records to `derived` for each named column, returning the
/// columns actually promoted.
pub fn promote_columns(
    metadata: &mut TransformMetadata,
    table: &str,
    columns: &[String],
) -> Vec<String> {
    columns
        .iter()
        .filter(|column| metadata.promote(table, column))
        .cloned()
        .collect()
}

/// Remove a transform column entirely (both layers and the table data).
/// Refuses while other transforms reference it.
pub fn remove_transform(
    table: &mut Table,
    metadata: &mut TransformMetadata,
    table_name: &str,
    column: &str,
) -> Result<(), TransformError> {
    if !metadata.exists(table_name, column) {
        return Err(TransformError::UnknownTransform {
            name: column.to_owned(),
        });
    }
    let definitions = existing_definitions(metadata, table_name);
    let dependents = find_dependents(column, &definitions);
    if !dependents.is_empty() {
        return Err(TransformError::HasDependents {
            column: column.to_owned(),
            dependents,
        });
    }
    metadata.remove(table_name, column, None);
    table.remove_column(column);
    Ok(())
}

fn validate_spec(
    table: &Table,
    metadata: &TransformMetadata,
    table_name: &str,
    spec: &ColumnSpec,
) -> Result<AstNode, TransformError> {
    // Source columns (table columns with no transform record) are never
    // overwritten; transform columns may be redefined.
    if table.has_column(&spec.create) && !metadata.exists(table_name, &spec.create) {
        return Err(TransformError::SourceColumnCollision {
            name: spec.create.clone(),
        });
    }

    let ast = parse(&spec.expr)?;

    if let Some(function) = first_unknown_function(&ast) {
        return Err(TransformError::UnknownFunction {
            column: spec.create.clone(),
            function,
        });
    }

    if let Some(partition) = &spec.partition_by {
        if !table.has_column(partition) {
            return Err(TransformError::MissingPartitionColumn {
                name: partition.clone(),
            });
        }
    }

    if let Some(filter) = &spec.filter {
        for field in filter.keys() {
            if !table.has_column(field) {
                return Err(TransformError::MissingFilterField {
                    name: field.clone(),
                });
            }
        }
    }

    let refs = extract_column_refs(&ast);
    let missing: Vec<String> = refs
        .iter()
        .filter(|name| !table.has_column(name) && name.as_str() != spec.create)
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(TransformError::MissingDependencies {
            column: spec.create.clone(),
            missing,
        });
    }

    let mut definitions = existing_definitions(metadata, table_name);
    definitions.insert(spec.create.clone(), refs);
    if has_circular_dependency(&definitions) {
        return Err(TransformError::Cycle(CycleError::Circular {
            column: spec.create.clone(),
        }));
    }

    Ok(ast)
}

/// Dependency map of the table's current transform records (working
/// shadowing derived). Records whose stored expression no longer parses are
/// skipped; they were validated when created.
fn existing_definitions(
    metadata: &TransformMetadata,
    table_name: &str,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut definitions = BTreeMap::new();
    for record in metadata.list(table_name, None) {
        if let Ok(ast) = parse(&record.expr) {
            definitions.insert(record.column.clone(), extract_column_refs(&ast));
        }
    }
    definitions
}

fn first_unknown_function(node: &AstNode) -> Option<String> {
    match node {
        AstNode::Call { name, args } => {
            if !is_builtin(name) {
                return Some(name.clone());
            }
            args.iter().find_map(first_unknown_function)
        }
        AstNode::Unary { operand, .. } => first_unknown_function(operand),
        AstNode::Binary { left, right, .. } => {
            first_unknown_function(left).or_else(|| first_unknown_function(right))
        }
        AstNode::Array { elements } => elements.iter().find_map(first_unknown_function),
        AstNode::Number { .. }
        | AstNode::Str { .. }
        | AstNode::Bool { .. }
        | AstNode::ColumnRef { .. } => None,
    }
}

fn filtered_rows(table: &Table, filter: Option<&BTreeMap<String, Value>>) -> Vec<usize> {
    let rows = 0..table.len();
    match filter {
        None => rows.collect(),
        Some(filter) => rows
            .filter(|&row| {
                filter.iter().all(|(field, expected)| {
                    table
                        .value(row, field)
                        .unwrap_or(&Value::Null)
                        .strict_eq(expected)
                })
            })
            .collect(),
    }
}

/// Group rows by the partition column's cell value, preserving first-seen
/// group order and the row order within each group. Without a partition
/// key the whole scope is one group.
fn partition_rows(table: &Table, rows: Vec<usize>, partition_by: Option<&str>) -> Vec<Vec<usize>> {
    let Some(partition) = partition_by else {
        return vec![rows];
    };
    let mut ordering: Vec<PartitionKey> = Vec::new();
    let mut groups: HashMap<PartitionKey, Vec<usize>> = HashMap::new();
    for row in rows {
        let key = PartitionKey::from_value(table.value(row, partition).unwrap_or(&Value::Null));
        match groups.get_mut(&key) {
            Some(group) => group.push(row),
            None => {
                ordering.push(key.clone());
                groups.insert(key, vec![row]);
            }
        }
    }
    ordering
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect()
}

/// Hashable projection of a cell value for partition grouping; floats key
/// by bit pattern.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum PartitionKey {
    Null,
    Bool(bool),
    NumberBits(u64),
    Utf8(String),
}

impl PartitionKey {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(v) => Self::Bool(*v),
            Value::Number(v) => Self::NumberBits(v.to_bits()),
            Value::Utf8(v) => Self::Utf8(v.clone()),
        }
    }
}
