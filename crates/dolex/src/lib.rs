#![forbid(unsafe_code)]

//! Derived-column transform engine for tabular data.
//!
//! A user-submitted formula string flows through the tokenizer and parser
//! ([`parse`]) into an AST, through dependency analysis (safe ordering,
//! cycle rejection), and into the pipeline
//! ([`execute_single_transform`] / [`execute_batch_transform`]), which
//! evaluates it per row — or per partition slice for window functions —
//! and writes the result into the table alongside a `working`-layer
//! metadata record. Promoted columns persist to a `.dolex.json` sidecar
//! ([`write_manifest`]) and are replayed through the same pipeline on the
//! next load ([`replay_manifest`]).

pub use dx_deps::{
    CycleError, build_dependency_map, extract_column_refs, find_dependents,
    has_circular_dependency, topological_sort,
};
pub use dx_eval::{ColumnEvaluator, is_builtin};
pub use dx_lang::{
    AstNode, BinaryOp, ParseError, Token, TokenKind, TokenizeError, UnaryOp, parse, stringify,
    tokenize,
};
pub use dx_manifest::{
    ManifestData, ManifestEntry, ManifestError, ReplayReport, SkippedEntry, SourceConfig,
    SourceKind, read_manifest, replay_manifest, resolve_manifest_path, write_manifest,
};
pub use dx_pipeline::{
    BatchFailure, BatchOutcome, BatchRequest, ColumnSpec, TransformError, TransformOutcome,
    TransformRequest, execute_batch_transform, execute_single_transform, promote_columns,
    remove_transform,
};
pub use dx_store::{
    Column, Layer, StoreError, Table, TransformMetadata, TransformRecord, infer_column_type,
};
pub use dx_value::{ColumnType, Value, format_number};
