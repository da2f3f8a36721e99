#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use dx_pipeline::{ColumnSpec, TransformRequest, execute_single_transform};
use dx_store::{Layer, Table, TransformMetadata};
use dx_value::ColumnType;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const MANIFEST_VERSION: u32 = 1;

/// Sidecar file name component: `data.csv` gets `data.dolex.json`, a
/// directory source gets `.dolex.json` inside it.
const FILE_SUFFIX: &str = "dolex.json";
const DIRECTORY_MANIFEST: &str = ".dolex.json";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    File,
    Directory,
}

/// Data-source descriptor, used only to derive the manifest location. This
/// crate never reads the source itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub path: PathBuf,
    pub kind: SourceKind,
}

impl SourceConfig {
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: SourceKind::File,
        }
    }

    #[must_use]
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: SourceKind::Directory,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub column: String,
    pub expr: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(rename = "partitionBy", default, skip_serializing_if = "Option::is_none")]
    pub partition_by: Option<String>,
}

/// On-disk manifest shape. The per-table entry lists are stored in safe
/// replay order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestData {
    pub version: u32,
    pub tables: BTreeMap<String, Vec<ManifestEntry>>,
}

/// Derive the sidecar path from the source location. A single file
/// `x.csv` maps to `x.dolex.json`; a directory maps to `.dolex.json`
/// inside it (a trailing slash or an extension-less directory path are both
/// tolerated).
#[must_use]
pub fn resolve_manifest_path(source: &SourceConfig) -> PathBuf {
    match source.kind {
        SourceKind::File => {
            let mut path = source.path.clone();
            path.set_extension(FILE_SUFFIX);
            path
        }
        SourceKind::Directory => {
            // `join` ignores a trailing separator on the base path.
            source.path.join(DIRECTORY_MANIFEST)
        }
    }
}

/// Read a manifest, degrading to `None` for a missing file, empty file,
/// invalid JSON, or an unsupported version. A stale or corrupt manifest
/// must never prevent the data source from loading.
#[must_use]
pub fn read_manifest(path: &Path) -> Option<ManifestData> {
    let raw = fs::read_to_string(path).ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    let manifest: ManifestData = match serde_json::from_str(&raw) {
        Ok(manifest) => manifest,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable manifest");
            return None;
        }
    };
    if manifest.version != MANIFEST_VERSION {
        warn!(
            path = %path.display(),
            version = manifest.version,
            "ignoring manifest with unsupported version"
        );
        return None;
    }
    Some(manifest)
}

/// Serialize the named tables' derived-layer records (in stored order) and
/// overwrite the manifest file wholesale. Working columns are never
/// persisted; tables without derived columns are omitted.
pub fn write_manifest(
    metadata: &TransformMetadata,
    tables: &[&str],
    path: &Path,
) -> Result<(), ManifestError> {
    let mut out = ManifestData {
        version: MANIFEST_VERSION,
        tables: BTreeMap::new(),
    };
    for table in tables {
        let entries: Vec<ManifestEntry> = metadata
            .list(table, Some(Layer::Derived))
            .into_iter()
            .map(|record| ManifestEntry {
                column: record.column.clone(),
                expr: record.expr.clone(),
                ty: record.ty,
                partition_by: record.partition_by.clone(),
            })
            .collect();
        if !entries.is_empty() {
            out.tables.insert((*table).to_owned(), entries);
        }
    }
    let rendered = serde_json::to_string_pretty(&out)?;
    fs::write(path, rendered)?;
    debug!(path = %path.display(), tables = out.tables.len(), "wrote manifest");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub column: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub replayed: Vec<String>,
    pub skipped: Vec<SkippedEntry>,
}

/// Re-execute a table's manifest entries, in stored order, against a
/// freshly loaded table. Each success restores its `derived` layer so
/// later entries can reference it; each failure (missing columns after a
/// schema change, and so on) is recorded and replay continues.
pub fn replay_manifest(
    table: &mut Table,
    metadata: &mut TransformMetadata,
    manifest: &ManifestData,
    table_name: &str,
) -> ReplayReport {
    let mut report = ReplayReport::default();
    let Some(entries) = manifest.tables.get(table_name) else {
        return report;
    };
    for entry in entries {
        let request = TransformRequest {
            table: table_name.to_owned(),
            spec: ColumnSpec {
                create: entry.column.clone(),
                expr: entry.expr.clone(),
                ty: Some(entry.ty),
                partition_by: entry.partition_by.clone(),
                filter: None,
            },
        };
        match execute_single_transform(table, metadata, &request) {
            Ok(_) => {
                metadata.update_layer(table_name, &entry.column, Layer::Working, Layer::Derived);
                report.replayed.push(entry.column.clone());
            }
            Err(err) => {
                warn!(
                    table = table_name,
                    column = %entry.column,
                    error = %err,
                    "skipping manifest entry during replay"
                );
                report.skipped.push(SkippedEntry {
                    column: entry.column.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::PathBuf;

    use dx_pipeline::{ColumnSpec, TransformRequest, execute_single_transform, promote_columns};
    use dx_store::{Layer, Table, TransformMetadata};
    use dx_value::{ColumnType, Value};

    use super::{
        ManifestData, ManifestEntry, SourceConfig, read_manifest, replay_manifest,
        resolve_manifest_path, write_manifest,
    };

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("dolex-manifest-{}-{name}", std::process::id()))
    }

    fn run(table: &mut Table, meta: &mut TransformMetadata, create: &str, expr: &str) {
        let request = TransformRequest {
            table: "scores".to_owned(),
            spec: ColumnSpec {
                create: create.to_owned(),
                expr: expr.to_owned(),
                ty: None,
                partition_by: None,
                filter: None,
            },
        };
        execute_single_transform(table, meta, &request).expect(expr);
    }

    #[test]
    fn manifest_path_resolution_covers_files_and_directories() {
        assert_eq!(
            resolve_manifest_path(&SourceConfig::file("data/scores.csv")),
            PathBuf::from("data/scores.dolex.json")
        );
        assert_eq!(
            resolve_manifest_path(&SourceConfig::file("scores")),
            PathBuf::from("scores.dolex.json")
        );
        assert_eq!(
            resolve_manifest_path(&SourceConfig::directory("data/warehouse")),
            PathBuf::from("data/warehouse/.dolex.json")
        );
        assert_eq!(
            resolve_manifest_path(&SourceConfig::directory("data/warehouse/")),
            PathBuf::from("data/warehouse/.dolex.json")
        );
    }

    #[test]
    fn unreadable_manifests_degrade_to_none() {
        assert_eq!(read_manifest(&temp_path("does-not-exist")), None);

        let empty = temp_path("empty");
        fs::write(&empty, "  \n").expect("write");
        assert_eq!(read_manifest(&empty), None);

        let junk = temp_path("junk");
        fs::write(&junk, "{not json").expect("write");
        assert_eq!(read_manifest(&junk), None);

        let wrong_version = temp_path("wrong-version");
        fs::write(&wrong_version, r#"{"version": 9, "tables": {}}"#).expect("write");
        assert_eq!(read_manifest(&wrong_version), None);
    }

    #[test]
    fn write_persists_only_derived_records() {
        let mut table = Table::from_csv_str("score\n80\n90\n70\n").expect("table");
        let mut meta = TransformMetadata::new();
        run(&mut table, &mut meta, "doubled", "score * 2");
        run(&mut table, &mut meta, "scratch", "score + 1");
        promote_columns(&mut meta, "scores", &["doubled".to_owned()]);

        let path = temp_path("write-derived");
        write_manifest(&meta, &["scores"], &path).expect("write");
        let manifest = read_manifest(&path).expect("read back");

        let entries = &manifest.tables["scores"];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].column, "doubled");
        assert_eq!(entries[0].expr, "score * 2");
        assert_eq!(entries[0].ty, ColumnType::Numeric);
    }

    #[test]
    fn manifest_json_uses_the_documented_field_names() {
        let manifest = ManifestData {
            version: 1,
            tables: BTreeMap::from([(
                "t".to_owned(),
                vec![ManifestEntry {
                    column: "z".to_owned(),
                    expr: "zscore(score)".to_owned(),
                    ty: ColumnType::Numeric,
                    partition_by: Some("group".to_owned()),
                }],
            )]),
        };
        let json = serde_json::to_value(&manifest).expect("serialize");
        assert_eq!(json["tables"]["t"][0]["type"], "numeric");
        assert_eq!(json["tables"]["t"][0]["partitionBy"], "group");
    }

    #[test]
    fn replay_reproduces_derived_values() {
        let csv = "score\n80\n90\n70\n";
        let mut table = Table::from_csv_str(csv).expect("table");
        let mut meta = TransformMetadata::new();
        run(&mut table, &mut meta, "doubled", "score * 2");
        promote_columns(&mut meta, "scores", &["doubled".to_owned()]);

        let path = temp_path("replay-idempotent");
        write_manifest(&meta, &["scores"], &path).expect("write");
        let manifest = read_manifest(&path).expect("read");

        // fresh load of the same source
        let mut fresh_table = Table::from_csv_str(csv).expect("table");
        let mut fresh_meta = TransformMetadata::new();
        let report = replay_manifest(&mut fresh_table, &mut fresh_meta, &manifest, "scores");

        assert_eq!(report.replayed, vec!["doubled"]);
        assert!(report.skipped.is_empty());
        assert_eq!(
            fresh_table.column_values("doubled").expect("column"),
            &[
                Value::Number(160.0),
                Value::Number(180.0),
                Value::Number(140.0)
            ]
        );
        assert_eq!(
            fresh_meta.get_layer("scores", "doubled"),
            Some(Layer::Derived)
        );
    }

    #[test]
    fn replay_lets_later_entries_reference_earlier_ones() {
        let manifest = ManifestData {
            version: 1,
            tables: BTreeMap::from([(
                "scores".to_owned(),
                vec![
                    ManifestEntry {
                        column: "b".to_owned(),
                        expr: "a + 1".to_owned(),
                        ty: ColumnType::Numeric,
                        partition_by: None,
                    },
                    ManifestEntry {
                        column: "c".to_owned(),
                        expr: "b + 1".to_owned(),
                        ty: ColumnType::Numeric,
                        partition_by: None,
                    },
                ],
            )]),
        };
        let mut table = Table::from_csv_str("a\n1\n2\n").expect("table");
        let mut meta = TransformMetadata::new();
        let report = replay_manifest(&mut table, &mut meta, &manifest, "scores");
        assert_eq!(report.replayed, vec!["b", "c"]);
        assert_eq!(
            table.column_values("c").expect("c"),
            &[Value::Number(3.0), Value::Number(4.0)]
        );
    }

    #[test]
    fn replay_skips_broken_entries_and_continues() {
        let manifest = ManifestData {
            version: 1,
            tables: BTreeMap::from([(
                "scores".to_owned(),
                vec![
                    ManifestEntry {
                        column: "broken".to_owned(),
                        expr: "vanished_column * 2".to_owned(),
                        ty: ColumnType::Numeric,
                        partition_by: None,
                    },
                    ManifestEntry {
                        column: "valid".to_owned(),
                        expr: "score + 5".to_owned(),
                        ty: ColumnType::Numeric,
                        partition_by: None,
                    },
                ],
            )]),
        };
        let mut table = Table::from_csv_str("score\n10\n").expect("table");
        let mut meta = TransformMetadata::new();
        let report = replay_manifest(&mut table, &mut meta, &manifest, "scores");

        assert_eq!(report.replayed, vec!["valid"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].column, "broken");
        assert!(report.skipped[0].reason.contains("vanished_column"));
        assert_eq!(
            table.column_values("valid").expect("valid"),
            &[Value::Number(15.0)]
        );
        assert!(!table.has_column("broken"));
    }

    #[test]
    fn replay_of_an_unknown_table_is_a_clean_no_op() {
        let manifest = ManifestData {
            version: 1,
            tables: BTreeMap::new(),
        };
        let mut table = Table::from_csv_str("a\n1\n").expect("table");
        let mut meta = TransformMetadata::new();
        let report = replay_manifest(&mut table, &mut meta, &manifest, "scores");
        assert!(report.replayed.is_empty());
        assert!(report.skipped.is_empty());
    }
}
