//! End-to-end flows across the whole engine: formula → dependency order →
//! evaluation → metadata → manifest → replay.

use std::collections::BTreeMap;
use std::path::PathBuf;

use dolex::{
    BatchRequest, ColumnSpec, Layer, SourceConfig, Table, TransformMetadata, TransformRequest,
    Value, execute_batch_transform, execute_single_transform, parse, promote_columns,
    read_manifest, replay_manifest, resolve_manifest_path, stringify, write_manifest,
};

const PEOPLE_CSV: &str = concat!(
    "name,age,score,group,joined\n",
    "ada,17,80,a,2021-03-06\n",
    "bob,34,90,b,2022-11-30\n",
    "carol,68,70,a,2020-07-15\n",
    "dan,41,,b,2023-01-02\n",
);

fn spec(create: &str, expr: &str) -> ColumnSpec {
    ColumnSpec {
        create: create.to_owned(),
        expr: expr.to_owned(),
        ty: None,
        partition_by: None,
        filter: None,
    }
}

fn request(create: &str, expr: &str) -> TransformRequest {
    TransformRequest {
        table: "people".to_owned(),
        spec: spec(create, expr),
    }
}

fn temp_manifest(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("dolex-engine-{}-{name}.json", std::process::id()))
}

#[test]
fn formulas_round_trip_through_stringify() {
    let formulas = [
        "row_mean(a, b, c)",
        "cut(age, [0, 18, 65, 100], [\"youth\", \"adult\", \"senior\"])",
        "zscore(score) * 100 + 1",
        "if_else(`First Name` == \"\", \"unknown\", lower(`First Name`))",
        "a + b * c ^ 2 ^ x >= d && !(e || f)",
    ];
    for formula in formulas {
        let ast = parse(formula).expect(formula);
        assert_eq!(
            parse(&stringify(&ast)).expect("reparse"),
            ast,
            "round trip diverged for {formula}"
        );
    }
}

#[test]
fn batch_with_cross_references_produces_consistent_columns() {
    let mut table = Table::from_csv_str(PEOPLE_CSV).expect("table");
    let mut meta = TransformMetadata::new();

    let batch = BatchRequest {
        table: "people".to_owned(),
        transforms: vec![
            // listed out of dependency order on purpose
            spec("age_band_upper", "upper(age_band)"),
            spec(
                "age_band",
                "cut(age, [0, 18, 65, 100], [\"youth\", \"adult\", \"senior\"])",
            ),
        ],
    };
    let outcome = execute_batch_transform(&mut table, &mut meta, &batch).expect("batch");
    assert!(outcome.failed.is_empty());

    assert_eq!(
        table.column_values("age_band").expect("age_band"),
        &[
            Value::from("youth"),
            Value::from("adult"),
            Value::from("senior"),
            Value::from("adult"),
        ]
    );
    assert_eq!(
        table.column_values("age_band_upper").expect("upper"),
        &[
            Value::from("YOUTH"),
            Value::from("ADULT"),
            Value::from("SENIOR"),
            Value::from("ADULT"),
        ]
    );
}

#[test]
fn partitioned_zscore_is_scoped_per_group() {
    let mut table = Table::from_csv_str(PEOPLE_CSV).expect("table");
    let mut meta = TransformMetadata::new();

    let mut partitioned = request("score_z", "zscore(score)");
    partitioned.spec.partition_by = Some("group".to_owned());
    execute_single_transform(&mut table, &mut meta, &partitioned).expect("run");

    // group a: scores 80, 70 -> mean 75, sd 5; group b: only 90 valid
    let values = table.column_values("score_z").expect("score_z");
    assert_eq!(values[0], Value::Number(1.0));
    assert_eq!(values[2], Value::Number(-1.0));
    assert_eq!(values[1], Value::Null, "single valid value has sd 0");
    assert_eq!(values[3], Value::Null, "null score stays null");
}

#[test]
fn promote_write_reload_replay_reproduces_values() {
    let mut table = Table::from_csv_str(PEOPLE_CSV).expect("table");
    let mut meta = TransformMetadata::new();

    execute_single_transform(&mut table, &mut meta, &request("score_filled", "fill_null(score, 0)"))
        .expect("first");
    execute_single_transform(
        &mut table,
        &mut meta,
        &request("score_rank", "percentile_rank(score_filled)"),
    )
    .expect("second");
    // an unpromoted scratch column must not survive the reload
    execute_single_transform(&mut table, &mut meta, &request("scratch", "score_filled + 1"))
        .expect("scratch");

    promote_columns(
        &mut meta,
        "people",
        &["score_filled".to_owned(), "score_rank".to_owned()],
    );

    let path = temp_manifest("replay");
    write_manifest(&meta, &["people"], &path).expect("write");

    let mut reloaded = Table::from_csv_str(PEOPLE_CSV).expect("reload");
    let mut fresh_meta = TransformMetadata::new();
    let manifest = read_manifest(&path).expect("manifest present");
    let report = replay_manifest(&mut reloaded, &mut fresh_meta, &manifest, "people");

    assert_eq!(report.replayed, vec!["score_filled", "score_rank"]);
    assert!(report.skipped.is_empty());
    assert!(!reloaded.has_column("scratch"));

    assert_eq!(
        reloaded.column_values("score_filled").expect("filled"),
        table.column_values("score_filled").expect("filled"),
    );
    assert_eq!(
        reloaded.column_values("score_rank").expect("rank"),
        table.column_values("score_rank").expect("rank"),
    );
    assert_eq!(
        fresh_meta.get_layer("people", "score_rank"),
        Some(Layer::Derived)
    );
}

#[test]
fn working_shadow_over_a_replayed_derived_column() {
    let mut table = Table::from_csv_str(PEOPLE_CSV).expect("table");
    let mut meta = TransformMetadata::new();

    execute_single_transform(&mut table, &mut meta, &request("flag", "score >= 80"))
        .expect("derived run");
    promote_columns(&mut meta, "people", &["flag".to_owned()]);

    // newer, unpromoted override of the same column
    execute_single_transform(&mut table, &mut meta, &request("flag", "score >= 85"))
        .expect("working run");

    let visible = meta.get("people", "flag").expect("record");
    assert_eq!(visible.layer, Layer::Working);
    assert_eq!(visible.expr, "score >= 85");
    assert_eq!(
        meta.get_derived("people", "flag").expect("derived").expr,
        "score >= 80"
    );

    // the manifest still carries only the promoted definition
    let path = temp_manifest("shadow");
    write_manifest(&meta, &["people"], &path).expect("write");
    let manifest = read_manifest(&path).expect("read");
    assert_eq!(manifest.tables["people"][0].expr, "score >= 80");
}

#[test]
fn filters_and_equality_semantics_compose() {
    let mut table = Table::from_csv_str(PEOPLE_CSV).expect("table");
    let mut meta = TransformMetadata::new();

    let mut filtered = request("a_score", "score");
    filtered.spec.filter = Some(BTreeMap::from([("group".to_owned(), Value::from("a"))]));
    execute_single_transform(&mut table, &mut meta, &filtered).expect("run");

    assert_eq!(
        table.column_values("a_score").expect("a_score"),
        &[
            Value::Number(80.0),
            Value::Null,
            Value::Number(70.0),
            Value::Null
        ]
    );
}

#[test]
fn manifest_location_follows_the_source() {
    assert_eq!(
        resolve_manifest_path(&SourceConfig::file("surveys/2024.csv")),
        PathBuf::from("surveys/2024.dolex.json")
    );
    assert_eq!(
        resolve_manifest_path(&SourceConfig::directory("surveys/")),
        PathBuf::from("surveys/.dolex.json")
    );
}
