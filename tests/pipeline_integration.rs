use std::fs;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

use emission_sentinel::analysis::trend::{train_test_split, TrendInputs};
use emission_sentinel::data::loader::{read_table, ReadOptions};
use emission_sentinel::data::model::{Table, Value};
use emission_sentinel::{
    Artifact, ArtifactLayout, FallbackPolicy, Pipeline, PipelineConfig, PipelineError, Stage,
    SubmissionId,
};

const RAW_HEADER: &str = "Facility Id,Facility Name,Reporting Year,Unit CO2 emissions (non-biogenic) ";

/// Ten years of a flat 100 with one 500 placed in the held-out partition.
fn outlier_input(dir: &Path) -> (std::path::PathBuf, usize) {
    let outlier = train_test_split(10, 0.2, 42).test[0];
    let mut csv = String::from(RAW_HEADER);
    csv.push('\n');
    for i in 0..10 {
        let value = if i == outlier { 500 } else { 100 };
        csv.push_str(&format!("{},Plant {},{},{}\n", 1000 + i, i, 2015 + i, value));
    }
    let path = dir.join("submission.csv");
    fs::write(&path, csv).unwrap();
    (path, outlier)
}

fn config(root: &Path, input: Option<&Path>, id: Option<&str>) -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.artifacts.root = root.to_path_buf();
    cfg.input.path = input.map(Path::to_path_buf);
    cfg.submission_id = id.map(|s| SubmissionId::new(s).unwrap());
    cfg
}

fn bool_column(table: &Table, name: &str) -> Vec<bool> {
    let idx = table.column_index(name).unwrap();
    table.column(idx).map(|v| v.as_bool().unwrap()).collect()
}

#[test]
fn outlier_is_the_only_flag_and_is_anomalous() {
    let dir = tempfile::tempdir().unwrap();
    let (input, outlier) = outlier_input(dir.path());
    let pipeline = Pipeline::new(config(dir.path(), Some(&input), Some("42"))).unwrap();

    let report = pipeline.run().unwrap();
    assert_eq!(report.flagged, 1);
    assert_eq!(report.submission_id.as_deref(), Some("42"));

    let anomalies_path = pipeline.store().write_path(Artifact::Anomalies);
    assert!(anomalies_path.ends_with("tables/final_output_with_anomalies_42.csv"));
    let table = read_table(&anomalies_path, &ReadOptions::default()).unwrap();
    assert_eq!(table.len(), 10);

    let flagged = bool_column(&table, "flagged");
    for (i, f) in flagged.iter().enumerate() {
        assert_eq!(*f, i == outlier, "flagged mismatch at row {i}");
    }
    assert!(bool_column(&table, "is_anomaly")[outlier]);

    let summary = fs::read_to_string(pipeline.store().write_path(Artifact::Summary)).unwrap();
    assert!(summary.contains("Out of 10 records, 1 were flagged"));
    assert!(summary.contains(&format!("Facility {} reported 500 vs predicted 100", 1000 + outlier)));

    let report_json = fs::read_to_string(pipeline.store().write_path(Artifact::RunReport)).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&report_json).unwrap();
    assert_eq!(parsed["flagged"], 1);
    assert_eq!(parsed["stages"].as_array().unwrap().len(), Stage::ALL.len());
}

#[test]
fn reruns_produce_identical_tables() {
    let dir = tempfile::tempdir().unwrap();
    let (input, _) = outlier_input(dir.path());
    let cfg = config(dir.path(), Some(&input), Some("7"));

    let first = Pipeline::new(cfg.clone()).unwrap();
    first.run().unwrap();
    let flagged = fs::read(first.store().write_path(Artifact::Flagged)).unwrap();
    let anomalies = fs::read(first.store().write_path(Artifact::Anomalies)).unwrap();

    let second = Pipeline::new(cfg).unwrap();
    second.run().unwrap();
    assert_eq!(fs::read(second.store().write_path(Artifact::Flagged)).unwrap(), flagged);
    assert_eq!(fs::read(second.store().write_path(Artifact::Anomalies)).unwrap(), anomalies);
}

#[test]
fn legacy_fallback_is_opt_in() {
    let dir = tempfile::tempdir().unwrap();
    let (input, _) = outlier_input(dir.path());

    // An unscoped run leaves legacy artifacts behind.
    let legacy = Pipeline::new(config(dir.path(), Some(&input), None)).unwrap();
    legacy.run_stage(Stage::Clean).unwrap();
    let legacy_cleaned = legacy.store().write_path(Artifact::Cleaned);

    let strict = Pipeline::new(config(dir.path(), None, Some("42"))).unwrap();
    match strict.run_stage(Stage::Features) {
        Err(PipelineError::MissingArtifact { stage, attempted }) => {
            assert_eq!(stage, "features");
            assert_eq!(attempted, vec![strict.store().write_path(Artifact::Cleaned)]);
        }
        other => panic!("expected MissingArtifact, got {other:?}"),
    }

    let mut cfg = config(dir.path(), None, Some("42"));
    cfg.artifacts.fallback = FallbackPolicy::Legacy;
    let lenient = Pipeline::new(cfg).unwrap();
    assert_eq!(lenient.resolve_input(Stage::Features).unwrap(), legacy_cleaned);
    let report = lenient.run_stage(Stage::Features).unwrap();
    assert_eq!(report.input.as_deref(), Some(legacy_cleaned.as_path()));
    assert_eq!(report.outputs, vec![lenient.store().write_path(Artifact::Features)]);
}

#[test]
fn submissions_do_not_see_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let (input, _) = outlier_input(dir.path());

    Pipeline::new(config(dir.path(), Some(&input), Some("a")))
        .unwrap()
        .run()
        .unwrap();

    let other = Pipeline::new(config(dir.path(), None, Some("b"))).unwrap();
    assert!(matches!(
        other.run_stage(Stage::Trend),
        Err(PipelineError::MissingArtifact { .. })
    ));
}

#[test]
fn directory_layout_nests_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let (input, _) = outlier_input(dir.path());
    let mut cfg = config(dir.path(), Some(&input), Some("run-1"));
    cfg.artifacts.layout = ArtifactLayout::Directory;

    let pipeline = Pipeline::new(cfg).unwrap();
    pipeline.run().unwrap();
    assert!(dir.path().join("run-1/tables/flagged_emissions_output.csv").is_file());
    assert!(dir.path().join("run-1/models/trend_model.json").is_file());
    assert!(dir.path().join("run-1/logs/weekly_summary_anomalies.txt").is_file());
}

#[test]
fn latin1_names_survive_cleaning() {
    let dir = tempfile::tempdir().unwrap();
    let mut bytes = format!("{RAW_HEADER}\n").into_bytes();
    for i in 0..6 {
        bytes.extend_from_slice(format!("{},Caf", 10 + i).as_bytes());
        bytes.push(0xE9); // é in Latin-1
        bytes.extend_from_slice(format!(",{},{}\n", 2018 + i, 50 + i).as_bytes());
    }
    let input = dir.path().join("latin1.csv");
    fs::write(&input, bytes).unwrap();

    let pipeline = Pipeline::new(config(dir.path(), Some(&input), None)).unwrap();
    pipeline.run_stage(Stage::Clean).unwrap();

    let cleaned = read_table(
        &pipeline.store().write_path(Artifact::Cleaned),
        &ReadOptions::default(),
    )
    .unwrap();
    assert_eq!(cleaned.columns[1], "facility_name");
    assert_eq!(cleaned.rows[0][1], Value::Text("Café".to_string()));
}

#[test]
fn rows_with_missing_cells_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let csv = format!(
        "{RAW_HEADER}\n1,A,2015,10\n2,B,2016,\n3,,2017,30\n4,D,2018,40\n5,E,2019,NA\n"
    );
    let input = dir.path().join("gaps.csv");
    fs::write(&input, csv).unwrap();

    let pipeline = Pipeline::new(config(dir.path(), Some(&input), None)).unwrap();
    let report = pipeline.run_stage(Stage::Clean).unwrap();
    assert_eq!((report.rows_in, report.rows_out), (5, 2));
}

#[test]
fn parquet_input_runs_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let schema = Arc::new(Schema::new(vec![
        Field::new("Reporting Year", DataType::Int64, false),
        Field::new("Unit CO2 emissions (non-biogenic) ", DataType::Float64, true),
    ]));
    let years: Vec<i64> = (2010..2022).collect();
    let values: Vec<f64> = (0..12).map(|i| 200.0 + 5.0 * i as f64).collect();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(years)),
            Arc::new(Float64Array::from(values)),
        ],
    )
    .unwrap();
    let input = dir.path().join("submission.parquet");
    let mut writer = ArrowWriter::try_new(fs::File::create(&input).unwrap(), schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();

    let report = Pipeline::new(config(dir.path(), Some(&input), Some("pq")))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(report.stages[0].rows_out, 12);
    // an exact line leaves nothing to flag
    assert_eq!(report.flagged, 0);
    assert_eq!(report.yearly_alerts, 0);
}

#[test]
fn year_features_model_has_three_slopes() {
    let dir = tempfile::tempdir().unwrap();
    let values = [100, 120, 90, 130, 110, 150, 95, 140, 125, 160, 105, 170];
    let mut csv = String::from(RAW_HEADER);
    csv.push('\n');
    for (i, v) in values.iter().enumerate() {
        csv.push_str(&format!("{},Plant {i},{},{v}\n", 500 + i, 2010 + i));
    }
    let input = dir.path().join("features.csv");
    fs::write(&input, csv).unwrap();

    let mut cfg = config(dir.path(), Some(&input), Some("yf"));
    cfg.trend.inputs = TrendInputs::YearFeatures;
    let pipeline = Pipeline::new(cfg).unwrap();
    let report = pipeline.run().unwrap();
    assert_eq!(report.stages[1].rows_out, values.len());

    let json = fs::read_to_string(pipeline.store().write_path(Artifact::TrendModel)).unwrap();
    let model: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(model["inputs"], "year-features");
    assert_eq!(model["coefficients"].as_array().unwrap().len(), 3);
    assert_eq!(model["train_rows"], 9);
    assert_eq!(model["test_rows"], 3);
}

#[test]
fn missing_input_artifact_names_the_stage() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(config(dir.path(), None, Some("42"))).unwrap();
    match pipeline.run_stage(Stage::Summary) {
        Err(PipelineError::MissingArtifact { stage, attempted }) => {
            assert_eq!(stage, "summary");
            assert_eq!(attempted.len(), 1);
        }
        other => panic!("expected MissingArtifact, got {other:?}"),
    }
}
