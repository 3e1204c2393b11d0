use std::fs;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use jobset_core::UnifyError;
use jobset_sync::{run_slim, DocumentState, UnifyConfig, UnifyPipeline};
use serde_json::{json, Value as JsonValue};

fn sample_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample")
}

fn copy_sample(into: &Path, skip: Option<&str>) {
    for entry in fs::read_dir(sample_dir()).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name();
        if Some(name.to_string_lossy().as_ref()) == skip {
            continue;
        }
        fs::copy(entry.path(), into.join(name)).unwrap();
    }
}

fn sample_config(work: &Path) -> UnifyConfig {
    let mut config = UnifyConfig::for_data_dir(sample_dir());
    config.output = work.join("unified_jobs.json");
    config.slim_output = work.join("jobs_dataset.json");
    config
}

fn read(path: &Path) -> JsonValue {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn sample_run_writes_the_unified_document() {
    let work = tempfile::tempdir().unwrap();
    let config = sample_config(work.path());
    let generated_at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).single().unwrap();

    let summary = UnifyPipeline::new(config.clone()).run_at(generated_at).unwrap();
    assert_eq!(summary.total_jobs, 5);
    assert_eq!(summary.active_jobs, 3);
    assert_eq!(summary.archived_jobs, 2);
    assert_eq!(summary.total_employers, 3);
    assert_eq!(summary.total_jobsources, 2);
    assert_eq!(summary.parse_failures, 1);
    assert_eq!(summary.unresolved_employers, 2);
    assert_eq!(summary.unresolved_sources, 2);

    let bytes = fs::read(&config.output).unwrap();
    assert_eq!(bytes.len(), summary.bytes);
    assert_eq!(jobset_storage::sha256_hex(&bytes), summary.sha256);

    let doc = read(&config.output);
    let top = doc.as_object().unwrap().keys().cloned().collect::<Vec<_>>();
    assert_eq!(top, vec!["metadata", "employers", "jobsources", "jobs"]);
    assert_eq!(doc["metadata"]["total_jobs"], json!(5));
    assert_eq!(doc["metadata"]["include_embeddings"], json!(false));
    assert_eq!(doc["employers"][0]["logo_url"], json!("logos\\acme.png"));

    let jobs = doc["jobs"].as_array().unwrap();
    let first = &jobs[0];
    assert_eq!(first["employer"], json!({"id": 10, "name": "Acme GmbH", "alt_name": "ACME", "logo_url": "logos\\acme.png"}));
    assert_eq!(first["jobsource"]["jobsource"], json!("Website"));
    assert!(first.get("job_embedding").is_none());
    assert!(first.get("original_id").is_none());
    assert_eq!(first["CategorizedData"], json!({"Kategorie": ["IT"], "Adresse": "Berlin"}));

    let second = &jobs[1];
    assert_eq!(second["employer"]["name"], json!("Hochschule Nord"));
    assert_eq!(second["jobsource"], JsonValue::Null);
    assert_eq!(second.get("jobsource_id"), Some(&JsonValue::Null));
    assert_eq!(second["CategorizedData"], JsonValue::Null);
    assert!(second["job_title"].as_str().unwrap().contains("Öffentlichkeitsarbeit"));

    let third = &jobs[2];
    assert_eq!(third["employer"], JsonValue::Null);
    assert_eq!(third["employer_id"], json!(999));
    assert_eq!(third["jobsource_id"], json!(7));
    assert_eq!(third["created_at"], JsonValue::Null);

    assert_eq!(jobs[3]["source_table"], json!("archived"));
    assert_eq!(jobs[3]["original_id"], json!(99));
    assert!(jobs[4].get("original_id").is_none());
    assert_eq!(jobs[4]["employer_id"], JsonValue::Null);

    let text = String::from_utf8(bytes).unwrap();
    assert!(text.contains("Jobbörse"));
}

#[test]
fn repeated_runs_are_byte_identical_with_a_pinned_timestamp() {
    let work = tempfile::tempdir().unwrap();
    let config = sample_config(work.path());
    let generated_at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).single().unwrap();
    let pipeline = UnifyPipeline::new(config.clone());

    let first = pipeline.run_at(generated_at).unwrap();
    let second = pipeline.run_at(generated_at).unwrap();
    assert_eq!(first.sha256, second.sha256);

    let mut unpinned = read(&config.output);
    pipeline.run_once().unwrap();
    let mut latest = read(&config.output);
    unpinned["metadata"]["generated_at"] = JsonValue::Null;
    latest["metadata"]["generated_at"] = JsonValue::Null;
    assert_eq!(unpinned, latest);
}

#[test]
fn slim_run_projects_the_unified_document() {
    let work = tempfile::tempdir().unwrap();
    let config = sample_config(work.path());
    UnifyPipeline::new(config.clone()).run_once().unwrap();

    let summary = run_slim(&config.output, &config.slim_output).unwrap();
    assert_eq!(summary.total_jobs, 5);
    assert_eq!(summary.total_employers, 3);

    let full = read(&config.output);
    let slim = read(&config.slim_output);
    assert!(slim.get("metadata").is_none());
    assert_eq!(slim["employers"], full["employers"]);
    for (full_job, slim_job) in full["jobs"].as_array().unwrap().iter().zip(slim["jobs"].as_array().unwrap()) {
        let mut expected = full_job.clone();
        expected.as_object_mut().unwrap().shift_remove("CategorizedData");
        assert_eq!(slim_job, &expected);
    }

    let mut state = DocumentState::load(&config.slim_output).unwrap();
    assert_eq!(state.stats().with_metadata, 0);
    assert!(state.set_categorized_data(3, json!("{\"Kategorie\": [\"Technik\"]}")).unwrap());
    state.save(&config.slim_output).unwrap();
    let reloaded = DocumentState::load(&config.slim_output).unwrap();
    assert_eq!(reloaded.export_with_metadata()["jobs"][0]["id"], json!(3));
}

#[test]
fn slim_run_rejects_documents_without_collections() {
    let work = tempfile::tempdir().unwrap();
    let input = work.path().join("broken.json");
    fs::write(&input, r#"{"metadata": {}, "employers": [], "jobs": []}"#).unwrap();
    let output = work.path().join("slim.json");

    let err = run_slim(&input, &output).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<UnifyError>(),
        Some(UnifyError::ProjectionSourceInvalid { missing }) if missing == "jobsources"
    ));
    assert!(!output.exists());
}

#[test]
fn missing_source_aborts_before_writing() {
    let work = tempfile::tempdir().unwrap();
    copy_sample(work.path(), Some("employers_rows.csv"));
    let config = UnifyConfig::for_data_dir(work.path());

    let err = UnifyPipeline::new(config.clone()).run_once().unwrap_err();
    match err.downcast_ref::<UnifyError>() {
        Some(UnifyError::SourceNotFound { source_name, path }) => {
            assert_eq!(source_name, "employers");
            assert!(path.ends_with("employers_rows.csv"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(format!("{err:#}").contains("employers"));
    assert!(!config.output.exists());
}

#[test]
fn ragged_tier_is_reported_as_malformed() {
    let work = tempfile::tempdir().unwrap();
    copy_sample(work.path(), None);
    fs::write(
        work.path().join("jobs_archiviert_rows.csv"),
        "id,original_id,job_title\n100,99,Bau\n101,,Marketing,extra\n",
    )
    .unwrap();
    let config = UnifyConfig::for_data_dir(work.path());

    let err = UnifyPipeline::new(config.clone()).run_once().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<UnifyError>(),
        Some(UnifyError::SourceMalformed { source_name, .. }) if source_name == "jobs_archiviert"
    ));
    assert!(!config.output.exists());
}

#[test]
fn registry_file_adds_a_third_tier() {
    let work = tempfile::tempdir().unwrap();
    copy_sample(work.path(), None);
    fs::write(
        work.path().join("jobs_2019_rows.csv"),
        "id,original_id,titel,employer_id,jobsource_id\n500,12,Gärtnerei,12,2\n",
    )
    .unwrap();
    fs::write(
        work.path().join("tiers.yaml"),
        r#"tiers:
  - tier_id: jobs_2019
    file_name: jobs_2019_rows.csv
    provenance: archived
    renames:
      job_title: titel
  - tier_id: jobs
    file_name: jobs_rows.csv
    provenance: active
  - tier_id: jobs_archiviert
    file_name: jobs_archiviert_rows.csv
    provenance: archived
"#,
    )
    .unwrap();
    let config = UnifyConfig::for_data_dir(work.path());

    let summary = UnifyPipeline::new(config.clone()).run_once().unwrap();
    assert_eq!(summary.total_jobs, 6);
    assert_eq!(summary.archived_jobs, 3);

    let doc = read(&config.output);
    let ids = doc["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|job| job["id"].as_i64().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![1, 2, 3, 500, 100, 101]);
    assert_eq!(doc["jobs"][3]["job_title"], json!("Gärtnerei"));
    assert_eq!(doc["jobs"][3]["employer"]["name"], json!("Leerer Arbeitgeber"));
}
