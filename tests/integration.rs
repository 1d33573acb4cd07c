use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn crag_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("crag");
    path
}

const RECORDS: &str = r#"[
  {"id": "conn1/Condition/c1", "user_id": "u1", "connection_id": "conn1",
   "data_record": {"raw": {"resourceType": "Condition", "id": "c1", "code": {"text": "Type 2 diabetes mellitus"}, "onsetDateTime": "2019-04-02"},
                   "format": "FHIR.R4", "content_type": "application/fhir+json", "resource_type": "Condition"},
   "metadata": {"id": "c1", "date": "2019-04-02", "display_name": "Type 2 diabetes"}},
  {"id": "conn1/Observation/o1", "user_id": "u1", "connection_id": "conn1",
   "data_record": {"raw": {"resourceType": "Observation", "id": "o1", "code": {"text": "Hemoglobin A1c"}, "valueQuantity": {"value": 7.2, "unit": "%"}},
                   "format": "FHIR.R4", "content_type": "application/fhir+json", "resource_type": "Observation"},
   "metadata": {"id": "o1", "date": "2024-01-15", "display_name": "Hemoglobin A1c",
                "codes": [{"system": "http://loinc.org", "code": "4548-4"}]}},
  {"id": "conn1/Binary/b1", "user_id": "u1", "connection_id": "conn1",
   "data_record": {"raw": "not indexable", "format": "PDF", "content_type": "application/pdf", "resource_type": "Binary"}}
]"#;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    fs::write(root.join("records.json"), RECORDS).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/crag.sqlite"

[embedding]
provider = "hash"
dims = 256
"#,
        root.display()
    );

    let config_path = config_dir.join("crag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_crag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = crag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .env_remove("OPENAI_API_KEY")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run crag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn records_path(config_path: &Path) -> String {
    config_path
        .parent()
        .and_then(Path::parent)
        .unwrap()
        .join("records.json")
        .to_string_lossy()
        .to_string()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_crag(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_crag(&config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_crag(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_import_and_index() {
    let (_tmp, config_path) = setup_test_env();
    run_crag(&config_path, &["init"]);

    let records = records_path(&config_path);
    let (stdout, stderr, success) = run_crag(&config_path, &["import", &records]);
    assert!(success, "import failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Imported 3 documents"));

    let (stdout, stderr, success) = run_crag(&config_path, &["index"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    // The PDF yields no chunks; the other two yield one each.
    assert!(stdout.contains("Indexed 3 of 3 documents"), "stdout={}", stdout);
    assert!(stdout.contains("index holds 2 chunks"), "stdout={}", stdout);
}

#[test]
fn test_reindex_does_not_duplicate() {
    let (_tmp, config_path) = setup_test_env();
    run_crag(&config_path, &["init"]);
    let records = records_path(&config_path);
    run_crag(&config_path, &["import", &records, "--index"]);

    let (stdout, _, success) = run_crag(&config_path, &["index"]);
    assert!(success);
    assert!(stdout.contains("index holds 2 chunks"), "stdout={}", stdout);
}

#[test]
fn test_import_with_index_flag() {
    let (_tmp, config_path) = setup_test_env();
    run_crag(&config_path, &["init"]);
    let records = records_path(&config_path);

    let (stdout, stderr, success) = run_crag(&config_path, &["import", &records, "--index"]);
    assert!(success, "import failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Indexed 2 chunks"), "stdout={}", stdout);
}

#[test]
fn test_chunks_shows_deterministic_id() {
    let (_tmp, config_path) = setup_test_env();
    run_crag(&config_path, &["init"]);
    let records = records_path(&config_path);
    run_crag(&config_path, &["import", &records]);

    let (stdout, stderr, success) = run_crag(&config_path, &["chunks", "conn1/Observation/o1"]);
    assert!(success, "chunks failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("[conn1/Observation/o1__chunk_0]"));
    assert!(stdout.contains("Hemoglobin A1c"));

    let (again, _, _) = run_crag(&config_path, &["chunks", "conn1/Observation/o1"]);
    assert_eq!(stdout, again);
}

#[test]
fn test_chunks_unknown_document_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_crag(&config_path, &["init"]);
    let (_, stderr, success) = run_crag(&config_path, &["chunks", "missing"]);
    assert!(!success);
    assert!(stderr.contains("Document not found"));
}

#[test]
fn test_search_finds_documents() {
    let (_tmp, config_path) = setup_test_env();
    run_crag(&config_path, &["init"]);
    let records = records_path(&config_path);
    run_crag(&config_path, &["import", &records, "--index"]);

    let (stdout, stderr, success) = run_crag(&config_path, &["search", "hemoglobin", "a1c"]);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.starts_with("1. Hemoglobin A1c"), "stdout={}", stdout);
    assert!(stdout.contains("conn1/Observation/o1__chunk_0"));
}

#[test]
fn test_ask_without_model_fails_fast() {
    let (_tmp, config_path) = setup_test_env();
    run_crag(&config_path, &["init"]);

    let (_, stderr, success) = run_crag(&config_path, &["ask", "What is my A1c?"]);
    assert!(!success);
    assert!(stderr.contains("Model provider is disabled"));
}

#[test]
fn test_invalid_progress_mode_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let output = Command::new(crag_binary())
        .arg("--config")
        .arg(&config_path)
        .args(["--progress", "loud", "init"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unknown progress mode"));
}
