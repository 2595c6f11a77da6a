#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

const DATASET: &str = "competitiveanalyses.csv";

fn cca_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_cca") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/cca");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "competitive-analysis-cli", "--bin", "cca"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build cca binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_store_root(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("cca-contract-{label}-{}", Ulid::new()))
}

fn cca_command(store_root: &Path) -> Command {
    let mut command = Command::new(cca_binary_path());
    for var in ["CCA_STORE_ROOT", "CCA_BUCKET", "CCA_KEY", "CCA_LOG_JSON", "RUST_LOG"] {
        command.env_remove(var);
    }
    command.arg("--store-root").arg(store_root);
    command
}

fn cca_output(store_root: &Path, args: &[&str]) -> Output {
    let mut command = cca_command(store_root);
    command.args(args);

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run cca command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn submit_institution(store_root: &Path, name: &str, kind: &str, extra: &[&str]) -> Output {
    let mut args = vec![
        "submit",
        "institution",
        "--full-name",
        name,
        "--abbreviation",
        "ABR",
        "--type",
        kind,
        "--analysis-month",
        "2024-06",
        "--client-institution",
        "Bayview College",
        "--website-url",
        "https://example.edu",
    ];
    args.extend_from_slice(extra);
    cca_output(store_root, &args)
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(cca_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["submit", "view", "values", "record", "forms"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }

    let output = match Command::new(cca_binary_path())
        .args(["submit", "--help"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run submit help command: {err}"),
    };
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "institution",
        "narrative-archetypes",
        "web-design-archetypes",
        "web-imagery-archetypes",
        "narrative-notes",
        "web-design-notes",
        "web-imagery-notes",
    ] {
        assert!(
            stdout.contains(required),
            "expected submit help to contain {required}; output={stdout}"
        );
    }
}

#[test]
fn first_institution_receipt_contract_is_stable() {
    let root = temp_store_root("first");
    let output = submit_institution(&root, "Harbor State University", "Public", &[]);
    assert_success(&output);

    let payload = stdout_json(&output);
    assert_eq!(payload["form"], Value::String("institution_info".to_string()));
    assert_eq!(payload["outcome"]["action"], Value::String("inserted".to_string()));
    assert_eq!(payload["outcome"]["record_id"], Value::from(1_u64));
    assert_eq!(payload["save"]["bucket"], Value::String("Scooter".to_string()));
    assert_eq!(payload["save"]["key"], Value::String(DATASET.to_string()));
    assert_eq!(payload["save"]["rows"], Value::from(1_u64));
    assert!(root.join("Scooter").join(DATASET).exists());

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn notes_merge_into_existing_record() {
    let root = temp_store_root("merge");
    assert_success(&submit_institution(&root, "Harbor State University", "Public", &[]));

    let output = cca_output(
        &root,
        &[
            "submit",
            "narrative-notes",
            "--record-id",
            "1",
            "--tagline",
            "Where curious, meets ready",
            "--voice",
            "Conversational",
        ],
    );
    assert_success(&output);
    assert_eq!(stdout_json(&output)["outcome"]["action"], Value::String("updated".to_string()));

    let output = cca_output(&root, &["record", "show", "--record-id", "1"]);
    assert_success(&output);
    let record = stdout_json(&output);
    assert_eq!(record["Record ID"], Value::from(1_u64));
    assert_eq!(
        record["Full Name"],
        Value::String("Harbor State University".to_string())
    );
    assert_eq!(
        record["Narrative Tagline"],
        Value::String("Where curious, meets ready".to_string())
    );
    assert_eq!(record["Purple"], Value::from(10_i64));
    assert_eq!(record["Narrative Notes"], Value::Null);

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn percentage_failure_exits_non_zero_without_writing() {
    let root = temp_store_root("percent");
    let output = submit_institution(&root, "Harbor State University", "Public", &["--purple", "0"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("percentage total must equal 100 for institution_info, got 90"),
        "expected stable error shape, got stderr={stderr}"
    );
    assert!(!root.join("Scooter").join(DATASET).exists());

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn update_of_unknown_record_is_rejected() {
    let root = temp_store_root("unknown");
    assert_success(&submit_institution(&root, "Harbor State University", "Public", &[]));
    let before = std::fs::read(root.join("Scooter").join(DATASET)).unwrap_or_default();

    let output = cca_output(
        &root,
        &[
            "submit",
            "web-design-archetypes",
            "--record-id",
            "7",
        ],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("record not found: 7"),
        "expected stable error shape, got stderr={stderr}"
    );
    let after = std::fs::read(root.join("Scooter").join(DATASET)).unwrap_or_default();
    assert_eq!(before, after);

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn view_filter_and_values_contract() {
    let root = temp_store_root("view");
    assert_success(&submit_institution(&root, "Harbor State University", "Public", &[]));
    assert_success(&submit_institution(&root, "Ridge College", "Private", &[]));
    assert_success(&submit_institution(&root, "Lakeside University", "Public", &[]));

    let output = cca_output(&root, &["view", "--column", "Type", "--equals", "Public", "--json"]);
    assert_success(&output);
    let rows = stdout_json(&output);
    let ids = match rows.as_array() {
        Some(rows) => rows.iter().map(|row| row["Record ID"].clone()).collect::<Vec<_>>(),
        None => panic!("expected JSON array, got {rows}"),
    };
    assert_eq!(ids, vec![Value::from(1_u64), Value::from(3_u64)]);

    let output = cca_output(&root, &["values", "--column", "Type"]);
    assert_success(&output);
    let payload = stdout_json(&output);
    assert_eq!(payload["values"], serde_json::json!(["Private", "Public"]));

    let output = cca_output(&root, &["view"]);
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("Record ID"));
    assert!(stdout.contains("Ridge College"));
    assert!(stdout.trim_end().ends_with("(3 rows)"));

    let output = cca_output(&root, &["view", "--column", "Mascot", "--equals", "Owl"]);
    assert!(!output.status.success());

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn legacy_dataset_is_numbered_on_load() {
    let root = temp_store_root("legacy");
    let bucket = root.join("Scooter");
    if let Err(err) = std::fs::create_dir_all(&bucket) {
        panic!("failed to create bucket dir: {err}");
    }
    let legacy = "Full Name,Abbreviation,Type\nNorth College,NC,Private\nSouth College,SC,Public\n";
    if let Err(err) = std::fs::write(bucket.join(DATASET), legacy) {
        panic!("failed to seed legacy dataset: {err}");
    }

    let output = cca_output(&root, &["view", "--json"]);
    assert_success(&output);
    let rows = stdout_json(&output);
    assert_eq!(rows[0]["Record ID"], Value::from(1_u64));
    assert_eq!(rows[1]["Record ID"], Value::from(2_u64));
    assert_eq!(rows[1]["Abbreviation"], Value::String("SC".to_string()));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("numbering rows in file order"),
        "expected legacy warning on stderr, got stderr={stderr}"
    );

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn bucket_and_key_come_from_environment() {
    let root = temp_store_root("env");
    let mut command = cca_command(&root);
    command
        .env("CCA_BUCKET", "Reviews")
        .env("CCA_KEY", "reviews.csv")
        .args([
            "submit",
            "institution",
            "--full-name",
            "Harbor State University",
            "--abbreviation",
            "HSU",
            "--type",
            "School",
            "--client-institution",
            "Bayview College",
            "--website-url",
            "https://harbor.example.edu",
        ]);
    let output = match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run cca: {err}"),
    };
    assert_success(&output);
    assert!(root.join("Reviews").join("reviews.csv").exists());
    assert!(!root.join("Scooter").exists());

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn debug_log_reports_resolved_location() {
    let root = temp_store_root("log");
    let mut command = cca_command(&root);
    command
        .env("RUST_LOG", "debug")
        .args(["--log-json", "--bucket", "Reviews", "view", "--json"]);
    let output = match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run cca: {err}"),
    };
    assert_success(&output);

    let stderr = String::from_utf8_lossy(&output.stderr);
    let opened = stderr
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find(|event| event["fields"]["message"] == Value::String("opening dataset".to_string()));
    let event = match opened {
        Some(event) => event,
        None => panic!("expected an opening dataset event, got stderr={stderr}"),
    };
    assert_eq!(
        event["fields"]["location"],
        Value::String(format!("Reviews/{DATASET}"))
    );
    assert_eq!(stdout_json(&output), Value::Array(Vec::new()));
}

#[test]
fn forms_json_contract_lists_every_form() {
    let root = temp_store_root("forms");
    let output = cca_output(&root, &["forms", "--json"]);
    assert_success(&output);

    let forms = stdout_json(&output);
    let names = match forms.as_array() {
        Some(forms) => forms.iter().map(|form| form["form"].clone()).collect::<Vec<_>>(),
        None => panic!("expected JSON array, got {forms}"),
    };
    assert_eq!(names.len(), 7);
    assert_eq!(forms[0]["allows_create"], Value::Bool(true));
    assert_eq!(forms[0]["fields"][2]["kind"], Value::String("choice".to_string()));
    assert_eq!(forms[1]["fields"][0]["name"], Value::String("Purple".to_string()));
    assert_eq!(forms[2]["fields"][0]["name"], Value::String("Web Design Purple".to_string()));
    assert!(!root.exists());
}
