#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use serde_json::Value;

fn mk_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_mk") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/mk");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "memory-kernel-project-cli", "--bin", "mk"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build mk binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn project_root() -> tempfile::TempDir {
    match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => panic!("failed to create project root: {err}"),
    }
}

fn mk_output(root: &Path, global: &[&str], args: &[&str]) -> Output {
    let mut command = Command::new(mk_binary_path());
    command.arg("--root").arg(root);
    command.args(global);
    command.arg("project");
    command.args(args);
    command.env_remove("RUST_LOG");

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run mk command {:?}: {err}", args),
    }
}

fn mk_json(root: &Path, args: &[&str]) -> Value {
    let output = mk_output(root, &["--silent"], args);
    assert!(
        output.status.success(),
        "mk {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
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

fn read_json(path: &Path) -> Value {
    let body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) => panic!("failed to read {}: {err}", path.display()),
    };
    match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(err) => panic!("failed to parse {}: {err}", path.display()),
    }
}

fn assert_export_schema(value: &Value) {
    let schema_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../contracts/export/v1/schemas/export-snapshot.schema.json");
    let schema = read_json(&schema_path);
    let compiled = match JSONSchema::compile(&schema) {
        Ok(compiled) => compiled,
        Err(err) => panic!("failed to compile {}: {err}", schema_path.display()),
    };
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

#[test]
fn project_help_contract_lists_expected_subcommands() {
    let output = match Command::new(mk_binary_path())
        .args(["project", "--help"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "init",
        "session",
        "decision",
        "pattern",
        "task",
        "knowledge",
        "action",
        "search",
        "stats",
        "sync",
        "export",
        "import",
        "backup",
    ] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn init_writes_state_and_placeholder_summary() {
    let root = project_root();
    let payload = mk_json(root.path(), &["init"]);
    assert!(payload["sync"]["sideDocuments"].is_number());

    let summary = match fs::read_to_string(root.path().join("PROJECT_MEMORY.md")) {
        Ok(body) => body,
        Err(err) => panic!("summary missing after init: {err}"),
    };
    assert!(summary.contains("No active tasks"));
    assert!(summary.contains("No knowledge stored yet"));
    assert!(root.path().join(".project-memory/config.json").is_file());
    assert!(root.path().join(".project-memory/memory.json").is_file());

    let stats = mk_json(root.path(), &["stats"]);
    assert_eq!(stats["actions"], Value::from(0));
}

#[test]
fn mutations_are_counted_and_searchable() {
    let root = project_root();
    let task = mk_json(
        root.path(),
        &["task", "add", "--description", "Wire up the exporter", "--priority", "high"],
    );
    assert_eq!(task["priority"], Value::from("high"));
    assert_eq!(task["status"], Value::from("open"));

    let pattern = mk_json(root.path(), &["pattern", "record", "--name", "flaky ci"]);
    assert_eq!(pattern["frequency"], Value::from(1));
    let pattern = mk_json(root.path(), &["pattern", "record", "--name", "flaky ci"]);
    assert_eq!(pattern["frequency"], Value::from(2));

    let task_id = task["id"].as_str().unwrap_or_default().to_string();
    let updated = mk_json(
        root.path(),
        &["task", "update", "--id", &task_id, "--status", "in-progress"],
    );
    assert_eq!(updated["updated"], Value::from(true));

    let stats = mk_json(root.path(), &["stats"]);
    assert_eq!(stats["actions"], Value::from(4));
    assert_eq!(stats["patterns"], Value::from(1));
    assert_eq!(stats["activeSessions"], Value::from(1));

    let results = mk_json(root.path(), &["search", "--query", "EXPORTER"]);
    assert_eq!(results["tasks"].as_array().map(Vec::len), Some(1));
}

#[test]
fn lifecycle_notices_respect_silent_mode() {
    let root = project_root();
    let loud = mk_output(
        root.path(),
        &[],
        &["knowledge", "set", "--category", "stack", "--key", "db", "--value", "sqlite"],
    );
    assert!(loud.status.success());
    assert!(String::from_utf8_lossy(&loud.stderr).contains("notice: started"));

    let other = project_root();
    let quiet = mk_output(
        other.path(),
        &["--silent"],
        &["knowledge", "set", "--category", "stack", "--key", "db", "--value", "sqlite"],
    );
    assert!(quiet.status.success());
    assert!(!String::from_utf8_lossy(&quiet.stderr).contains("notice:"));
}

#[test]
fn export_stdout_matches_contract_schema() {
    let root = project_root();
    let _ = mk_json(root.path(), &["session", "start", "--name", "Planning"]);
    let _ = mk_json(
        root.path(),
        &[
            "decision", "add", "--decision", "Keep JSON", "--reasoning", "Diffable",
            "--alternative", "SQLite",
        ],
    );
    let _ = mk_json(
        root.path(),
        &["task", "add", "--description", "Ship", "--assignee", "sam"],
    );
    let _ = mk_json(
        root.path(),
        &["knowledge", "set", "--category", "a", "--key", "b", "--value", "c"],
    );

    let export = mk_json(root.path(), &["export", "--sanitize"]);
    assert_export_schema(&export);
    assert_eq!(export["exportVersion"], Value::from("v1"));
    assert_eq!(export["tasks"][0]["assignee"], Value::from("[REDACTED]"));

    let filtered = mk_json(root.path(), &["export", "--kind", "tasks"]);
    assert_export_schema(&filtered);
    assert!(filtered.get("sessions").is_none());
}

#[test]
fn export_file_round_trips_through_merge_import() {
    let source = project_root();
    let _ = mk_json(source.path(), &["task", "add", "--description", "Carry over"]);
    let file = source.path().join("export.json");
    let written = mk_json(
        source.path(),
        &["export", "--kind", "tasks", "--out", file.to_str().unwrap_or_default()],
    );
    assert_eq!(written["exportVersion"], Value::from("v1"));

    let target = project_root();
    let file_arg = file.to_str().unwrap_or_default();
    let dry = mk_json(target.path(), &["import", "--file", file_arg, "--dry-run"]);
    assert_eq!(dry["dryRun"], Value::from(true));
    assert_eq!(dry["kinds"]["tasks"]["added"], Value::from(1));

    let applied = mk_json(target.path(), &["import", "--file", file_arg]);
    assert_eq!(applied["kinds"]["tasks"]["added"], Value::from(1));
    let again = mk_json(target.path(), &["import", "--file", file_arg]);
    assert_eq!(again["kinds"]["tasks"]["skipped"], Value::from(1));

    let stats = mk_json(target.path(), &["stats"]);
    assert_eq!(stats["tasks"], Value::from(1));
    assert_eq!(stats["actions"], Value::from(2));
}

#[test]
fn invalid_import_is_rejected_without_changes() {
    let root = project_root();
    let file = root.path().join("bad.json");
    if let Err(err) = fs::write(
        &file,
        r#"{"tasks": [{"description": "fine"}, {"priority": "high"}]}"#,
    ) {
        panic!("failed to write import fixture: {err}");
    }

    let output = mk_output(
        root.path(),
        &["--silent"],
        &["import", "--file", file.to_str().unwrap_or_default()],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("import rejected with 1 violation(s)"),
        "expected stable error shape, got stderr={stderr}"
    );
    assert!(stderr.contains("description"));

    let stats = mk_json(root.path(), &["stats"]);
    assert_eq!(stats["tasks"], Value::from(0));
    assert_eq!(stats["actions"], Value::from(0));
}

#[test]
fn invalid_pattern_priority_is_a_validation_error() {
    let root = project_root();
    let output = mk_output(
        root.path(),
        &["--silent"],
        &["pattern", "record", "--name", "x", "--priority", "urgent"],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("validation error"));
    assert!(!root.path().join(".project-memory/memory.json").exists());
}

#[test]
fn manual_backup_lists_and_restores() {
    let root = project_root();
    let _ = mk_json(root.path(), &["init"]);
    let _ = mk_json(
        root.path(),
        &["knowledge", "set", "--category", "a", "--key", "b", "--value", "before"],
    );

    let outcome = mk_json(root.path(), &["backup", "run"]);
    assert_eq!(outcome["reason"], Value::from("manual"));
    let listed = mk_json(root.path(), &["backup", "list"]);
    let name = listed[0]["name"].as_str().unwrap_or_default().to_string();
    assert!(!name.is_empty());

    let _ = mk_json(
        root.path(),
        &["knowledge", "set", "--category", "a", "--key", "b", "--value", "after"],
    );
    let restored = mk_json(root.path(), &["backup", "restore", "--name", &name]);
    assert_eq!(restored["restored"], Value::from(true));

    let results = mk_json(root.path(), &["search", "--query", "before"]);
    assert_eq!(results["knowledge"].as_array().map(Vec::len), Some(1));
}

#[test]
fn pattern_record_count_adds_occurrences() {
    let root = project_root();
    let first = mk_json(
        root.path(),
        &["pattern", "record", "--name", "slow build", "--count", "2"],
    );
    assert_eq!(first["frequency"], Value::from(2));
    let second = mk_json(
        root.path(),
        &["pattern", "record", "--name", "slow build", "--count", "3"],
    );
    assert_eq!(second["frequency"], Value::from(5));
    assert_eq!(second["id"], first["id"]);

    let stats = mk_json(root.path(), &["stats"]);
    assert_eq!(stats["patterns"], Value::from(1));
}
