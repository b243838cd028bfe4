use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_noterank<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_noterank"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute noterank binary: {err}"))
}

fn run_noterank_with_stdin<I, S>(args: I, input: &str) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = Command::new(env!("CARGO_BIN_EXE_noterank"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|err| panic!("failed to spawn noterank binary: {err}"));

    if let Some(stdin) = child.stdin.take() {
        let mut stdin = stdin;
        stdin
            .write_all(input.as_bytes())
            .unwrap_or_else(|err| panic!("failed to write answers to stdin: {err}"));
    }

    child
        .wait_with_output()
        .unwrap_or_else(|err| panic!("failed to wait for noterank binary: {err}"))
}

fn parse_stdout_json(output: &Output) -> Value {
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "noterank command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    parse_stdout_json(&run_noterank(args))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing boolean field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_note(dir: &Path, file: &str, content: &str) {
    let path = dir.join(file);
    fs::write(&path, content)
        .unwrap_or_else(|err| panic!("failed to write fixture note {}: {err}", path.display()));
}

fn metric_value_of(db: &Path, note_path: &str, metric: &str) -> Option<String> {
    let listing = run_json(["--db", path_str(db), "note", "list"]);
    let notes = listing
        .get("notes")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("note list payload should carry notes: {listing}"));
    notes
        .iter()
        .find(|note| note.get("path").and_then(Value::as_str) == Some(note_path))
        .and_then(|note| note.get("metrics"))
        .and_then(|metrics| metrics.get(metric))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn seed_two_note_vault(tag: &str) -> (PathBuf, PathBuf) {
    let workdir = unique_temp_dir(&format!("noterank-cli-{tag}"));
    let db = workdir.join("noterank.sqlite3");
    let vault = workdir.join("vault");
    fs::create_dir_all(&vault)
        .unwrap_or_else(|err| panic!("failed to create vault dir: {err}"));
    write_note(&vault, "a.md", "---\npriority: 5\n---\nAlpha body.\n");
    write_note(&vault, "b.md", "---\npriority: 9\n---\nBeta body.\n");

    let imported = run_json(["--db", path_str(&db), "note", "import", "--dir", path_str(&vault)]);
    assert_eq!(as_i64(&imported, "imported_notes"), 2);
    (workdir, db)
}

#[test]
fn db_migrate_reports_schema_versions() {
    let workdir = unique_temp_dir("noterank-cli-migrate");
    let db = workdir.join("noterank.sqlite3");

    let migrated = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&migrated, "before_version"), 0);
    assert_eq!(as_i64(&migrated, "after_version"), 1);

    let status = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&status, "current_version"), 1);
    assert!(as_bool(&status, "up_to_date"));
    assert_eq!(as_str(&status, "contract_version"), "cli.v1");
}

#[test]
fn metric_registry_lifecycle() {
    let workdir = unique_temp_dir("noterank-cli-registry");
    let db = workdir.join("noterank.sqlite3");

    let added = run_json([
        "--db",
        path_str(&db),
        "metric",
        "add",
        "--name",
        "story points",
        "--ascending",
        "true",
    ]);
    assert_eq!(as_str(&added, "slug"), "story-points");
    assert!(as_bool(&added, "ascending"));

    run_json(["--db", path_str(&db), "metric", "add", "--name", "effort"]);

    let listed = run_json(["--db", path_str(&db), "metric", "list"]);
    let metrics = listed
        .get("metrics")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("metric list payload should carry metrics: {listed}"));
    assert_eq!(metrics.len(), 2);
    assert_eq!(as_str(&metrics[0], "name"), "story points");
    assert!(!as_bool(&metrics[1], "ascending"));

    let duplicate = run_noterank(["--db", path_str(&db), "metric", "add", "--name", "effort"]);
    assert!(!duplicate.status.success());

    let updated = run_json([
        "--db",
        path_str(&db),
        "metric",
        "update",
        "--name",
        "effort",
        "--ascending",
        "true",
    ]);
    assert!(as_bool(&updated, "ascending"));

    run_json(["--db", path_str(&db), "metric", "remove", "--name", "effort"]);
    let listed = run_json(["--db", path_str(&db), "metric", "list"]);
    let metrics = listed
        .get("metrics")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("metric list payload should carry metrics: {listed}"));
    assert_eq!(metrics.len(), 1);
}

#[test]
fn note_import_populates_metrics_and_discovery() {
    let workdir = unique_temp_dir("noterank-cli-import");
    let db = workdir.join("noterank.sqlite3");
    let vault = workdir.join("vault");
    fs::create_dir_all(&vault).unwrap_or_else(|err| panic!("failed to create vault dir: {err}"));

    write_note(&vault, "a.md", "---\npriority: 5\neffort: 1\n---\nAlpha.\n");
    write_note(&vault, "b.md", "---\npriority: 7\neffort: 2\n---\nBeta.\n");
    write_note(&vault, "c.md", "---\npriority: 9\n---\nGamma.\n");
    write_note(&vault, "plain.md", "No metadata here.\n");

    let imported = run_json(["--db", path_str(&db), "note", "import", "--dir", path_str(&vault)]);
    assert_eq!(as_i64(&imported, "imported_notes"), 4);
    assert_eq!(as_i64(&imported, "imported_metric_values"), 5);

    let shown = run_json(["--db", path_str(&db), "note", "show", "--path", "a.md"]);
    assert_eq!(as_str(&shown, "body"), "Alpha.\n");

    // `priority` sits on three notes, `effort` only on two.
    let discovered = run_json(["--db", path_str(&db), "metric", "discover"]);
    let names: Vec<&str> = discovered
        .get("discovered")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("discover payload should carry entries: {discovered}"))
        .iter()
        .map(|entry| as_str(entry, "name"))
        .collect();
    assert_eq!(names, vec!["priority"]);
}

#[test]
fn reorder_swaps_values_when_the_user_prefers_the_higher_ascending_value() {
    let (_workdir, db) = seed_two_note_vault("swap");
    run_json([
        "--db",
        path_str(&db),
        "metric",
        "add",
        "--name",
        "priority",
        "--ascending",
        "true",
    ]);

    // With two candidates the ascending presentation is deterministic:
    // left = a.md (5), right = b.md (9). Picking right contradicts the
    // stored order, so the values trade places.
    let output = run_noterank_with_stdin(
        ["--db", path_str(&db), "reorder", "priority", "--seed", "1"],
        "l\n",
    );
    let summary = parse_stdout_json(&output);
    assert_eq!(as_str(&summary, "metric"), "priority");
    assert_eq!(as_i64(&summary, "rounds"), 1);
    assert_eq!(as_i64(&summary, "swaps"), 1);

    assert_eq!(metric_value_of(&db, "a.md", "priority"), Some("9".to_string()));
    assert_eq!(metric_value_of(&db, "b.md", "priority"), Some("5".to_string()));
}

#[test]
fn reorder_keeps_values_when_the_answer_agrees_with_the_order() {
    let (_workdir, db) = seed_two_note_vault("agree");
    run_json([
        "--db",
        path_str(&db),
        "metric",
        "add",
        "--name",
        "priority",
        "--ascending",
        "true",
    ]);

    let output = run_noterank_with_stdin(
        ["--db", path_str(&db), "reorder", "priority", "--seed", "1"],
        "j\n",
    );
    let summary = parse_stdout_json(&output);
    assert_eq!(as_i64(&summary, "rounds"), 1);
    assert_eq!(as_i64(&summary, "swaps"), 0);

    assert_eq!(metric_value_of(&db, "a.md", "priority"), Some("5".to_string()));
    assert_eq!(metric_value_of(&db, "b.md", "priority"), Some("9".to_string()));
}

#[test]
fn reorder_descending_places_the_higher_value_left() {
    let (_workdir, db) = seed_two_note_vault("descending");
    // Registered without --ascending: higher values rank better.
    run_json(["--db", path_str(&db), "metric", "add", "--name", "priority"]);

    // Descending presentation: left = b.md (9), right = a.md (5). Picking
    // left agrees with the stored order.
    let output = run_noterank_with_stdin(
        ["--db", path_str(&db), "reorder", "priority", "--seed", "1"],
        "j\n",
    );
    let summary = parse_stdout_json(&output);
    assert_eq!(as_i64(&summary, "swaps"), 0);
    assert_eq!(metric_value_of(&db, "a.md", "priority"), Some("5".to_string()));

    // Picking right says the 5-valued note is better; under descending that
    // forces a swap.
    let output = run_noterank_with_stdin(
        ["--db", path_str(&db), "reorder", "priority", "--seed", "1"],
        "l\n",
    );
    let summary = parse_stdout_json(&output);
    assert_eq!(as_i64(&summary, "swaps"), 1);
    assert_eq!(metric_value_of(&db, "a.md", "priority"), Some("9".to_string()));
    assert_eq!(metric_value_of(&db, "b.md", "priority"), Some("5".to_string()));
}

#[test]
fn reorder_quit_without_answering_changes_nothing() {
    let (_workdir, db) = seed_two_note_vault("quit");
    run_json([
        "--db",
        path_str(&db),
        "metric",
        "add",
        "--name",
        "priority",
        "--ascending",
        "true",
    ]);

    let output = run_noterank_with_stdin(
        ["--db", path_str(&db), "reorder", "priority"],
        "q\n",
    );
    let summary = parse_stdout_json(&output);
    assert_eq!(as_i64(&summary, "rounds"), 0);
    assert_eq!(as_i64(&summary, "swaps"), 0);

    assert_eq!(metric_value_of(&db, "a.md", "priority"), Some("5".to_string()));
    assert_eq!(metric_value_of(&db, "b.md", "priority"), Some("9".to_string()));
}

#[test]
fn reorder_rejects_unregistered_metrics() {
    let (_workdir, db) = seed_two_note_vault("unregistered");
    let output = run_noterank_with_stdin(["--db", path_str(&db), "reorder", "missing"], "");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("metric not registered"), "stderr was: {stderr}");
}

#[test]
fn reorder_requires_two_candidates_with_values() {
    let workdir = unique_temp_dir("noterank-cli-too-few");
    let db = workdir.join("noterank.sqlite3");
    let vault = workdir.join("vault");
    fs::create_dir_all(&vault).unwrap_or_else(|err| panic!("failed to create vault dir: {err}"));
    write_note(&vault, "only.md", "---\npriority: 5\n---\nLonely.\n");

    run_json(["--db", path_str(&db), "note", "import", "--dir", path_str(&vault)]);
    run_json([
        "--db",
        path_str(&db),
        "metric",
        "add",
        "--name",
        "priority",
        "--ascending",
        "true",
    ]);

    let output = run_noterank_with_stdin(["--db", path_str(&db), "reorder", "priority"], "");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("at least 2"), "stderr was: {stderr}");
}

#[test]
fn note_set_requires_an_existing_note() {
    let workdir = unique_temp_dir("noterank-cli-note-set");
    let db = workdir.join("noterank.sqlite3");

    let output = run_noterank([
        "--db",
        path_str(&db),
        "note",
        "set",
        "--path",
        "ghost.md",
        "--metric",
        "priority",
        "--value",
        "3",
    ]);
    assert!(!output.status.success());
}
