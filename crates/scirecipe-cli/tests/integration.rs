#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

fn scirecipe(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("scirecipe").unwrap();
    cmd.current_dir(dir.path())
        .env("SCIRECIPE_ROOT", dir.path())
        .env_remove("OPENAI_API_KEY");
    cmd
}

fn write(dir: &TempDir, rel: &str, contents: &str) {
    let path = dir.path().join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

const KEY: &str = r#"Step 1: {"action": "wash", "objects": ["cells"], "parameters": ["1x pbs"]}
Step 2: {"action": "centrifuge", "objects": ["cells"], "parameters": ["300xg", "5 min"]}"#;
const ORC: &str = "Step 1: Wash the cells with 1x pbs.\nStep 2: Centrifuge at 300xg for 5 min.";

fn stored_record(id: &str, key: &str, orc: &str) -> String {
    serde_json::json!({
        "id": id,
        "type": "overview",
        "question": "How do I pellet the cells?",
        "think": "Wash first, then spin.",
        "key": key,
        "orc": orc,
        "note": "Keep samples on ice.",
        "action": ["wash", "centrifuge"],
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// scirecipe config
// ---------------------------------------------------------------------------

#[test]
fn config_init_writes_default_config() {
    let dir = TempDir::new().unwrap();
    scirecipe(&dir)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.yaml"));

    assert!(dir.path().join(".scirecipe/config.yaml").exists());
    scirecipe(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_init_keeps_existing_file_without_force() {
    let dir = TempDir::new().unwrap();
    write(&dir, ".scirecipe/config.yaml", "version: 1\nreviewer: null\n");

    scirecipe(&dir)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));
    let text = std::fs::read_to_string(dir.path().join(".scirecipe/config.yaml")).unwrap();
    assert_eq!(text, "version: 1\nreviewer: null\n");

    scirecipe(&dir).args(["config", "init", "--force"]).assert().success();
    let text = std::fs::read_to_string(dir.path().join(".scirecipe/config.yaml")).unwrap();
    assert!(text.contains("collaborator"));
}

#[test]
fn config_show_json_reports_defaults() {
    let dir = TempDir::new().unwrap();
    scirecipe(&dir).args(["config", "init"]).assert().success();

    let output = scirecipe(&dir)
        .args(["config", "show", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let cfg = stdout_json(&output);
    assert_eq!(cfg["version"], 1);
    assert_eq!(cfg["repair"]["max_attempts"], 2);
    assert_eq!(cfg["generation"]["mode"]["type"], "sampled");
}

#[test]
fn config_validate_fails_on_errors() {
    let dir = TempDir::new().unwrap();
    write(
        &dir,
        ".scirecipe/config.yaml",
        "version: 1\ngeneration:\n  mode:\n    type: sampled\n    per_type_min: 3\n    per_type_max: 1\n",
    );
    scirecipe(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config validation found errors"));
}

// ---------------------------------------------------------------------------
// scirecipe validate
// ---------------------------------------------------------------------------

#[test]
fn validate_accepts_well_formed_stream() {
    let dir = TempDir::new().unwrap();
    write(&dir, "out.jsonl", &format!("{}\n", stored_record("p1", KEY, ORC)));

    scirecipe(&dir)
        .args(["validate", "out.jsonl"])
        .assert()
        .success()
        .stdout(predicate::str::contains("All 1 records are valid"));
}

#[test]
fn validate_reports_bad_lines() {
    let dir = TempDir::new().unwrap();
    let bad_key = KEY.replace("\"wash\"", "\"Wash\"");
    let contents = format!(
        "{}\n{}\nnot json\n",
        stored_record("p1", KEY, ORC),
        stored_record("p2", &bad_key, ORC),
    );
    write(&dir, "out.jsonl", &contents);

    let output = scirecipe(&dir)
        .args(["validate", "out.jsonl", "--json"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["total"], 3);
    assert_eq!(report["valid"], 1);
    assert_eq!(report["failures"][0]["id"], "p2");
    assert_eq!(report["failures"][0]["class"], "schema");
    assert_eq!(report["failures"][1]["class"], "input");
    assert!(report["failures"][0]["reason"]
        .as_str()
        .unwrap()
        .contains("lowercase"));
    assert_eq!(report["failures"][1]["line"], 3);
    assert!(String::from_utf8_lossy(&output.stderr).contains("2 of 3 lines failed validation"));
}

// ---------------------------------------------------------------------------
// scirecipe score
// ---------------------------------------------------------------------------

#[test]
fn score_identical_plans_is_perfect() {
    let dir = TempDir::new().unwrap();
    write(&dir, "pred.txt", KEY);
    write(&dir, "ref.txt", KEY);

    let output = scirecipe(&dir)
        .args(["score", "--predicted", "pred.txt", "--reference", "ref.txt", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let result = stdout_json(&output);
    assert_eq!(result["mode"], "strict");
    assert_eq!(result["metrics"]["step_match"], 1.0);
    assert_eq!(result["metrics"]["order_strict"], 1.0);
    assert_eq!(result["metrics"]["order_lcs"], 1.0);
    assert_eq!(result["alignment"].as_array().unwrap().len(), 2);
}

#[test]
fn score_falls_back_to_lenient_for_tagged_answers() {
    let dir = TempDir::new().unwrap();
    let sloppy = r#"Step 1: {"action": "Wash", "objects": ["cells"], "parameters": []}"#;
    write(
        &dir,
        "pred.txt",
        &format!("<think>t</think>\n<key>{sloppy}</key>\n<orc>Step 1: Wash.</orc>\n<note>n</note>"),
    );
    write(&dir, "ref.txt", KEY);

    scirecipe(&dir)
        .args(["score", "--predicted", "pred.txt", "--reference", "ref.txt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Scoring mode: lenient"))
        .stdout(predicate::str::contains("step_match"));
}

// ---------------------------------------------------------------------------
// scirecipe generate
// ---------------------------------------------------------------------------

#[test]
fn generate_requires_init() {
    let dir = TempDir::new().unwrap();
    scirecipe(&dir)
        .arg("generate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not initialized"));
}

#[test]
fn generate_skips_committed_and_incomplete_records() {
    let dir = TempDir::new().unwrap();
    // Nothing here needs the collaborator; an unroutable endpoint proves it.
    write(
        &dir,
        ".scirecipe/config.yaml",
        "version: 1\ncollaborator:\n  base_url: http://127.0.0.1:9\n",
    );
    write(
        &dir,
        "data/protocols.jsonl",
        "{\"id\": \"p1\", \"title\": \"Pellet cells\", \"procedure\": \"Spin.\"}\n\
         {\"id\": \"p2\", \"abstract\": \"no title or procedure\"}\n\
         broken line\n",
    );
    write(&dir, "data/success.jsonl", &format!("{}\n", stored_record("p1", KEY, ORC)));

    let output = scirecipe(&dir).args(["generate", "--json"]).output().unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let result = stdout_json(&output);
    assert_eq!(result["summary"]["input_records"], 2);
    assert_eq!(result["summary"]["skipped_seen"], 1);
    assert_eq!(result["summary"]["skipped_incomplete"], 1);
    assert_eq!(result["summary"]["generated"], 0);

    let failed = std::fs::read_to_string(dir.path().join("data/failed.jsonl")).unwrap();
    assert!(failed.is_empty());
}

// ---------------------------------------------------------------------------
// scirecipe eval
// ---------------------------------------------------------------------------

#[test]
fn eval_scores_recorded_model_output() {
    let dir = TempDir::new().unwrap();
    let answer = format!("<think>t</think>\n<key>\n{KEY}\n</key>\n<orc>{ORC}</orc>\n<note>n</note>");
    let sample = serde_json::json!({
        "id": "s1",
        "type": "overview",
        "level": "easy",
        "question": "How do I pellet the cells?",
        "key": KEY,
        "orc": ORC,
        "action": ["wash", "centrifuge"],
        "model_output": answer,
    });
    let skipped = serde_json::json!({ "id": "s2", "question": "q", "action": "wash" });
    write(&dir, "samples.jsonl", &format!("{sample}\n{skipped}\n"));

    let output = scirecipe(&dir)
        .args(["eval", "--input", "samples.jsonl", "--output", "rows.jsonl", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["overall"]["num_samples"], 1);
    assert_eq!(report["overall"]["step_match"], 1.0);
    assert_eq!(report["by_level"]["easy"]["num_samples"], 1);

    let rows = std::fs::read_to_string(dir.path().join("rows.jsonl")).unwrap();
    let lines: Vec<&str> = rows.lines().collect();
    assert_eq!(lines.len(), 2);
    let first: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["id"], "s1");
    let last: Value = serde_json::from_str(lines[1]).unwrap();
    assert!(last.get("report").is_some());
}

#[test]
fn eval_task_scores_recorded_orderings() {
    let dir = TempDir::new().unwrap();
    let question = "Order the steps.\nStep 1: Spin down.\nStep 2: Harvest cells.";
    let samples = [
        serde_json::json!({
            "id": "o1",
            "conversations": [{"value": question}, {"value": "[2, 1]"}],
            "model_output": "The order is [2, 1]",
        }),
        serde_json::json!({
            "id": "o2",
            "conversations": [{"value": question}, {"value": "[2, 1]"}],
            "model_output": "[1, 2]",
        }),
        serde_json::json!({
            "id": "o3",
            "conversations": [{"value": question}, {"value": "[2, 1]"}],
            "model_output": "unsure",
        }),
    ];
    let body: String = samples.iter().map(|s| format!("{s}\n")).collect();
    write(&dir, "ord.jsonl", &body);

    let output = scirecipe(&dir)
        .args([
            "eval", "--task", "ordering", "--input", "ord.jsonl", "--output", "ord_rows.jsonl",
            "--json",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["task"], "ordering");
    assert_eq!(report["evaluated"], 2);
    assert_eq!(report["failed"], 1);
    assert_eq!(report["metrics"]["exact_match"], 0.5);
    assert_eq!(report["metrics"]["kendall_tau"], 0.0);

    let rows = std::fs::read_to_string(dir.path().join("ord_rows.jsonl")).unwrap();
    assert_eq!(rows.lines().count(), 4);
}

#[test]
fn eval_rejects_unknown_task() {
    let dir = TempDir::new().unwrap();
    write(&dir, "s.jsonl", "{}\n");
    scirecipe(&dir)
        .args(["eval", "--task", "sorting", "--input", "s.jsonl", "--output", "o.jsonl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown task 'sorting'"));
}
