use crate::output::{print_json, print_table};
use anyhow::Context;
use scirecipe_core::blocks::RawRecord;
use scirecipe_core::schema::validate_record;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

#[derive(Serialize)]
struct LineFailure {
    line: usize,
    id: String,
    class: &'static str,
    reason: String,
}

pub fn run(file: &Path, json: bool) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let mut total = 0;
    let mut failures = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        total += 1;
        let line_no = i + 1;
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                failures.push(LineFailure {
                    line: line_no,
                    id: "-".to_string(),
                    class: "input",
                    reason: format!("not a JSON object: {e}"),
                });
                continue;
            }
        };
        let id = match value.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => "-".to_string(),
            Some(other) => other.to_string(),
        };
        if let Err(violation) = validate_record(&raw_record(&value)) {
            failures.push(LineFailure {
                line: line_no,
                id,
                class: violation.class(),
                reason: violation.to_string(),
            });
        }
    }

    if json {
        print_json(&serde_json::json!({
            "total": total,
            "valid": total - failures.len(),
            "invalid": failures.len(),
            "failures": failures,
        }))?;
    } else if failures.is_empty() {
        println!("All {total} records are valid.");
    } else {
        let rows = failures
            .iter()
            .map(|f| {
                vec![
                    f.line.to_string(),
                    f.id.clone(),
                    f.class.to_string(),
                    f.reason.clone(),
                ]
            })
            .collect();
        print_table(&["LINE", "ID", "CLASS", "REASON"], rows);
    }

    if !failures.is_empty() {
        anyhow::bail!("{} of {} lines failed validation", failures.len(), total);
    }
    Ok(())
}

/// The five text fields of a stored record; anything missing or not a
/// string reads as empty.
fn raw_record(value: &Value) -> RawRecord {
    let field = |name: &str| {
        value
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    RawRecord {
        question: field("question"),
        think: field("think"),
        key: field("key"),
        orc: field("orc"),
        note: field("note"),
    }
}
