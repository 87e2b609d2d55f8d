//! Input adapter for protocol datasets.
//!
//! Datasets arrive either as one JSON array or as JSON-Lines, with field
//! names that vary between sources. Everything here is lenient: missing
//! fields become empty strings and bad lines are counted, not fatal.

use crate::error::{RecipeError, Result};
use crate::record::RecordId;
use serde_json::Value;
use std::path::Path;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ProtocolBatch {
    pub records: Vec<Value>,
    /// JSON-Lines entries that did not parse.
    pub malformed_lines: usize,
}

/// Load a dataset. A leading `[` selects JSON-array mode; anything else
/// is read as JSON-Lines.
pub fn load_protocols(path: &Path) -> Result<ProtocolBatch> {
    let text = std::fs::read_to_string(path)?;
    parse_protocols(&text)
        .map_err(|e| RecipeError::InvalidInput(format!("{}: {e}", path.display())))
}

pub fn parse_protocols(text: &str) -> std::result::Result<ProtocolBatch, serde_json::Error> {
    if text.trim_start().starts_with('[') {
        let records: Vec<Value> = serde_json::from_str(text)?;
        return Ok(ProtocolBatch {
            records,
            malformed_lines: 0,
        });
    }

    let mut batch = ProtocolBatch::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(v) => batch.records.push(v),
            Err(_) => batch.malformed_lines += 1,
        }
    }
    Ok(batch)
}

/// The record's own `id` if it is a string or an integer, else
/// `protocol_{index}`.
pub fn record_id(value: &Value, index: usize) -> RecordId {
    match value.get("id") {
        Some(Value::String(s)) => RecordId::Text(s.clone()),
        Some(Value::Number(n)) if n.is_i64() => RecordId::Number(n.as_i64().unwrap_or_default()),
        _ => RecordId::Text(format!("protocol_{index}")),
    }
}

// ---------------------------------------------------------------------------
// ProtocolFields
// ---------------------------------------------------------------------------

/// Normalized view of one protocol record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolFields {
    pub title: String,
    pub abstract_text: String,
    pub problem: String,
    pub method: String,
    pub innovation: String,
    pub application: String,
    pub materials: String,
    pub equipment: String,
    /// Explicit materials-and-equipment field, when the source has one.
    pub input: String,
    pub procedure: String,
    pub notes: String,
}

impl ProtocolFields {
    pub fn normalize(value: &Value) -> Self {
        let get = |keys: &[&str]| first_text(value, keys);
        Self {
            title: get(&["title", "exp_name"]),
            abstract_text: get(&["abstract"]),
            problem: get(&["problem"]),
            method: get(&["method"]),
            innovation: get(&["innovation"]),
            application: get(&["application"]),
            materials: get(&["materials"]),
            equipment: get(&["equipment", "equipments"]),
            input: get(&["input"]),
            procedure: get(&["hierarchical_protocol", "procedure", "procedures"]),
            notes: get(&["notes"]),
        }
    }

    /// A record with neither a title nor a procedure has nothing to
    /// generate from.
    pub fn is_complete(&self) -> bool {
        !(self.title.is_empty() && self.procedure.is_empty())
    }

    /// Materials and equipment as one line, used by comprehension prompts.
    pub fn materials_and_equipment(&self) -> String {
        if !self.input.is_empty() {
            return self.input.clone();
        }
        format!("materials: {}; equipment: {}", self.materials, self.equipment)
    }
}

/// First non-empty value among `keys`. Strings are trimmed, other scalars
/// are stringified, and arrays/objects are kept as compact JSON.
fn first_text(value: &Value, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .map(value_text)
        .find(|s| !s.is_empty())
        .unwrap_or_default()
}

fn value_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Bool(_) | Value::Number(_) => v.to_string(),
        Value::Array(a) if a.is_empty() => String::new(),
        Value::Object(o) if o.is_empty() => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
