//! Structural validation of action plans, narrative plans and whole records.
//!
//! Validation is all-or-nothing: a plan is either returned fully typed or
//! rejected with the first [`SchemaViolation`] found.

use crate::blocks::RawRecord;
use crate::grammar::{scan_steps, PayloadMode, StepScan};
use crate::plan::{ActionPlan, ActionStep, NarrativePlan};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use tracing::debug;

const STEP_KEYS: [&str; 3] = ["action", "objects", "parameters"];

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Key,
    Orc,
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Block::Key => f.write_str("<key>"),
            Block::Orc => f.write_str("<orc>"),
        }
    }
}

// ---------------------------------------------------------------------------
// SchemaViolation
// ---------------------------------------------------------------------------

/// Why a candidate failed validation. The `Display` text is the reason
/// recorded in the failure stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("no valid 'Step N: ...' lines in {block}")]
    NoSteps { block: Block },

    #[error("non-consecutive step numbers in {block}: {numbers:?}")]
    NonConsecutive { block: Block, numbers: Vec<usize> },

    #[error("step {step} in <key> must be a JSON object with exactly action/objects/parameters")]
    BadShape { step: usize },

    #[error("step {step} '{field}' in <key> must be {expected}")]
    TypeError {
        step: usize,
        field: &'static str,
        expected: &'static str,
    },

    #[error("step {step} '{field}' in <key> must be lowercase")]
    CaseError { step: usize, field: &'static str },

    #[error("missing or empty <{0}>")]
    MissingField(&'static str),

    #[error("step count mismatch: <key> has {key} steps, <orc> has {orc}")]
    StepCountMismatch { key: usize, orc: usize },
}

impl SchemaViolation {
    /// Coarse error class: grammar, schema or consistency.
    pub fn class(&self) -> &'static str {
        match self {
            SchemaViolation::NoSteps { .. } | SchemaViolation::NonConsecutive { .. } => "grammar",
            SchemaViolation::BadShape { .. }
            | SchemaViolation::TypeError { .. }
            | SchemaViolation::CaseError { .. }
            | SchemaViolation::MissingField(_) => "schema",
            SchemaViolation::StepCountMismatch { .. } => "consistency",
        }
    }
}

pub type ValidationOutcome<T = ActionPlan> = std::result::Result<T, SchemaViolation>;

// ---------------------------------------------------------------------------
// Case rule
// ---------------------------------------------------------------------------

/// True when no alphabetic character has a distinct lowercase form.
/// Digits, units and symbols are never inspected.
pub fn is_lowercase_text(s: &str) -> bool {
    s.chars()
        .filter(|c| c.is_alphabetic())
        .all(|c| c.to_lowercase().eq(std::iter::once(c)))
}

// ---------------------------------------------------------------------------
// Action plan
// ---------------------------------------------------------------------------

pub fn validate_action_plan(block: &str) -> ValidationOutcome {
    let scan = scan_steps(block, PayloadMode::Json);
    log_issues(Block::Key, &scan);
    if scan.is_empty() {
        return Err(SchemaViolation::NoSteps { block: Block::Key });
    }
    if !scan.is_contiguous() {
        return Err(SchemaViolation::NonConsecutive {
            block: Block::Key,
            numbers: scan.numbers(),
        });
    }

    let mut steps = Vec::with_capacity(scan.len());
    for entry in &scan.entries {
        steps.push(validate_step(entry.number, &entry.payload)?);
    }
    Ok(ActionPlan::new(steps))
}

fn log_issues(block: Block, scan: &StepScan) {
    for issue in &scan.issues {
        debug!(%block, %issue, "step numbering issue");
    }
}

fn validate_step(step: usize, payload: &str) -> ValidationOutcome<ActionStep> {
    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(payload) else {
        return Err(SchemaViolation::BadShape { step });
    };
    if obj.len() != STEP_KEYS.len() || !STEP_KEYS.iter().all(|k| obj.contains_key(*k)) {
        return Err(SchemaViolation::BadShape { step });
    }

    let Some(action) = obj.get("action").and_then(Value::as_str) else {
        return Err(SchemaViolation::TypeError {
            step,
            field: "action",
            expected: "a string",
        });
    };
    let objects = string_list(&obj, step, "objects")?;
    let parameters = string_list(&obj, step, "parameters")?;

    if !is_lowercase_text(action) {
        return Err(SchemaViolation::CaseError {
            step,
            field: "action",
        });
    }
    for (field, items) in [("objects", &objects), ("parameters", &parameters)] {
        if !items.iter().all(|s| is_lowercase_text(s)) {
            return Err(SchemaViolation::CaseError { step, field });
        }
    }

    Ok(ActionStep {
        action: action.to_string(),
        objects,
        parameters,
    })
}

fn string_list(
    obj: &Map<String, Value>,
    step: usize,
    field: &'static str,
) -> ValidationOutcome<Vec<String>> {
    let err = || SchemaViolation::TypeError {
        step,
        field,
        expected: "a list of strings",
    };
    let items = obj.get(field).and_then(Value::as_array).ok_or_else(err)?;
    items
        .iter()
        .map(|v| v.as_str().map(str::to_string).ok_or_else(err))
        .collect()
}

// ---------------------------------------------------------------------------
// Narrative plan
// ---------------------------------------------------------------------------

pub fn validate_narrative_plan(block: &str) -> ValidationOutcome<NarrativePlan> {
    let scan = scan_steps(block, PayloadMode::Text);
    log_issues(Block::Orc, &scan);
    if scan.is_empty() {
        return Err(SchemaViolation::NoSteps { block: Block::Orc });
    }
    if !scan.is_contiguous() {
        return Err(SchemaViolation::NonConsecutive {
            block: Block::Orc,
            numbers: scan.numbers(),
        });
    }
    Ok(NarrativePlan::new(
        scan.entries.into_iter().map(|e| e.payload).collect(),
    ))
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Validate every field of a candidate record and cross-check the plan
/// against its narrative. Returns the typed action plan.
pub fn validate_record(record: &RawRecord) -> ValidationOutcome {
    for (name, value) in record.fields() {
        if value.trim().is_empty() {
            return Err(SchemaViolation::MissingField(name));
        }
    }

    let plan = validate_action_plan(&record.key)?;
    let narrative = validate_narrative_plan(&record.orc)?;
    if plan.len() != narrative.len() {
        return Err(SchemaViolation::StepCountMismatch {
            key: plan.len(),
            orc: narrative.len(),
        });
    }
    Ok(plan)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
