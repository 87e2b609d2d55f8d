//! Committed record shapes written to the success and failure streams.

use crate::blocks::RawRecord;
use crate::plan::ActionPlan;
use crate::quality::QualityReport;
use crate::types::QaType;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// RecordId
// ---------------------------------------------------------------------------

/// Identifier of an input protocol. Upstream datasets use both integer and
/// string ids, so both are preserved as written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Number(i64),
    Text(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Number(n) => write!(f, "{n}"),
            RecordId::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId::Text(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        RecordId::Text(s)
    }
}

impl From<i64> for RecordId {
    fn from(n: i64) -> Self {
        RecordId::Number(n)
    }
}

// ---------------------------------------------------------------------------
// QaRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaRecord {
    pub id: RecordId,
    #[serde(rename = "type")]
    pub qa_type: QaType,
    pub question: String,
    pub think: String,
    pub key: String,
    pub orc: String,
    pub note: String,
    /// Distinct action verbs of `key`, in order of first appearance.
    #[serde(default)]
    pub action: Vec<String>,
}

impl QaRecord {
    /// Build from a candidate whose plan has been validated.
    pub fn validated(id: RecordId, qa_type: QaType, raw: RawRecord, plan: &ActionPlan) -> Self {
        Self::from_raw(id, qa_type, raw, plan.distinct_actions())
    }

    /// Build from a candidate that never validated. No actions are derived.
    pub fn unvalidated(id: RecordId, qa_type: QaType, raw: RawRecord) -> Self {
        Self::from_raw(id, qa_type, raw, Vec::new())
    }

    fn from_raw(id: RecordId, qa_type: QaType, raw: RawRecord, action: Vec<String>) -> Self {
        Self {
            id,
            qa_type,
            question: raw.question,
            think: raw.think,
            key: raw.key,
            orc: raw.orc,
            note: raw.note,
            action,
        }
    }
}

// ---------------------------------------------------------------------------
// FailedRecord
// ---------------------------------------------------------------------------

/// Why a record landed in the failure stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FailureDetail {
    /// Rejected by the quality reviewer. `error` counts failing criteria,
    /// `error1` the same excluding accuracy.
    Quality {
        check_report: QualityReport,
        error: usize,
        error1: usize,
    },
    /// Still structurally invalid after repair.
    Validation { error: String },
}

impl FailureDetail {
    pub fn quality(report: QualityReport) -> Self {
        let severity = report.severity();
        FailureDetail::Quality {
            check_report: report,
            error: severity.total,
            error1: severity.excluding_accuracy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRecord {
    #[serde(flatten)]
    pub record: QaRecord,
    #[serde(flatten)]
    pub detail: FailureDetail,
}

/// Only the `id` of a stream line. Used when rebuilding the processed set,
/// so lines with a damaged body still count as long as the id parses.
#[derive(Debug, Deserialize)]
pub struct IdOnly {
    pub id: RecordId,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ActionStep;

    fn raw() -> RawRecord {
        RawRecord {
            question: "How do I pellet cells?".into(),
            think: "Spin then wash.".into(),
            key: "Step 1: ...".into(),
            orc: "Step 1: Spin.".into(),
            note: "Balance the rotor.".into(),
        }
    }

    fn plan() -> ActionPlan {
        let step = |a: &str| ActionStep {
            action: a.into(),
            objects: vec!["cells".into()],
            parameters: vec![],
        };
        ActionPlan::new(vec![step("centrifuge"), step("wash"), step("centrifuge")])
    }

    #[test]
    fn id_keeps_number_or_text() {
        let n: RecordId = serde_json::from_str("7").unwrap();
        let s: RecordId = serde_json::from_str("\"p1\"").unwrap();
        assert_eq!(n, RecordId::Number(7));
        assert_eq!(s, RecordId::from("p1"));
        assert_eq!(serde_json::to_string(&n).unwrap(), "7");
        assert_eq!(s.to_string(), "p1");
    }

    #[test]
    fn success_line_shape() {
        let rec = QaRecord::validated("p1".into(), QaType::Planning, raw(), &plan());
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["type"], "planning");
        assert_eq!(v["action"], serde_json::json!(["centrifuge", "wash"]));
        let keys: Vec<&String> = v.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 8);
    }

    #[test]
    fn validation_failure_carries_reason() {
        let failed = FailedRecord {
            record: QaRecord::unvalidated(3.into(), QaType::Safety, raw()),
            detail: FailureDetail::Validation {
                error: "no valid 'Step N: ...' lines in <key>".into(),
            },
        };
        let v = serde_json::to_value(&failed).unwrap();
        assert_eq!(v["id"], 3);
        assert_eq!(v["error"], "no valid 'Step N: ...' lines in <key>");
        assert!(v.get("check_report").is_none());

        let back: FailedRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, failed);
    }

    #[test]
    fn quality_failure_carries_counts() {
        let failed = FailedRecord {
            record: QaRecord::validated("p2".into(), QaType::Scaling, raw(), &plan()),
            detail: FailureDetail::quality(QualityReport::malformed("garbled")),
        };
        let v = serde_json::to_value(&failed).unwrap();
        assert_eq!(v["error"], 6);
        assert_eq!(v["error1"], 5);
        assert_eq!(
            v["check_report"]["raw_validation_output"],
            serde_json::Value::from("garbled")
        );
    }

    #[test]
    fn id_only_ignores_the_rest() {
        let line = r#"{"id": "p9", "type": "not-a-type", "junk": [1, 2]}"#;
        let parsed: IdOnly = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.id, RecordId::from("p9"));
    }
}
