//! Secondary content review.
//!
//! An independent reviewer grades a record against six fixed criteria and
//! answers in a tagged report. A criterion passes only when its text is
//! exactly the designated pass sentence. A report that cannot be parsed
//! fails every criterion.

use crate::blocks::RawRecord;
use crate::collaborator::Completion;
use crate::prompts;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::warn;

pub const MALFORMED: &str = "Validation report malformed.";

// ---------------------------------------------------------------------------
// Criterion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Criterion {
    Accuracy,
    SafetyCompliance,
    LogicalCoherence,
    ClarityAmbiguity,
    GeneralitySpecificity,
    EfficiencyResourceOptimization,
}

impl Criterion {
    pub fn all() -> &'static [Criterion] {
        &[
            Criterion::Accuracy,
            Criterion::SafetyCompliance,
            Criterion::LogicalCoherence,
            Criterion::ClarityAmbiguity,
            Criterion::GeneralitySpecificity,
            Criterion::EfficiencyResourceOptimization,
        ]
    }

    /// Report key and tag name.
    pub fn key(self) -> &'static str {
        match self {
            Criterion::Accuracy => "accuracy_check",
            Criterion::SafetyCompliance => "safety_compliance_check",
            Criterion::LogicalCoherence => "logical_coherence_check",
            Criterion::ClarityAmbiguity => "clarity_ambiguity_check",
            Criterion::GeneralitySpecificity => "generality_specificity_check",
            Criterion::EfficiencyResourceOptimization => "efficiency_resource_optimization_check",
        }
    }

    pub fn pass_sentence(self) -> &'static str {
        match self {
            Criterion::Accuracy => "No significant scientific inaccuracies found.",
            Criterion::SafetyCompliance => {
                "Safety and compliance information is adequate and accurate."
            }
            Criterion::LogicalCoherence => "Logical coherence and actionability are sound.",
            Criterion::ClarityAmbiguity => "All information is clear and unambiguous.",
            Criterion::GeneralitySpecificity => {
                "Appropriate balance of generality and specificity."
            }
            Criterion::EfficiencyResourceOptimization => {
                "Plan demonstrates good efficiency and resource optimization."
            }
        }
    }
}

// ---------------------------------------------------------------------------
// QualityReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReport {
    pub accuracy_check: String,
    pub safety_compliance_check: String,
    pub logical_coherence_check: String,
    pub clarity_ambiguity_check: String,
    pub generality_specificity_check: String,
    pub efficiency_resource_optimization_check: String,
    /// Reviewer output kept verbatim when the tag structure was missing.
    #[serde(
        rename = "raw_validation_output",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub raw_output: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Severity {
    /// Failing criteria.
    pub total: usize,
    /// Failing criteria other than accuracy.
    pub excluding_accuracy: usize,
}

impl QualityReport {
    /// A report failing every criterion, keeping the reviewer text.
    pub fn malformed(raw: impl Into<String>) -> Self {
        Self {
            accuracy_check: MALFORMED.to_string(),
            safety_compliance_check: MALFORMED.to_string(),
            logical_coherence_check: MALFORMED.to_string(),
            clarity_ambiguity_check: MALFORMED.to_string(),
            generality_specificity_check: MALFORMED.to_string(),
            efficiency_resource_optimization_check: MALFORMED.to_string(),
            raw_output: Some(raw.into()),
        }
    }

    pub fn get(&self, criterion: Criterion) -> &str {
        match criterion {
            Criterion::Accuracy => &self.accuracy_check,
            Criterion::SafetyCompliance => &self.safety_compliance_check,
            Criterion::LogicalCoherence => &self.logical_coherence_check,
            Criterion::ClarityAmbiguity => &self.clarity_ambiguity_check,
            Criterion::GeneralitySpecificity => &self.generality_specificity_check,
            Criterion::EfficiencyResourceOptimization => {
                &self.efficiency_resource_optimization_check
            }
        }
    }

    pub fn criterion_passed(&self, criterion: Criterion) -> bool {
        self.get(criterion) == criterion.pass_sentence()
    }

    pub fn passed(&self) -> bool {
        self.raw_output.is_none() && Criterion::all().iter().all(|&c| self.criterion_passed(c))
    }

    pub fn severity(&self) -> Severity {
        let failing: Vec<Criterion> = Criterion::all()
            .iter()
            .copied()
            .filter(|&c| !self.criterion_passed(c))
            .collect();
        Severity {
            total: failing.len(),
            excluding_accuracy: failing
                .iter()
                .filter(|&&c| c != Criterion::Accuracy)
                .count(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

static REPORT_RE: OnceLock<Regex> = OnceLock::new();

fn report_re() -> &'static Regex {
    REPORT_RE.get_or_init(|| {
        let mut pattern = String::from(r"(?is)<validation_report>.*?");
        for c in Criterion::all() {
            let tag = c.key();
            pattern.push_str(&format!("<{tag}>(?P<{tag}>.*?)</{tag}>.*?"));
        }
        pattern.push_str("</validation_report>");
        Regex::new(&pattern).unwrap()
    })
}

/// Parse reviewer output. Missing structure yields [`QualityReport::malformed`].
pub fn parse_report(text: &str) -> QualityReport {
    let Some(caps) = report_re().captures(text) else {
        return QualityReport::malformed(text);
    };
    let field = |c: Criterion| caps[c.key()].trim().to_string();
    QualityReport {
        accuracy_check: field(Criterion::Accuracy),
        safety_compliance_check: field(Criterion::SafetyCompliance),
        logical_coherence_check: field(Criterion::LogicalCoherence),
        clarity_ambiguity_check: field(Criterion::ClarityAmbiguity),
        generality_specificity_check: field(Criterion::GeneralitySpecificity),
        efficiency_resource_optimization_check: field(Criterion::EfficiencyResourceOptimization),
        raw_output: None,
    }
}

// ---------------------------------------------------------------------------
// QualityGate
// ---------------------------------------------------------------------------

pub struct QualityGate<'a> {
    reviewer: &'a dyn Completion,
    temperature: f32,
}

impl<'a> QualityGate<'a> {
    pub fn new(reviewer: &'a dyn Completion, temperature: f32) -> Self {
        Self {
            reviewer,
            temperature,
        }
    }

    /// Review one question/answer pair. A reviewer call that fails is
    /// treated like an unparseable report.
    pub fn review(&self, question: &str, answer: &str) -> QualityReport {
        let user = prompts::review_user_prompt(question, answer);
        match self
            .reviewer
            .complete(prompts::REVIEW_SYSTEM, &user, self.temperature)
        {
            Ok(text) => parse_report(&text),
            Err(e) => {
                warn!(error = %e, "quality reviewer call failed");
                QualityReport::malformed(format!("reviewer error: {e}"))
            }
        }
    }

    pub fn review_record(&self, record: &RawRecord) -> QualityReport {
        self.review(&record.question, &record.answer_block())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::CollaboratorError;
    use std::cell::RefCell;

    fn passing_report_text() -> String {
        let mut text = String::from("Review complete.\n<validation_report>\n");
        for c in Criterion::all() {
            text.push_str(&format!("<{0}> {1} </{0}>\n", c.key(), c.pass_sentence()));
        }
        text.push_str("</validation_report>");
        text
    }

    struct Canned {
        reply: Result<String, String>,
        prompts: RefCell<Vec<String>>,
    }

    impl Completion for Canned {
        fn complete(&self, _s: &str, user: &str, _t: f32) -> Result<String, CollaboratorError> {
            self.prompts.borrow_mut().push(user.to_string());
            self.reply.clone().map_err(CollaboratorError::Http)
        }
    }

    #[test]
    fn exact_pass_sentences_pass() {
        let report = parse_report(&passing_report_text());
        assert!(report.passed());
        assert_eq!(
            report.severity(),
            Severity {
                total: 0,
                excluding_accuracy: 0
            }
        );
    }

    #[test]
    fn near_miss_accuracy_fails() {
        let text = passing_report_text().replace(
            "No significant scientific inaccuracies found.",
            "No significant scientific inaccuracies found. Reviewed.",
        );
        let report = parse_report(&text);
        assert!(!report.criterion_passed(Criterion::Accuracy));
        assert!(!report.passed());
        assert_eq!(
            report.severity(),
            Severity {
                total: 1,
                excluding_accuracy: 0
            }
        );
    }

    #[test]
    fn non_accuracy_failure_counts_in_both() {
        let text = passing_report_text().replace(
            "All information is clear and unambiguous.",
            "Step 3 does not say which buffer.",
        );
        let report = parse_report(&text);
        assert_eq!(report.clarity_ambiguity_check, "Step 3 does not say which buffer.");
        assert_eq!(
            report.severity(),
            Severity {
                total: 1,
                excluding_accuracy: 1
            }
        );
    }

    #[test]
    fn missing_structure_fails_closed() {
        let report = parse_report("Looks fine to me!");
        assert!(!report.passed());
        assert_eq!(report.accuracy_check, MALFORMED);
        assert_eq!(report.raw_output.as_deref(), Some("Looks fine to me!"));
        assert_eq!(
            report.severity(),
            Severity {
                total: 6,
                excluding_accuracy: 5
            }
        );
    }

    #[test]
    fn tags_parse_case_insensitively() {
        let text = passing_report_text()
            .replace("<validation_report>", "<VALIDATION_REPORT>")
            .replace("</validation_report>", "</Validation_Report>");
        assert!(parse_report(&text).passed());
    }

    #[test]
    fn malformed_report_serializes_raw_output() {
        let json = serde_json::to_value(QualityReport::malformed("oops")).unwrap();
        assert_eq!(json["raw_validation_output"], "oops");
        let parsed = serde_json::to_value(parse_report(&passing_report_text())).unwrap();
        assert!(parsed.get("raw_validation_output").is_none());
        assert_eq!(parsed.as_object().unwrap().len(), 6);
    }

    #[test]
    fn gate_sends_question_and_answer() {
        let reviewer = Canned {
            reply: Ok(passing_report_text()),
            prompts: RefCell::new(Vec::new()),
        };
        let gate = QualityGate::new(&reviewer, 0.2);
        let record = RawRecord {
            question: "How much TEMED?".into(),
            think: "Scale by 1/5.".into(),
            key: "Step 1: {}".into(),
            orc: "Step 1: Add 0.5 µl temed.".into(),
            note: "TEMED is toxic.".into(),
        };
        assert!(gate.review_record(&record).passed());
        let sent = reviewer.prompts.borrow();
        assert!(sent[0].contains("How much TEMED?"));
        assert!(sent[0].contains("<orc>Step 1: Add 0.5 µl temed.</orc>"));
    }

    #[test]
    fn reviewer_failure_fails_closed() {
        let reviewer = Canned {
            reply: Err("timeout".into()),
            prompts: RefCell::new(Vec::new()),
        };
        let report = QualityGate::new(&reviewer, 0.2).review("q", "a");
        assert!(!report.passed());
        assert_eq!(report.severity().total, 6);
    }
}
