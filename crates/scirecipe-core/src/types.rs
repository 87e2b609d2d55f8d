use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// QaType
// ---------------------------------------------------------------------------

/// Category tag of a generated question/answer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaType {
    Retrieval,
    Planning,
    Troubleshooting,
    Constraint,
    Scaling,
    Safety,
    OverviewQa,
    SpecificStepQa,
}

impl QaType {
    pub fn all() -> &'static [QaType] {
        &[
            QaType::Retrieval,
            QaType::Planning,
            QaType::Troubleshooting,
            QaType::Constraint,
            QaType::Scaling,
            QaType::Safety,
            QaType::OverviewQa,
            QaType::SpecificStepQa,
        ]
    }

    /// The six problem-solving categories sampled from in `sampled` mode.
    pub fn problem_solving() -> &'static [QaType] {
        &QaType::all()[..6]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QaType::Retrieval => "retrieval",
            QaType::Planning => "planning",
            QaType::Troubleshooting => "troubleshooting",
            QaType::Constraint => "constraint",
            QaType::Scaling => "scaling",
            QaType::Safety => "safety",
            QaType::OverviewQa => "overview_qa",
            QaType::SpecificStepQa => "specific_step_qa",
        }
    }

    /// Generation instruction embedded in the user prompt for this category.
    pub fn instruction(self) -> &'static str {
        match self {
            QaType::Retrieval => {
                "Write a question that requires extracting exact, lab-ready parameters \
                 (values, units, tolerances, conditions) from the protocol. Reward \
                 verifiable, internally consistent answers; penalize guesswork."
            }
            QaType::Planning => {
                "Write a question that turns a high-level research objective into an \
                 executable step-by-step workflow with correct dependencies, required \
                 reagents and equipment, and quality-control checkpoints."
            }
            QaType::Troubleshooting => {
                "Write a question describing a concrete experimental failure or \
                 unexpected result. The answer diagnoses likely causes, proposes \
                 single-variable corrective actions and explains how to verify the fix."
            }
            QaType::Constraint => {
                "Write a question where a critical resource (reagent, equipment, time, \
                 budget) is missing or limited. The answer adapts the plan with an \
                 acceptable alternative and states the trade-offs."
            }
            QaType::Scaling => {
                "Write a question that requires unit conversion or scaling the protocol \
                 up or down while preserving ratios and practical limits such as \
                 minimum pipetting volumes."
            }
            QaType::Safety => {
                "Write a question whose answer must identify hazards of the chemicals, \
                 biological materials or procedures involved and state PPE, disposal and \
                 compliance requirements."
            }
            QaType::OverviewQa => {
                "Write a question asking for a high-level summary of the workflow. The \
                 <key> should contain roughly 2 to 6 steps summarizing the major stages \
                 in order."
            }
            QaType::SpecificStepQa => {
                "Write a question asking for a granular breakdown of exactly one major \
                 section of the protocol, chosen so that its <key> has roughly 2 to 6 \
                 atomic steps derived from the lowest-level procedural text."
            }
        }
    }
}

impl fmt::Display for QaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QaType {
    type Err = crate::error::RecipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QaType::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::error::RecipeError::UnknownQaType(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
