use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ActionStep
// ---------------------------------------------------------------------------

/// One atomic laboratory operation. Field order matches the serialized
/// `Step N: {...}` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionStep {
    pub action: String,
    pub objects: Vec<String>,
    pub parameters: Vec<String>,
}

// ---------------------------------------------------------------------------
// ActionPlan
// ---------------------------------------------------------------------------

/// Ordered action steps, numbered 1..N in their serialized form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionPlan {
    steps: Vec<ActionStep>,
}

impl ActionPlan {
    pub fn new(steps: Vec<ActionStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[ActionStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The action label of every step, in order.
    pub fn actions(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.action.as_str()).collect()
    }

    /// Distinct action labels in order of first appearance.
    pub fn distinct_actions(&self) -> Vec<String> {
        distinct(self.steps.iter().map(|s| s.action.as_str()))
    }

    /// Render as `Step N: {json}` lines, one per step.
    pub fn to_block(&self) -> String {
        let mut out = String::new();
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            // ActionStep holds only strings, so serialization cannot fail.
            let json = serde_json::to_string(step).unwrap_or_default();
            out.push_str(&format!("Step {}: {}", i + 1, json));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// NarrativePlan
// ---------------------------------------------------------------------------

/// Human-readable imperative sentences paralleling an [`ActionPlan`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NarrativePlan {
    sentences: Vec<String>,
}

impl NarrativePlan {
    pub fn new(sentences: Vec<String>) -> Self {
        Self { sentences }
    }

    pub fn sentences(&self) -> &[String] {
        &self.sentences
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    pub fn to_block(&self) -> String {
        self.sentences
            .iter()
            .enumerate()
            .map(|(i, s)| format!("Step {}: {}", i + 1, s))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Order-preserving de-duplication.
pub fn distinct<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if seen.insert(item) {
            out.push(item.to_string());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
