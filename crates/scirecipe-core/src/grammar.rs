//! Line grammar for numbered step blocks.
//!
//! Both the machine plan (`<key>`) and its narrative gloss (`<orc>`) are
//! written as `Step N: payload` lines. The scanner only recovers
//! `(number, payload)` pairs; judging them is left to [`crate::schema`].

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// PayloadMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    /// Capture a brace-delimited fragment; JSON parsing happens later.
    Json,
    /// Capture the rest of the line verbatim (trailing whitespace trimmed).
    Text,
}

static STEP_JSON_LINE: OnceLock<Regex> = OnceLock::new();
static STEP_TEXT_LINE: OnceLock<Regex> = OnceLock::new();

fn step_json_line() -> &'static Regex {
    STEP_JSON_LINE
        .get_or_init(|| Regex::new(r"(?mi)^\s*Step\s+([0-9]+):\s*(\{.*\})\s*$").unwrap())
}

fn step_text_line() -> &'static Regex {
    STEP_TEXT_LINE.get_or_init(|| Regex::new(r"(?mi)^\s*Step\s+([0-9]+):\s*(.+?)\s*$").unwrap())
}

// ---------------------------------------------------------------------------
// Scan output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepEntry {
    pub number: usize,
    pub payload: String,
}

/// Numbering anomalies seen while scanning. They never stop the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrammarIssue {
    Duplicate(usize),
    OutOfOrder { number: usize, previous: usize },
    BadNumber(String),
}

impl fmt::Display for GrammarIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarIssue::Duplicate(n) => write!(f, "step {n} appears more than once"),
            GrammarIssue::OutOfOrder { number, previous } => {
                write!(f, "step {number} follows step {previous}")
            }
            GrammarIssue::BadNumber(raw) => write!(f, "step number '{raw}' is not an integer"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepScan {
    pub entries: Vec<StepEntry>,
    pub issues: Vec<GrammarIssue>,
}

impl StepScan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Step numbers in order of appearance.
    pub fn numbers(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.number).collect()
    }

    /// True iff the numbers, in order of appearance, are exactly `1..=len`.
    pub fn is_contiguous(&self) -> bool {
        self.entries
            .iter()
            .enumerate()
            .all(|(i, e)| e.number == i + 1)
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Scan `block` for `Step N: ...` lines. Non-matching lines are ignored.
pub fn scan_steps(block: &str, mode: PayloadMode) -> StepScan {
    let re = match mode {
        PayloadMode::Json => step_json_line(),
        PayloadMode::Text => step_text_line(),
    };

    let mut scan = StepScan::default();
    let mut seen = std::collections::HashSet::new();
    let mut previous: Option<usize> = None;

    for caps in re.captures_iter(block) {
        let raw = &caps[1];
        let Ok(number) = raw.parse::<usize>() else {
            scan.issues.push(GrammarIssue::BadNumber(raw.to_string()));
            continue;
        };
        if !seen.insert(number) {
            scan.issues.push(GrammarIssue::Duplicate(number));
        } else if let Some(prev) = previous {
            if number < prev {
                scan.issues.push(GrammarIssue::OutOfOrder {
                    number,
                    previous: prev,
                });
            }
        }
        previous = Some(number);
        scan.entries.push(StepEntry {
            number,
            payload: caps[2].trim().to_string(),
        });
    }
    scan
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
