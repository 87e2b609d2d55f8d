//! Short-answer evaluation tasks: restoring step order, judging whether a
//! protocol contains an error, and multiple-choice protocol questions.
//!
//! A sample holds a question and a gold answer, given either as
//! `question`/`answer` fields or as the first two `conversations[].value`
//! entries. Rows are written one per sample, failed parses included, and
//! the last line of the output is `{"report": ...}`.

use crate::collaborator::Completion;
use crate::error::{RecipeError, Result};
use crate::eval::{Aggregator, EvalReport};
use crate::io;
use crate::prompts;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info, warn};

static STEP_LINE_RE: OnceLock<Regex> = OnceLock::new();
static INDEX_LIST_RE: OnceLock<Regex> = OnceLock::new();
static ANSWER_TAG_RE: OnceLock<Regex> = OnceLock::new();
static CHOICE_LINE_RE: OnceLock<Regex> = OnceLock::new();
static CONFIDENCE_RE: OnceLock<Regex> = OnceLock::new();
static LEADING_LETTER_RE: OnceLock<Regex> = OnceLock::new();
static ANY_LETTER_RE: OnceLock<Regex> = OnceLock::new();
static OPTION_TEXT_RE: OnceLock<Regex> = OnceLock::new();

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap())
}

// ---------------------------------------------------------------------------
// TaskKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Put shuffled `Step i:` lines back in order; answer is an index list.
    Ordering,
    /// Say whether a protocol is correct; answer is true/false.
    ErrorCheck,
    /// Pick one of options A-E and give a confidence.
    ProtocolQa,
}

impl TaskKind {
    pub fn all() -> &'static [TaskKind] {
        &[TaskKind::Ordering, TaskKind::ErrorCheck, TaskKind::ProtocolQa]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Ordering => "ordering",
            TaskKind::ErrorCheck => "error_check",
            TaskKind::ProtocolQa => "protocol_qa",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = RecipeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        TaskKind::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| RecipeError::InvalidInput(format!("unknown task '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// AnswerError
// ---------------------------------------------------------------------------

/// Why a sample could not be scored. Written to the row's `error` field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnswerError {
    #[error("no 'Step i: ...' lines in question")]
    NoSteps,

    #[error("no parsable index list")]
    NoList,

    #[error("index list contains non-integer values")]
    NotIntegers,

    #[error("indices are not a permutation of 1..={0}")]
    NotPermutation(usize),

    #[error("no true/false verdict")]
    NoVerdict,

    #[error("empty answer")]
    Empty,

    #[error("unusable gold answer: {0}")]
    BadGold(String),

    #[error("generation failed: {0}")]
    Generation(String),
}

// ---------------------------------------------------------------------------
// Answer parsing
// ---------------------------------------------------------------------------

/// Drop any reasoning or chat-template text before the final answer.
fn final_answer(text: &str) -> &str {
    let text = text.rsplit("</think>").next().unwrap_or(text);
    text.rsplit("[/INST]").next().unwrap_or(text)
}

/// Step texts of every `Step i: ...` line, in order of appearance.
pub fn parse_steps(question: &str) -> Vec<String> {
    let re = regex(&STEP_LINE_RE, r"(?i)^\s*Step\s*\d+\s*:\s*(.+?)\s*$");
    question
        .lines()
        .filter_map(|line| re.captures(line))
        .map(|caps| caps[1].trim().to_string())
        .collect()
}

fn index_values(items: &[Value]) -> std::result::Result<Vec<i64>, AnswerError> {
    items
        .iter()
        .map(|v| match v {
            Value::Number(n) => n.as_i64().ok_or(AnswerError::NotIntegers),
            Value::String(s) => s.trim().parse().map_err(|_| AnswerError::NotIntegers),
            _ => Err(AnswerError::NotIntegers),
        })
        .collect()
}

/// Parse a 1-based ordering of `n` steps. The whole answer is tried as a
/// list first, then the last `[i, j, ...]` in it. The result must be a
/// permutation of `1..=n`.
pub fn parse_order(text: &str, n: usize) -> std::result::Result<Vec<usize>, AnswerError> {
    let s = final_answer(text.trim()).trim();
    let values = match serde_json::from_str::<Value>(s) {
        Ok(Value::Array(items)) => index_values(&items)?,
        _ => {
            let re = regex(&INDEX_LIST_RE, r"\[(?:\s*\d+\s*(?:,\s*\d+\s*)*)\]");
            let last = re.find_iter(s).last().ok_or(AnswerError::NoList)?;
            match serde_json::from_str::<Value>(last.as_str()) {
                Ok(Value::Array(items)) => index_values(&items)?,
                _ => return Err(AnswerError::NoList),
            }
        }
    };
    check_permutation(&values, n)
}

fn check_permutation(values: &[i64], n: usize) -> std::result::Result<Vec<usize>, AnswerError> {
    let distinct: BTreeSet<i64> = values.iter().copied().collect();
    let expected: BTreeSet<i64> = (1..=n as i64).collect();
    if values.len() != n || distinct != expected {
        return Err(AnswerError::NotPermutation(n));
    }
    Ok(values.iter().map(|&v| v as usize).collect())
}

/// Concordant and total pair counts between two orderings of the same
/// indices.
pub fn order_pairs(gold: &[usize], predicted: &[usize]) -> (usize, usize) {
    let rank = |order: &[usize]| -> BTreeMap<usize, usize> {
        order.iter().enumerate().map(|(i, &v)| (v, i)).collect()
    };
    let (gold_rank, pred_rank) = (rank(gold), rank(predicted));
    let mut concordant = 0;
    let mut total = 0;
    for (i, a) in gold.iter().enumerate() {
        for b in &gold[i + 1..] {
            let g = gold_rank[a] as i64 - gold_rank[b] as i64;
            let p = match (pred_rank.get(a), pred_rank.get(b)) {
                (Some(&pa), Some(&pb)) => pa as i64 - pb as i64,
                _ => 0,
            };
            if g * p > 0 {
                concordant += 1;
            }
            total += 1;
        }
    }
    (concordant, total)
}

fn tau(concordant: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (2.0 * concordant as f64 - total as f64) / total as f64
}

/// The true/false verdict inside `[ANSWER_START]...[ANSWER_END]`, or on the
/// last line when the tags are missing. "true" is checked first.
pub fn parse_verdict(text: &str) -> Option<bool> {
    let s = final_answer(text);
    let re = regex(&ANSWER_TAG_RE, r"(?s)\[ANSWER_START\](.*?)\[ANSWER_END\]");
    let answer = match re.captures(s) {
        Some(caps) => caps[1].trim().to_lowercase(),
        None => s.trim().rsplit('\n').next().unwrap_or_default().trim().to_lowercase(),
    };
    if answer.contains("true") {
        Some(true)
    } else if answer.contains("false") {
        Some(false)
    } else {
        None
    }
}

/// Option letter to option text, read from lines like `A) ...`, `B. ...`
/// or `C: ...`. A later line for the same letter wins.
pub fn parse_choices(question: &str) -> BTreeMap<char, String> {
    let re = regex(&CHOICE_LINE_RE, r"^\s*([A-Ea-e])\s*[\)\.：:\-、]?\s*(.+?)\s*$");
    let mut choices = BTreeMap::new();
    for line in question.lines() {
        if let Some(caps) = re.captures(line) {
            let letter = caps[1].to_ascii_uppercase();
            if let Some(c) = letter.chars().next() {
                choices.insert(c, caps[2].trim().to_string());
            }
        }
    }
    choices
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChoiceAnswer {
    /// The chosen option, written as `L) text` when a letter was found.
    pub option: String,
    /// 0-100; 0 when missing.
    pub confidence: u8,
}

/// Parse `{option} & {confidence}`. A letter found in the answer is
/// expanded to its full option text from `choices`. `None` for a blank
/// answer.
pub fn parse_choice(text: &str, choices: &BTreeMap<char, String>) -> Option<ChoiceAnswer> {
    let s = text.trim();
    if s.is_empty() {
        return None;
    }

    let confidence = regex(&CONFIDENCE_RE, r"&\s*([0-9]+(?:\.[0-9]+)?)")
        .captures(s)
        .and_then(|caps| caps[1].parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.round().clamp(0.0, 100.0) as u8)
        .unwrap_or(0);

    let letter = regex(&LEADING_LETTER_RE, r"^\s*([A-Ea-e])\b")
        .captures(s)
        .or_else(|| regex(&ANY_LETTER_RE, r"\b([A-Ea-e])\b").captures(s))
        .and_then(|caps| caps[1].chars().next())
        .map(|c| c.to_ascii_uppercase());

    let option = match letter {
        None => s.to_string(),
        Some(l) => match choices.get(&l) {
            Some(choice) => format!("{l}) {choice}"),
            None => match regex(
                &OPTION_TEXT_RE,
                r"^\s*[A-Ea-e]\s*[\)\.：:\-、]?\s*(.+?)\s*(?:&|$)",
            )
            .captures(s)
            {
                Some(caps) => format!("{l}) {}", caps[1].trim()),
                None => format!("{l})"),
            },
        },
    };
    Some(ChoiceAnswer { option, confidence })
}

/// Collapse runs of whitespace for exact option comparison.
pub fn normalize_option(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// TaskSample
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TaskSample {
    pub id: Value,
    pub qa_type: String,
    pub level: String,
    pub question: String,
    pub gold: Value,
    pub model_output: Option<String>,
}

impl TaskSample {
    pub fn from_value(value: &Value, index: usize) -> Self {
        let turn = |i: usize| {
            value
                .get("conversations")
                .and_then(|c| c.get(i))
                .and_then(|t| t.get("value"))
                .cloned()
        };
        let label = |key: &str| match value.get(key) {
            None | Some(Value::Null) => "unknown".to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        let question = value
            .get("question")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| turn(0).and_then(|v| v.as_str().map(str::to_string)))
            .unwrap_or_default();
        let model_output = ["model_output", "generated_response"]
            .iter()
            .find_map(|k| value.get(*k).and_then(Value::as_str))
            .map(str::to_string);
        Self {
            id: value
                .get("id")
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| Value::from(index)),
            qa_type: label("type"),
            level: label("level"),
            question,
            gold: value
                .get("answer")
                .filter(|v| !v.is_null())
                .cloned()
                .or_else(|| turn(1))
                .unwrap_or(Value::Null),
            model_output,
        }
    }
}

pub fn load_task_samples(path: &Path) -> Result<Vec<TaskSample>> {
    let batch = crate::protocol::load_protocols(path)?;
    if batch.malformed_lines > 0 {
        warn!(lines = batch.malformed_lines, "skipped malformed sample lines");
    }
    Ok(batch
        .records
        .iter()
        .enumerate()
        .map(|(i, v)| TaskSample::from_value(v, i))
        .collect())
}

fn gold_text(gold: &Value) -> Option<String> {
    match gold {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn gold_order(gold: &Value, n: usize) -> std::result::Result<Vec<usize>, AnswerError> {
    let bad = || AnswerError::BadGold(gold.to_string());
    let items = match gold {
        Value::Array(items) => items.clone(),
        Value::String(s) => match serde_json::from_str::<Value>(s.trim()) {
            Ok(Value::Array(items)) => items,
            _ => return Err(bad()),
        },
        _ => return Err(bad()),
    };
    let values = index_values(&items).map_err(|_| bad())?;
    check_permutation(&values, n).map_err(|_| bad())
}

fn gold_verdict(gold: &Value) -> std::result::Result<bool, AnswerError> {
    match gold {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s.trim().eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.trim().eq_ignore_ascii_case("false") => Ok(false),
        other => Err(AnswerError::BadGold(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Rows and report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TaskRow {
    pub id: Value,
    #[serde(rename = "type")]
    pub qa_type: String,
    pub level: String,
    pub question: String,
    pub gold: Value,
    pub model_output: String,
    /// Parsed answer; null when parsing failed.
    pub prediction: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metrics: BTreeMap<String, f64>,
}

impl TaskRow {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub task: TaskKind,
    pub total: usize,
    pub evaluated: usize,
    pub failed: usize,
    pub failure_rate: f64,
    /// Corpus-level metrics over the evaluated samples.
    pub metrics: BTreeMap<String, f64>,
    /// Per-sample metric means, overall and by level and type.
    pub breakdown: EvalReport,
}

/// What a scored sample contributes to the corpus-level metrics.
enum Scored {
    Order { concordant: usize, pairs: usize },
    Verdict { gold: bool, predicted: bool },
    Choice { correct: bool, confidence: u8 },
}

#[derive(Debug, Default)]
struct Tally {
    total: usize,
    failed: usize,
    concordant: usize,
    pairs: usize,
    true_pos: usize,
    false_pos: usize,
    false_neg: usize,
    brier_sum: f64,
    brier_n: usize,
}

impl Tally {
    fn add(&mut self, scored: Option<&Scored>) {
        self.total += 1;
        match scored {
            None => self.failed += 1,
            Some(Scored::Order { concordant, pairs }) => {
                self.concordant += concordant;
                self.pairs += pairs;
            }
            // "false" (an error was found) is the positive class.
            Some(Scored::Verdict { gold, predicted }) => match (*predicted, *gold) {
                (false, false) => self.true_pos += 1,
                (false, true) => self.false_pos += 1,
                (true, false) => self.false_neg += 1,
                (true, true) => {}
            },
            Some(Scored::Choice {
                correct,
                confidence,
            }) => {
                let p = f64::from(*confidence) / 100.0;
                let y = if *correct { 1.0 } else { 0.0 };
                self.brier_sum += (p - y) * (p - y);
                self.brier_n += 1;
            }
        }
    }

    fn metrics(&self, kind: TaskKind, means: &BTreeMap<String, Value>) -> BTreeMap<String, f64> {
        let mean = |name: &str| means.get(name).and_then(Value::as_f64).unwrap_or(0.0);
        let ratio = |a: usize, b: usize| if b == 0 { 0.0 } else { a as f64 / b as f64 };
        let mut out = BTreeMap::new();
        match kind {
            TaskKind::Ordering => {
                out.insert("exact_match".to_string(), mean("exact_match"));
                out.insert("kendall_tau".to_string(), tau(self.concordant, self.pairs));
            }
            TaskKind::ErrorCheck => {
                let precision = ratio(self.true_pos, self.true_pos + self.false_pos);
                let recall = ratio(self.true_pos, self.true_pos + self.false_neg);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                out.insert("accuracy".to_string(), mean("accuracy"));
                out.insert("precision".to_string(), precision);
                out.insert("recall".to_string(), recall);
                out.insert("f1".to_string(), f1);
            }
            TaskKind::ProtocolQa => {
                out.insert("accuracy".to_string(), mean("accuracy"));
                if self.brier_n > 0 {
                    out.insert("brier_score".to_string(), self.brier_sum / self.brier_n as f64);
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// TaskHarness
// ---------------------------------------------------------------------------

pub struct TaskHarness<'a> {
    kind: TaskKind,
    generator: Option<&'a dyn Completion>,
    temperature: f32,
}

impl<'a> TaskHarness<'a> {
    /// `generator` answers samples that have no recorded output.
    pub fn new(kind: TaskKind, generator: Option<&'a dyn Completion>, temperature: f32) -> Self {
        Self {
            kind,
            generator,
            temperature,
        }
    }

    pub fn prompt(&self, sample: &TaskSample) -> String {
        match self.kind {
            TaskKind::Ordering => {
                prompts::ordering_prompt(&sample.question, parse_steps(&sample.question).len())
            }
            TaskKind::ErrorCheck => sample.question.clone(),
            TaskKind::ProtocolQa => prompts::choice_prompt(&sample.question),
        }
    }

    fn answer(&self, sample: &TaskSample) -> std::result::Result<String, AnswerError> {
        if let Some(output) = &sample.model_output {
            return Ok(output.clone());
        }
        let Some(generator) = self.generator else {
            return Ok(String::new());
        };
        generator
            .complete("", &self.prompt(sample), self.temperature)
            .map(|text| text.trim().to_string())
            .map_err(|e| {
                warn!(id = %sample.id, error = %e, "answer generation failed");
                AnswerError::Generation(e.to_string())
            })
    }

    /// Score one sample. Failed parses come back as rows with `error` set
    /// and no metrics.
    pub fn evaluate(&self, sample: &TaskSample) -> TaskRow {
        self.evaluate_scored(sample).0
    }

    fn evaluate_scored(&self, sample: &TaskSample) -> (TaskRow, Option<Scored>) {
        let (output, result) = match self.answer(sample) {
            Ok(output) => {
                let result = self.score(sample, &output);
                (output, result)
            }
            Err(e) => (String::new(), Err(e)),
        };

        let mut row = TaskRow {
            id: sample.id.clone(),
            qa_type: sample.qa_type.clone(),
            level: sample.level.clone(),
            question: sample.question.clone(),
            gold: sample.gold.clone(),
            model_output: output,
            prediction: Value::Null,
            error: None,
            metrics: BTreeMap::new(),
        };
        match result {
            Ok((prediction, metrics, scored)) => {
                row.prediction = prediction;
                row.metrics = metrics;
                (row, Some(scored))
            }
            Err(e) => {
                debug!(id = %sample.id, error = %e, "sample not scored");
                row.error = Some(e.to_string());
                (row, None)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn score(
        &self,
        sample: &TaskSample,
        output: &str,
    ) -> std::result::Result<(Value, BTreeMap<String, f64>, Scored), AnswerError> {
        let mut metrics = BTreeMap::new();
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        match self.kind {
            TaskKind::Ordering => {
                let n = parse_steps(&sample.question).len();
                if n == 0 {
                    return Err(AnswerError::NoSteps);
                }
                let gold = gold_order(&sample.gold, n)?;
                let predicted = parse_order(output, n)?;
                let (concordant, pairs) = order_pairs(&gold, &predicted);
                metrics.insert("exact_match".to_string(), flag(gold == predicted));
                metrics.insert("kendall_tau".to_string(), tau(concordant, pairs));
                Ok((
                    Value::from(predicted),
                    metrics,
                    Scored::Order { concordant, pairs },
                ))
            }
            TaskKind::ErrorCheck => {
                let gold = gold_verdict(&sample.gold)?;
                let predicted = parse_verdict(output).ok_or(AnswerError::NoVerdict)?;
                metrics.insert("accuracy".to_string(), flag(gold == predicted));
                Ok((
                    Value::Bool(predicted),
                    metrics,
                    Scored::Verdict { gold, predicted },
                ))
            }
            TaskKind::ProtocolQa => {
                let gold = gold_text(&sample.gold)
                    .filter(|g| !g.is_empty())
                    .ok_or_else(|| AnswerError::BadGold(sample.gold.to_string()))?;
                let choices = parse_choices(&sample.question);
                let answer = parse_choice(output, &choices).ok_or(AnswerError::Empty)?;
                let correct = normalize_option(&answer.option) == normalize_option(&gold);
                metrics.insert("accuracy".to_string(), flag(correct));
                metrics.insert("confidence".to_string(), f64::from(answer.confidence));
                let scored = Scored::Choice {
                    correct,
                    confidence: answer.confidence,
                };
                let prediction = serde_json::json!({
                    "option": answer.option,
                    "confidence": answer.confidence,
                });
                Ok((prediction, metrics, scored))
            }
        }
    }

    /// Evaluate every sample, writing one row per sample and a closing
    /// report line to `output` (overwritten).
    pub fn run(&self, samples: &[TaskSample], output: &Path) -> Result<TaskReport> {
        io::truncate(output)?;
        let mut file = io::open_append(output)?;
        let mut aggregator = Aggregator::default();
        let mut tally = Tally::default();

        for sample in samples {
            let (row, scored) = self.evaluate_scored(sample);
            tally.add(scored.as_ref());
            if !row.failed() {
                aggregator.add_scores(&row.level, &row.qa_type, &row.metrics);
            }
            let mut line = serde_json::to_vec(&row)?;
            line.push(b'\n');
            io::append_synced(&mut file, &line)?;
        }

        let breakdown = aggregator.report();
        let report = TaskReport {
            task: self.kind,
            total: tally.total,
            evaluated: tally.total - tally.failed,
            failed: tally.failed,
            failure_rate: if tally.total == 0 {
                0.0
            } else {
                tally.failed as f64 / tally.total as f64
            },
            metrics: tally.metrics(self.kind, &breakdown.overall),
            breakdown,
        };
        let mut line = serde_json::to_vec(&serde_json::json!({ "report": report }))?;
        line.push(b'\n');
        io::append_synced(&mut file, &line)?;
        info!(
            task = %self.kind,
            evaluated = report.evaluated,
            failed = report.failed,
            "task evaluation finished"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
