//! Evaluation harness: score model answers against reference records.
//!
//! Each sample yields one output row with structural metrics on `<key>`
//! and text metrics on `<orc>`. Running sums are kept overall, per level
//! and per type; the final line of the output is `{"report": ...}`.

use crate::blocks::extract_answer;
use crate::collaborator::Completion;
use crate::error::Result;
use crate::io;
use crate::prompts::{self, build_eval_prompt};
use crate::protocol::load_protocols;
use crate::scoring::{keyword_tokens, score_key_blocks, StructuredMetrics};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

const ACTIONS_MARKER: &str = "Please note that you can only use the following actions:";

// ---------------------------------------------------------------------------
// EvalSample
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct EvalSample {
    pub id: Value,
    pub qa_type: String,
    pub level: String,
    pub question: String,
    pub key: String,
    pub orc: String,
    /// Allowed actions for the prompt and whether to shuffle them. A
    /// missing `action` is an empty list; `None` when it is not a list.
    pub actions: Option<(Vec<String>, bool)>,
    pub model_output: Option<String>,
}

impl EvalSample {
    /// Read a sample leniently. `action_new`, when it is a list, wins over
    /// `action` and is used in its given order.
    pub fn from_value(value: &Value, index: usize) -> Self {
        let text = |key: &str, default: &str| match value.get(key) {
            None | Some(Value::Null) => default.to_string(),
            Some(Value::String(s)) => s.trim().to_string(),
            Some(other) => other.to_string(),
        };
        let list = |v: &Value| -> Vec<String> {
            v.as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let actions = match (value.get("action_new"), value.get("action")) {
            (Some(v @ Value::Array(_)), _) => Some((list(v), false)),
            (_, Some(v @ Value::Array(_))) => Some((list(v), true)),
            (_, None | Some(Value::Null)) => Some((Vec::new(), true)),
            _ => None,
        };
        Self {
            id: value
                .get("id")
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| Value::String(format!("sample_{index}"))),
            qa_type: text("type", "unknown"),
            level: text("level", "unknown"),
            question: text("question", ""),
            key: text("key", ""),
            orc: text("orc", ""),
            actions,
            model_output: value
                .get("model_output")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    /// Samples without a question or with a non-list `action` are not
    /// evaluated.
    pub fn is_scorable(&self) -> bool {
        !self.question.is_empty() && self.actions.is_some()
    }

    pub fn prompt(&self) -> String {
        match &self.actions {
            Some((actions, shuffle)) => build_eval_prompt(&self.question, actions, *shuffle),
            None => build_eval_prompt(&self.question, &[], false),
        }
    }
}

pub fn load_samples(path: &Path) -> Result<Vec<EvalSample>> {
    let batch = load_protocols(path)?;
    if batch.malformed_lines > 0 {
        warn!(lines = batch.malformed_lines, "skipped malformed sample lines");
    }
    Ok(batch
        .records
        .iter()
        .enumerate()
        .map(|(i, v)| EvalSample::from_value(v, i))
        .collect())
}

// ---------------------------------------------------------------------------
// Text metrics
// ---------------------------------------------------------------------------

/// A reference/hypothesis text similarity.
pub trait TextMetric {
    fn name(&self) -> &str;
    fn score(&self, reference: &str, hypothesis: &str) -> f64;
}

/// Applies `metric`, scoring 0 when either side is blank.
pub fn text_score(metric: &dyn TextMetric, reference: &str, hypothesis: &str) -> f64 {
    let (reference, hypothesis) = (reference.trim(), hypothesis.trim());
    if reference.is_empty() || hypothesis.is_empty() {
        return 0.0;
    }
    metric.score(reference, hypothesis)
}

/// F1 over keyword tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordF1;

impl TextMetric for KeywordF1 {
    fn name(&self) -> &str {
        "kw_f1"
    }

    fn score(&self, reference: &str, hypothesis: &str) -> f64 {
        let r = keyword_tokens(reference);
        let h = keyword_tokens(hypothesis);
        let common = r.intersection(&h).count() as f64;
        let precision = if h.is_empty() { 0.0 } else { common / h.len() as f64 };
        let recall = if r.is_empty() { 0.0 } else { common / r.len() as f64 };
        if precision + recall == 0.0 {
            return 0.0;
        }
        2.0 * precision * recall / (precision + recall)
    }
}

// ---------------------------------------------------------------------------
// Rows and aggregation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct EvalRow {
    pub id: Value,
    #[serde(rename = "type")]
    pub qa_type: String,
    pub level: String,
    pub question: String,
    pub actions_prompt_tail: String,
    pub model_output: String,
    pub pred_key_block: String,
    pub gt_key_block: String,
    pub pred_orc: String,
    pub gt_orc: String,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default)]
struct Accumulator {
    sums: BTreeMap<String, f64>,
    count: usize,
}

impl Accumulator {
    fn add(&mut self, metrics: &BTreeMap<String, f64>) {
        for (name, value) in metrics {
            *self.sums.entry(name.clone()).or_default() += value;
        }
        self.count += 1;
    }

    fn finish(&self) -> BTreeMap<String, Value> {
        let n = self.count.max(1);
        let mut out: BTreeMap<String, Value> = self
            .sums
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v / n as f64)))
            .collect();
        out.insert("num_samples".to_string(), Value::from(n));
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    overall: Accumulator,
    by_level: BTreeMap<String, Accumulator>,
    by_type: BTreeMap<String, Accumulator>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvalReport {
    /// Empty when no sample was scored.
    pub overall: BTreeMap<String, Value>,
    pub by_level: BTreeMap<String, BTreeMap<String, Value>>,
    pub by_type: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Aggregator {
    pub fn add(&mut self, row: &EvalRow) {
        self.add_scores(&row.level, &row.qa_type, &row.metrics);
    }

    /// Add one scored sample under its level and type.
    pub fn add_scores(&mut self, level: &str, qa_type: &str, metrics: &BTreeMap<String, f64>) {
        self.overall.add(metrics);
        self.by_level
            .entry(level.to_string())
            .or_default()
            .add(metrics);
        self.by_type
            .entry(qa_type.to_string())
            .or_default()
            .add(metrics);
    }

    pub fn count(&self) -> usize {
        self.overall.count
    }

    pub fn report(&self) -> EvalReport {
        let finish = |m: &BTreeMap<String, Accumulator>| {
            m.iter().map(|(k, a)| (k.clone(), a.finish())).collect()
        };
        EvalReport {
            overall: if self.overall.count > 0 {
                self.overall.finish()
            } else {
                BTreeMap::new()
            },
            by_level: finish(&self.by_level),
            by_type: finish(&self.by_type),
        }
    }
}

// ---------------------------------------------------------------------------
// EvalHarness
// ---------------------------------------------------------------------------

pub struct EvalHarness<'a> {
    generator: Option<&'a dyn Completion>,
    temperature: f32,
    text_metrics: Vec<Box<dyn TextMetric>>,
}

impl<'a> EvalHarness<'a> {
    /// `generator` answers samples that have no `model_output`.
    pub fn new(generator: Option<&'a dyn Completion>, temperature: f32) -> Self {
        Self {
            generator,
            temperature,
            text_metrics: vec![Box::new(KeywordF1)],
        }
    }

    pub fn with_metric(mut self, metric: Box<dyn TextMetric>) -> Self {
        self.text_metrics.push(metric);
        self
    }

    /// The recorded or generated answer. `Err` carries the error text that
    /// stands in for the answer when generation fails.
    fn model_output(&self, sample: &EvalSample, prompt: &str) -> std::result::Result<String, String> {
        if let Some(output) = &sample.model_output {
            return Ok(output.clone());
        }
        let Some(generator) = self.generator else {
            return Ok(String::new());
        };
        generator
            .complete(prompts::EVAL_SYSTEM, prompt, self.temperature)
            .map_err(|e| {
                warn!(id = %sample.id, error = %e, "answer generation failed");
                format!("[ERROR during generation] {e}")
            })
    }

    /// Score one sample. `None` when the sample is not scorable.
    pub fn evaluate(&self, sample: &EvalSample) -> Option<EvalRow> {
        if !sample.is_scorable() {
            return None;
        }
        let prompt = sample.prompt();
        let (output, structural, pred_key, pred_orc) = match self.model_output(sample, &prompt) {
            Ok(output) => {
                let blocks = extract_answer(&output);
                let pred_key = blocks
                    .as_ref()
                    .map(|b| b.key.clone())
                    .unwrap_or_else(|| output.clone());
                let pred_orc = blocks.map(|b| b.orc).unwrap_or_default();
                let structural = score_key_blocks(&pred_key, &sample.key);
                (output, structural, pred_key, pred_orc)
            }
            // A failed generation is never scored as an answer.
            Err(error_text) => (
                error_text,
                StructuredMetrics::default(),
                String::new(),
                String::new(),
            ),
        };

        let mut metrics: BTreeMap<String, f64> = structural
            .entries()
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        for metric in &self.text_metrics {
            metrics.insert(
                metric.name().to_string(),
                text_score(metric.as_ref(), &sample.orc, &pred_orc),
            );
        }

        let tail = prompt
            .rsplit(ACTIONS_MARKER)
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();

        Some(EvalRow {
            id: sample.id.clone(),
            qa_type: sample.qa_type.clone(),
            level: sample.level.clone(),
            question: sample.question.clone(),
            actions_prompt_tail: tail,
            model_output: output,
            pred_key_block: pred_key,
            gt_key_block: sample.key.clone(),
            pred_orc,
            gt_orc: sample.orc.clone(),
            metrics,
        })
    }

    /// Evaluate every sample, writing one row per scored sample and a
    /// closing report line to `output` (overwritten).
    pub fn run(&self, samples: &[EvalSample], output: &Path) -> Result<EvalReport> {
        io::truncate(output)?;
        let mut file = io::open_append(output)?;
        let mut aggregator = Aggregator::default();

        for sample in samples {
            let Some(row) = self.evaluate(sample) else {
                debug!(id = %sample.id, "sample not scorable");
                continue;
            };
            aggregator.add(&row);
            let mut line = serde_json::to_vec(&row)?;
            line.push(b'\n');
            io::append_synced(&mut file, &line)?;
        }

        let report = aggregator.report();
        let mut line = serde_json::to_vec(&serde_json::json!({ "report": report }))?;
        line.push(b'\n');
        io::append_synced(&mut file, &line)?;
        info!(scored = aggregator.count(), total = samples.len(), "evaluation finished");
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
