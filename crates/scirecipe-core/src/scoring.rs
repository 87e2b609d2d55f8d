//! Structural comparison of a predicted action plan with a reference plan.
//!
//! Order fidelity is measured three ways (exact sequence, LCS overlap and
//! rank correlation over aligned steps). Content fidelity compares the
//! objects and parameters of steps aligned on the same action label, with
//! a weight that decays as the aligned positions drift apart.

use crate::plan::{ActionPlan, ActionStep};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Exponent of the position-decay curve.
pub const DECAY_EXPONENT: f64 = 1.5;

static KEYWORD_SPLIT_RE: OnceLock<Regex> = OnceLock::new();
static LENIENT_STEP_RE: OnceLock<Regex> = OnceLock::new();

fn keyword_split_re() -> &'static Regex {
    KEYWORD_SPLIT_RE.get_or_init(|| Regex::new(r"[^a-z0-9%µμ._-]+").unwrap())
}

fn lenient_step_re() -> &'static Regex {
    LENIENT_STEP_RE.get_or_init(|| Regex::new(r"(?i)^Step\s+\d+\s*:\s*(\{.*\})\s*$").unwrap())
}

// ---------------------------------------------------------------------------
// StructuredMetrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredMetrics {
    pub step_match: f64,
    pub order_strict: f64,
    pub order_lcs: f64,
    pub order_tau: f64,
    pub content_score: f64,
    pub avg_obj: f64,
    pub avg_para: f64,
    pub avg_mx: f64,
}

impl StructuredMetrics {
    pub fn entries(&self) -> [(&'static str, f64); 8] {
        [
            ("step_match", self.step_match),
            ("order_strict", self.order_strict),
            ("order_lcs", self.order_lcs),
            ("order_tau", self.order_tau),
            ("content_score", self.content_score),
            ("avg_obj", self.avg_obj),
            ("avg_para", self.avg_para),
            ("avg_mx", self.avg_mx),
        ]
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// A predicted step matched to a reference step with the same action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AlignmentPair {
    pub predicted: usize,
    pub reference: usize,
}

/// Greedy left-to-right alignment on action labels. Each predicted step
/// takes the next reference step with the same label at or after the
/// cursor; reference indices are never reused.
pub fn align(predicted: &[&str], reference: &[&str]) -> Vec<AlignmentPair> {
    let mut pairs = Vec::new();
    let mut j = 0;
    for (i, action) in predicted.iter().enumerate() {
        while j < reference.len() && reference[j] != *action {
            j += 1;
        }
        if j < reference.len() {
            pairs.push(AlignmentPair {
                predicted: i,
                reference: j,
            });
            j += 1;
        }
    }
    pairs
}

pub fn lcs_len(a: &[&str], b: &[&str]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            cur[j + 1] = if x == y {
                prev[j] + 1
            } else {
                prev[j + 1].max(cur[j])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// `2 * LCS / (|a| + |b|)`, or 1.0 when both are empty.
pub fn order_lcs(a: &[&str], b: &[&str]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    2.0 * lcs_len(a, b) as f64 / (a.len() + b.len()) as f64
}

/// Kendall-style agreement between predicted order and the reference
/// indices of the aligned pairs. 0.0 for fewer than two pairs.
pub fn kendall_tau(pairs: &[AlignmentPair]) -> f64 {
    let mut concordant = 0i64;
    let mut discordant = 0i64;
    for (i, a) in pairs.iter().enumerate() {
        for b in &pairs[i + 1..] {
            match a.reference.cmp(&b.reference) {
                std::cmp::Ordering::Less => concordant += 1,
                std::cmp::Ordering::Greater => discordant += 1,
                std::cmp::Ordering::Equal => {}
            }
        }
    }
    let total = concordant + discordant;
    if total == 0 {
        return 0.0;
    }
    (concordant - discordant) as f64 / total as f64
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

/// Jaccard overlap. Two empty sets overlap fully; one empty set not at all.
pub fn set_iou<T: std::hash::Hash + Eq>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    a.intersection(b).count() as f64 / a.union(b).count() as f64
}

/// Lowercased tokens, split on anything outside `[a-z0-9%µμ._-]`.
pub fn keyword_tokens(text: &str) -> HashSet<String> {
    let lower = text.to_lowercase();
    keyword_split_re()
        .split(&lower)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn keyword_iou(reference: &str, predicted: &str) -> f64 {
    set_iou(&keyword_tokens(reference), &keyword_tokens(predicted))
}

/// `1 - (x / D)^1.5` with `x` the index distance and `D = max(1, ref_len)`;
/// zero once `x >= D`.
pub fn position_weight(predicted: usize, reference: usize, reference_len: usize) -> f64 {
    let x = predicted.abs_diff(reference) as f64;
    let d = reference_len.max(1) as f64;
    if x >= d {
        return 0.0;
    }
    (1.0 - (x / d).powf(DECAY_EXPONENT)).max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairScore {
    pub score: f64,
    pub object_iou: f64,
    pub parameter_score: f64,
    pub weight: f64,
}

pub fn score_pair(
    predicted: &ActionStep,
    reference: &ActionStep,
    pair: AlignmentPair,
    reference_len: usize,
) -> PairScore {
    let mut object_iou = set_iou(&as_set(&predicted.objects), &as_set(&reference.objects));
    if object_iou == 0.0 {
        object_iou = keyword_iou(&reference.objects.join(" "), &predicted.objects.join(" "));
    }

    let parameter_score = if object_iou >= 0.5 {
        match (
            predicted.parameters.is_empty(),
            reference.parameters.is_empty(),
        ) {
            (true, true) => 1.0,
            (false, false) => keyword_iou(
                &reference.parameters.join(" "),
                &predicted.parameters.join(" "),
            ),
            _ => 0.0,
        }
    } else {
        0.0
    };

    let weight = position_weight(pair.predicted, pair.reference, reference_len);
    PairScore {
        score: weight * (object_iou + 0.5 * parameter_score),
        object_iou,
        parameter_score,
        weight,
    }
}

fn as_set(items: &[String]) -> HashSet<&str> {
    items.iter().map(String::as_str).collect()
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Score two validated plans.
pub fn score(predicted: &ActionPlan, reference: &ActionPlan) -> StructuredMetrics {
    let step_match = if predicted.len() == reference.len() { 1.0 } else { 0.0 };
    score_steps(predicted.steps(), reference.steps(), step_match)
}

fn score_steps(
    predicted: &[ActionStep],
    reference: &[ActionStep],
    step_match: f64,
) -> StructuredMetrics {
    let pred_actions: Vec<&str> = predicted.iter().map(|s| s.action.as_str()).collect();
    let ref_actions: Vec<&str> = reference.iter().map(|s| s.action.as_str()).collect();

    let mut metrics = StructuredMetrics {
        step_match,
        order_strict: if pred_actions == ref_actions { 1.0 } else { 0.0 },
        order_lcs: order_lcs(&pred_actions, &ref_actions),
        ..Default::default()
    };

    let pairs = align(&pred_actions, &ref_actions);
    if pairs.is_empty() {
        return metrics;
    }

    let n = pairs.len() as f64;
    for pair in &pairs {
        let s = score_pair(
            &predicted[pair.predicted],
            &reference[pair.reference],
            *pair,
            reference.len(),
        );
        metrics.content_score += s.score;
        metrics.avg_obj += s.object_iou;
        metrics.avg_para += s.parameter_score;
        metrics.avg_mx += s.weight;
    }
    metrics.content_score /= n;
    metrics.avg_obj /= n;
    metrics.avg_para /= n;
    metrics.avg_mx /= n;
    metrics.order_tau = kendall_tau(&pairs);
    metrics
}

/// Non-empty lines of a block with trailing whitespace removed. Only the
/// block as a whole is trimmed at the front, so an indented step line
/// inside it is counted but never matches a step.
fn step_lines(block: &str) -> impl Iterator<Item = &str> {
    block
        .trim()
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LenientTypeError(pub &'static str);

/// Parse a key block without enforcing the schema: lines that are not
/// `Step N: {json object}` are ignored, values are trimmed and lowercased,
/// and blank or non-string list items are dropped. A non-string action or
/// a non-list `objects`/`parameters` is a type error.
pub fn parse_key_lenient(block: &str) -> Result<Vec<ActionStep>, LenientTypeError> {
    let mut steps = Vec::new();
    for line in step_lines(block) {
        let Some(caps) = lenient_step_re().captures(line) else {
            continue;
        };
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(&caps[1]) else {
            continue;
        };
        let action = match obj.get("action") {
            None => String::new(),
            Some(Value::String(s)) => s.trim().to_lowercase(),
            Some(_) => return Err(LenientTypeError("action")),
        };
        steps.push(ActionStep {
            action,
            objects: lenient_list(obj.get("objects"), "objects")?,
            parameters: lenient_list(obj.get("parameters"), "parameters")?,
        });
    }
    Ok(steps)
}

fn lenient_list(
    value: Option<&Value>,
    field: &'static str,
) -> Result<Vec<String>, LenientTypeError> {
    match value {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()),
        Some(_) => Err(LenientTypeError(field)),
    }
}

/// Score raw key blocks, as found in model output. Never fails: a type
/// error anywhere yields all-zero metrics.
pub fn score_key_blocks(predicted: &str, reference: &str) -> StructuredMetrics {
    let step_match = if step_lines(predicted).count() == step_lines(reference).count() {
        1.0
    } else {
        0.0
    };
    match (parse_key_lenient(predicted), parse_key_lenient(reference)) {
        (Ok(p), Ok(r)) => score_steps(&p, &r, step_match),
        _ => StructuredMetrics::default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn step(action: &str, objects: &[&str], parameters: &[&str]) -> ActionStep {
        ActionStep {
            action: action.to_string(),
            objects: objects.iter().map(|s| s.to_string()).collect(),
            parameters: parameters.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn plan_of(actions: &[&str]) -> ActionPlan {
        ActionPlan::new(actions.iter().map(|a| step(a, &["cells"], &[])).collect())
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn lcs_overlap() {
        assert_eq!(lcs_len(&["a", "b", "c"], &["b", "c"]), 2);
        assert!(approx(order_lcs(&["a", "b", "c"], &["b", "c"]), 0.8));
        assert!(approx(order_lcs(&[], &[]), 1.0));
        assert!(approx(order_lcs(&["a"], &[]), 0.0));
    }

    #[test]
    fn strict_order() {
        let pred = plan_of(&["wash", "centrifuge"]);
        assert_eq!(score(&pred, &plan_of(&["wash", "centrifuge"])).order_strict, 1.0);
        assert_eq!(score(&pred, &plan_of(&["centrifuge", "wash"])).order_strict, 0.0);
    }

    #[test]
    fn alignment_is_greedy_and_monotone() {
        // An unmatched predicted action runs the cursor off the end of the
        // reference, so nothing after it can align.
        assert_eq!(
            align(&["a", "x", "b"], &["a", "b"]),
            vec![AlignmentPair { predicted: 0, reference: 0 }]
        );
        // "b" consumes the reference up to index 1, so "a" finds nothing.
        assert_eq!(
            align(&["b", "a"], &["a", "b"]),
            vec![AlignmentPair { predicted: 0, reference: 1 }]
        );
        assert_eq!(
            align(&["a", "a"], &["a"]),
            vec![AlignmentPair { predicted: 0, reference: 0 }]
        );
    }

    #[test]
    fn alignment_is_deterministic() {
        let p = ["mix", "spin", "mix", "wash"];
        let r = ["spin", "mix", "wash", "mix"];
        assert_eq!(align(&p, &r), align(&p, &r));
    }

    #[test]
    fn tau() {
        let pair = |p, r| AlignmentPair { predicted: p, reference: r };
        assert_eq!(kendall_tau(&[pair(0, 0)]), 0.0);
        assert_eq!(kendall_tau(&[pair(0, 0), pair(1, 2)]), 1.0);
        assert_eq!(kendall_tau(&[pair(0, 2), pair(1, 0)]), -1.0);
        assert!(approx(
            kendall_tau(&[pair(0, 0), pair(1, 2), pair(2, 1)]),
            1.0 / 3.0
        ));
    }

    #[test]
    fn decay_weight() {
        assert_eq!(position_weight(2, 2, 5), 1.0);
        assert!(approx(position_weight(0, 1, 4), 0.875));
        assert_eq!(position_weight(0, 4, 4), 0.0);
        assert_eq!(position_weight(3, 0, 0), 0.0);
    }

    #[test]
    fn identical_plans_score_fully() {
        let p = ActionPlan::new(vec![
            step("add", &["pbs"], &["10 ml"]),
            step("centrifuge", &["cells"], &["300xg", "5 min"]),
        ]);
        let m = score(&p, &p);
        assert_eq!(m.step_match, 1.0);
        assert_eq!(m.order_strict, 1.0);
        assert_eq!(m.order_tau, 1.0);
        assert!(approx(m.avg_obj, 1.0));
        assert!(approx(m.avg_para, 1.0));
        assert!(approx(m.avg_mx, 1.0));
        assert!(approx(m.content_score, 1.5));
    }

    #[test]
    fn object_iou_falls_back_to_keywords() {
        let pred = step("wash", &["cell pellet"], &["1x pbs"]);
        let reference = step("wash", &["pellet"], &["1x pbs", "twice"]);
        let s = score_pair(&pred, &reference, AlignmentPair { predicted: 0, reference: 0 }, 1);
        assert!(approx(s.object_iou, 0.5));
        // {1x, pbs} against {1x, pbs, twice}
        assert!(approx(s.parameter_score, 2.0 / 3.0));
        assert!(approx(s.score, 0.5 + 0.5 * (2.0 / 3.0)));
    }

    #[test]
    fn parameters_ignored_below_object_threshold() {
        let pred = step("add", &["water"], &["10 ml"]);
        let reference = step("add", &["ethanol"], &["10 ml"]);
        let s = score_pair(&pred, &reference, AlignmentPair { predicted: 0, reference: 0 }, 1);
        assert_eq!(s.object_iou, 0.0);
        assert_eq!(s.parameter_score, 0.0);
        assert_eq!(s.score, 0.0);
    }

    #[test]
    fn one_sided_parameters_score_zero() {
        let pred = step("mix", &["tube"], &[]);
        let reference = step("mix", &["tube"], &["gently"]);
        let s = score_pair(&pred, &reference, AlignmentPair { predicted: 0, reference: 0 }, 1);
        assert_eq!(s.parameter_score, 0.0);
        assert_eq!(s.score, 1.0);
    }

    #[test]
    fn keyword_tokens_keep_units() {
        let t = keyword_tokens("Add 5 µl of 0.5% Triton-X_100, then spin");
        for tok in ["add", "5", "µl", "of", "0.5%", "triton-x_100", "then", "spin"] {
            assert!(t.contains(tok), "{tok}");
        }
        assert_eq!(t.len(), 8);
    }

    #[test]
    fn no_aligned_pairs() {
        let m = score(&plan_of(&["add"]), &plan_of(&["mix", "spin"]));
        assert_eq!(m.step_match, 0.0);
        assert_eq!(m.order_lcs, 0.0);
        assert_eq!(m.content_score, 0.0);
        assert_eq!(m.order_tau, 0.0);
    }

    #[test]
    fn lenient_blocks_are_normalized() {
        let pred = "Step 1: {\"action\": \" Wash \", \"objects\": [\"Cells\", \"\", 3]}\n\
                    Step 2: wash the cells\n";
        let reference = "Step 1: {\"action\": \"wash\", \"objects\": [\"cells\"], \"parameters\": []}\n\
                         Step 2: {\"action\": \"spin\", \"objects\": [\"cells\"], \"parameters\": []}";
        let steps = parse_key_lenient(pred).unwrap();
        assert_eq!(steps, vec![step("wash", &["cells"], &[])]);

        let m = score_key_blocks(pred, reference);
        // Both blocks have two non-empty lines even though one is prose.
        assert_eq!(m.step_match, 1.0);
        assert!(approx(m.order_lcs, 2.0 / 3.0));
        assert!(approx(m.content_score, 1.5));
    }

    #[test]
    fn indented_step_lines_count_but_do_not_parse() {
        let pred = "  Step 1: {\"action\": \"wash\", \"objects\": [], \"parameters\": []}\n\
                    \x20 Step 2: {\"action\": \"spin\", \"objects\": [], \"parameters\": []}";
        // The leading whitespace of the block goes; the second line keeps its indent.
        let steps = parse_key_lenient(pred).unwrap();
        assert_eq!(steps, vec![step("wash", &[], &[])]);

        let reference = "Step 1: {\"action\": \"wash\", \"objects\": [], \"parameters\": []}\n\
                         Step 2: {\"action\": \"spin\", \"objects\": [], \"parameters\": []}";
        assert_eq!(score_key_blocks(pred, reference).step_match, 1.0);
    }

    #[test]
    fn type_error_zeroes_metrics() {
        let bad = "Step 1: {\"action\": 5, \"objects\": [], \"parameters\": []}";
        let good = "Step 1: {\"action\": \"wash\", \"objects\": [], \"parameters\": []}";
        assert_eq!(parse_key_lenient(bad), Err(LenientTypeError("action")));
        assert_eq!(score_key_blocks(bad, good), StructuredMetrics::default());
        let bad_list = "Step 1: {\"action\": \"wash\", \"objects\": \"cells\"}";
        assert_eq!(score_key_blocks(good, bad_list), StructuredMetrics::default());
    }

    #[test]
    fn empty_blocks() {
        let m = score_key_blocks("", "");
        assert_eq!(m.step_match, 1.0);
        assert_eq!(m.order_strict, 1.0);
        assert_eq!(m.order_lcs, 1.0);
        assert_eq!(m.content_score, 0.0);
    }
}
