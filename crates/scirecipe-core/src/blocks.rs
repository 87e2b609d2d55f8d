//! Tag grammar for collaborator output.
//!
//! A generated record is the ordered group
//! `<question>…</question><think>…</think><key>…</key><orc>…</orc><note>…</note>`.
//! Model answers scored by the evaluation harness use the same group
//! without `<question>`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

static RECORD_RE: OnceLock<Regex> = OnceLock::new();
static ANSWER_RE: OnceLock<Regex> = OnceLock::new();

fn record_re() -> &'static Regex {
    RECORD_RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?is)<question>(?P<question>.*?)</question>\s*",
            r"<think>(?P<think>.*?)</think>\s*",
            r"<key>(?P<key>.*?)</key>\s*",
            r"<orc>(?P<orc>.*?)</orc>\s*",
            r"<note>(?P<note>.*?)</note>",
        ))
        .unwrap()
    })
}

fn answer_re() -> &'static Regex {
    ANSWER_RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?is)<think>(?P<think>.*?)</think>\s*",
            r"<key>(?P<key>.*?)</key>\s*",
            r"<orc>(?P<orc>.*?)</orc>\s*",
            r"<note>(?P<note>.*?)</note>",
        ))
        .unwrap()
    })
}

// ---------------------------------------------------------------------------
// RawRecord
// ---------------------------------------------------------------------------

/// The five text fields of a candidate record, before any validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub question: String,
    pub think: String,
    pub key: String,
    pub orc: String,
    pub note: String,
}

impl RawRecord {
    /// Field name/value pairs in tag order.
    pub fn fields(&self) -> [(&'static str, &str); 5] {
        [
            ("question", self.question.as_str()),
            ("think", self.think.as_str()),
            ("key", self.key.as_str()),
            ("orc", self.orc.as_str()),
            ("note", self.note.as_str()),
        ]
    }

    /// Re-render the record in its tagged form.
    pub fn to_tagged(&self) -> String {
        self.fields()
            .iter()
            .map(|(name, value)| format!("<{name}>{value}</{name}>"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The answer shown to the quality reviewer: reasoning, narrative and
    /// safety note. The machine plan is left out.
    pub fn answer_block(&self) -> String {
        format!(
            "<think>{}</think>\n\n<orc>{}</orc>\n\n<note>{}</note>",
            self.think, self.orc, self.note
        )
    }
}

// ---------------------------------------------------------------------------
// AnswerBlocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerBlocks {
    pub think: String,
    pub key: String,
    pub orc: String,
    pub note: String,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Every complete five-tag group in `text`, fields trimmed.
pub fn extract_records(text: &str) -> Vec<RawRecord> {
    record_re()
        .captures_iter(text)
        .map(|caps| RawRecord {
            question: caps["question"].trim().to_string(),
            think: caps["think"].trim().to_string(),
            key: caps["key"].trim().to_string(),
            orc: caps["orc"].trim().to_string(),
            note: caps["note"].trim().to_string(),
        })
        .collect()
}

/// The first four-tag answer group in `text`.
pub fn extract_answer(text: &str) -> Option<AnswerBlocks> {
    let caps = answer_re().captures(text)?;
    Some(AnswerBlocks {
        think: caps["think"].trim().to_string(),
        key: caps["key"].trim().to_string(),
        orc: caps["orc"].trim().to_string(),
        note: caps["note"].trim().to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_RECORDS: &str = r#"Here you go.
<question> How do I pellet cells? </question>
<think>Spin them down.</think>
<key>
Step 1: {"action": "centrifuge", "objects": ["cells"], "parameters": ["300xg"]}
</key>
<orc>Step 1: Centrifuge the cells at 300xg.</orc>
<note>Balance the rotor.</note>

<QUESTION>Second?</QUESTION><think>t</think><key>k</key><orc>o</orc><note>n</note>"#;

    #[test]
    fn extracts_all_groups_and_trims() {
        let records = extract_records(TWO_RECORDS);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].question, "How do I pellet cells?");
        assert!(records[0].key.starts_with("Step 1:"));
        assert_eq!(records[0].note, "Balance the rotor.");
        assert_eq!(records[1].question, "Second?");
        assert_eq!(records[1].note, "n");
    }

    #[test]
    fn incomplete_group_yields_nothing() {
        let text = "<question>q</question><think>t</think><key>k</key><note>n</note>";
        assert!(extract_records(text).is_empty());
    }

    #[test]
    fn out_of_order_tags_yield_nothing() {
        let text = "<question>q</question><key>k</key><think>t</think><orc>o</orc><note>n</note>";
        assert!(extract_records(text).is_empty());
    }

    #[test]
    fn tagged_form_reextracts_identically() {
        let records = extract_records(TWO_RECORDS);
        let again = extract_records(&records[0].to_tagged());
        assert_eq!(again, vec![records[0].clone()]);
    }

    #[test]
    fn answer_block_omits_key() {
        let rec = RawRecord {
            question: "q".into(),
            think: "t".into(),
            key: "Step 1: {}".into(),
            orc: "o".into(),
            note: "n".into(),
        };
        let answer = rec.answer_block();
        assert!(answer.contains("<think>t</think>"));
        assert!(!answer.contains("<key>"));
    }

    #[test]
    fn extract_answer_without_question() {
        let text = "<think>plan</think>\n<key>Step 1: {\"action\":\"add\"}</key>\n<orc>Step 1: Add.</orc>\n<note>none</note>";
        let blocks = extract_answer(text).unwrap();
        assert_eq!(blocks.think, "plan");
        assert_eq!(blocks.orc, "Step 1: Add.");
        assert!(extract_answer("no tags").is_none());
    }
}
