//! Prompt text sent to the collaborators.

use crate::blocks::RawRecord;
use crate::protocol::ProtocolFields;
use crate::types::QaType;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Seed for the allowed-action shuffle in evaluation prompts.
pub const EVAL_SHUFFLE_SEED: u64 = 42;

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

pub const GENERATION_SYSTEM: &str = r#"You are an experienced bench scientist writing training data for a research assistant. You receive one laboratory protocol and write question/answer records grounded in it.

Every record uses exactly these five tags, in this order:
<question>A self-contained problem statement that gives every fact needed to derive the answer.</question>
<think>The reasoning that leads from the question to the plan.</think>
<key>
Step 1: {"action": "detach", "objects": ["bmdcs"], "parameters": ["1x pbs-5 mm edta", "10 min", "37 °c"]}
Step 2: {"action": "wash", "objects": ["cells"], "parameters": ["1x pbs", "twice"]}
Step 3: {"action": "centrifuge", "objects": ["cells"], "parameters": ["367xg", "10 min"]}
</key>
<orc>
Step 1: Detach bmdcs with 1x pbs-5 mm edta for 10 min at 37 °c.
Step 2: Wash the cells with 1x pbs twice.
Step 3: Centrifuge the cells at 367xg for 10 min.
</orc>
<note>The safety information that matters for these steps.</note>

Rules for <key>:
1. One atomic action per step, numbered from 1 with no gaps. Split compound operations into separate steps.
2. Each step is one JSON object with exactly the keys "action", "objects" and "parameters".
3. "action" is a single lowercase verb. "objects" and "parameters" are lists of lowercase strings.
4. Parameters apply jointly to every object of the step. Keep them short: "37 °c", "in water bath".

Rules for <orc>:
1. One imperative sentence per <key> step, in the same order, adding nothing new.
2. The number of steps must equal the number of steps in <key>.
"#;

/// User prompt asking for `count` records of `qa_type` about `fields`.
pub fn generation_user_prompt(fields: &ProtocolFields, qa_type: QaType, count: usize) -> String {
    let context = match qa_type {
        QaType::OverviewQa | QaType::SpecificStepQa => format!(
            "[Protocol Data]\nTitle: {}\nAbstract: {}\nProblem Statement: {}\nMethodology: {}\n\
             Innovation: {}\nApplication: {}\nMaterials & Equipment: {}\nProcedure: {}\n",
            fields.title,
            fields.abstract_text,
            fields.problem,
            fields.method,
            fields.innovation,
            fields.application,
            fields.materials_and_equipment(),
            fields.procedure,
        ),
        _ => format!(
            "[Protocol]\n- Experiment Name: {}\n- Background: {}\n- Materials and Reagents: {}\n\
             - Equipment: {}\n- Procedures: {}\n- Notes/Precautions: {}\n",
            fields.title,
            fields.abstract_text,
            fields.materials,
            fields.equipment,
            fields.procedure,
            fields.notes,
        ),
    };
    format!(
        "{context}\nGenerate {count} question/answer record(s) for the {name} category.\n\
         Category definition: {instruction}\n\
         Each question must be answerable from its own text. Output only the tagged records.",
        name = qa_type.as_str(),
        instruction = qa_type.instruction(),
    )
}

// ---------------------------------------------------------------------------
// Repair
// ---------------------------------------------------------------------------

pub const REPAIR_SYSTEM: &str = r#"Your previous output did not follow the required structure. Rewrite it so that it does, changing content only where the structure requires it.

1. Exactly five top-level tags in this order: <question>, <think>, <key>, <orc>, <note>.
2. <key> holds lines of the form `Step N: {json}`, numbered from 1 with no gaps.
3. Each JSON value is one object with exactly the keys "action", "objects", "parameters". Use double quotes. "action" is a lowercase string; "objects" and "parameters" are lists of lowercase strings.
4. <orc> holds `Step N: sentence` lines, one imperative sentence per <key> step, with the same step count as <key>.
5. Return only the corrected block from <question> to </note>, with no commentary."#;

/// The malformed candidate, re-rendered in tagged form.
pub fn repair_user_prompt(candidate: &RawRecord) -> String {
    candidate.to_tagged()
}

// ---------------------------------------------------------------------------
// Review
// ---------------------------------------------------------------------------

pub const REVIEW_SYSTEM: &str = r#"You review laboratory question/answer pairs for scientific accuracy and safety. Judge the answer against the protocol context given in the question.

Answer with this exact structure:
<validation_report>
<accuracy_check>Scientific errors or inconsistencies, or "No significant scientific inaccuracies found."</accuracy_check>
<safety_compliance_check>Missing or wrong safety, PPE or disposal information, or "Safety and compliance information is adequate and accurate."</safety_compliance_check>
<logical_coherence_check>Problems with the logic or feasibility of the plan, or "Logical coherence and actionability are sound."</logical_coherence_check>
<clarity_ambiguity_check>Vague or ambiguous instructions, or "All information is clear and unambiguous."</clarity_ambiguity_check>
<generality_specificity_check>Recommendations that are too general or too specific, or "Appropriate balance of generality and specificity."</generality_specificity_check>
<efficiency_resource_optimization_check>Wasted time or resources, or "Plan demonstrates good efficiency and resource optimization."</efficiency_resource_optimization_check>
</validation_report>"#;

pub fn review_user_prompt(question: &str, answer: &str) -> String {
    format!(
        "Validate the following pair using the protocol context in the question.\n\
         <question>\n{question}\n</question>\n\
         <answer_to_validate>\n{answer}\n</answer_to_validate>\n\n\
         Report only severe problems: errors that would very likely make the experiment fail, \
         create a clear safety hazard, or invalidate the approach. Minor or debatable points pass.\n\
         A passing section contains only its affirmation sentence, word for word, with nothing \
         before or after it."
    )
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

pub const EVAL_SYSTEM: &str = "You are a bio-expert scientific assistant. Produce a single output \
containing four blocks in order: <think>, <key>, <orc>, <note>. <think> contains reasoning, <key> \
contains step-wise JSON actions with atomic action/objects/parameters, <orc> is a readable summary, \
and <note> contains safety comments. Output must begin with <think>.";

/// Question plus the closed list of actions the model may use. Blank
/// actions are dropped; the rest are trimmed and lowercased. With
/// `shuffle` the list order is permuted with a fixed seed.
pub fn build_eval_prompt(question: &str, actions: &[String], shuffle: bool) -> String {
    let mut allowed: Vec<&String> = actions.iter().filter(|a| !a.trim().is_empty()).collect();
    if shuffle {
        let mut rng = StdRng::seed_from_u64(EVAL_SHUFFLE_SEED);
        allowed.shuffle(&mut rng);
    }
    let quoted = allowed
        .iter()
        .map(|a| a.trim().to_lowercase())
        .collect::<Vec<_>>()
        .join("\", \"");
    format!(
        "{} Please provide the experimental protocol to solve this problem. \
         Please note that you can only use the following actions: \"{quoted}\".",
        question.trim()
    )
}

/// Step-ordering question plus the instruction to answer with a 1-based
/// index list only.
pub fn ordering_prompt(question: &str, steps: usize) -> String {
    format!(
        "{question}\n\nIMPORTANT: Return ONLY a Python list of integers 1..{steps} that sorts \
         the steps into the correct order. Output nothing else."
    )
}

/// Multiple-choice question plus the `{option} & {confidence}` answer format.
pub fn choice_prompt(question: &str) -> String {
    format!(
        "{question}\n\nPlease must output the full option and your confidence (0\u{2013}100). \
         The format should be: {{full option}} & {{confidence}}"
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
