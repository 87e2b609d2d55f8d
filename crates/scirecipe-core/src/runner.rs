//! Resumable batch generation.
//!
//! Per input record: skip if its id is already committed, otherwise run one
//! work unit per planned QA type (generate, repair, review, append). The id
//! is marked processed only after every unit has finished, so an
//! interrupted record is redone in full on the next run.

use crate::blocks::{extract_records, RawRecord};
use crate::collaborator::Completion;
use crate::config::{Config, GenerationMode};
use crate::error::Result;
use crate::io;
use crate::prompts;
use crate::protocol::{record_id, ProtocolFields};
use crate::quality::QualityGate;
use crate::record::{FailedRecord, FailureDetail, QaRecord, RecordId};
use crate::repair::{RepairController, RepairOutcome};
use crate::sink::{JsonlSink, ProcessedIds};
use crate::types::QaType;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Settings and summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub mode: GenerationMode,
    pub generation_temperature: f32,
    pub max_repair_attempts: u32,
    pub repair_temperature: f32,
    pub review_temperature: f32,
    pub clear_output_on_start: bool,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.generation.mode.clone(),
            generation_temperature: config.collaborator.temperature,
            max_repair_attempts: config.repair.max_attempts,
            repair_temperature: config.repair.temperature,
            review_temperature: config
                .reviewer
                .as_ref()
                .map(|r| r.temperature)
                .unwrap_or(0.2),
            clear_output_on_start: config.generation.clear_output_on_start,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub input_records: usize,
    pub skipped_seen: usize,
    pub skipped_incomplete: usize,
    /// Candidates extracted from generation output, after truncation.
    pub generated: usize,
    /// Candidates that validated only after repair.
    pub repaired: usize,
    pub accepted: usize,
    /// Structurally valid but rejected by the quality reviewer.
    pub flagged: usize,
    /// Still structurally invalid after repair.
    pub rejected: usize,
    /// Generation calls that failed.
    pub unit_errors: usize,
}

// ---------------------------------------------------------------------------
// Work-unit planning
// ---------------------------------------------------------------------------

/// The `(type, count)` units for one input record.
pub fn plan_units(mode: &GenerationMode, rng: &mut impl Rng) -> Vec<(QaType, usize)> {
    match mode {
        GenerationMode::Fixed { counts } => counts
            .iter()
            .filter(|c| c.count > 0)
            .filter_map(|c| match c.qa_type.parse::<QaType>() {
                Ok(t) => Some((t, c.count)),
                Err(e) => {
                    warn!(error = %e, "skipping configured type");
                    None
                }
            })
            .collect(),
        GenerationMode::Sampled {
            types_per_record,
            per_type_min,
            per_type_max,
            ..
        } => {
            let available = QaType::problem_solving();
            let k = (*types_per_record).min(available.len());
            let (lo, hi) = if per_type_min <= per_type_max {
                (*per_type_min, *per_type_max)
            } else {
                (*per_type_max, *per_type_min)
            };
            let chosen: Vec<QaType> = available.choose_multiple(rng, k).copied().collect();
            chosen
                .into_iter()
                .map(|t| (t, rng.gen_range(lo..=hi)))
                .filter(|(_, n)| *n > 0)
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// BatchRunner
// ---------------------------------------------------------------------------

pub struct BatchRunner<'a> {
    generator: &'a dyn Completion,
    repair: RepairController<'a>,
    gate: Option<QualityGate<'a>>,
    settings: RunnerSettings,
    processed: ProcessedIds,
    success: JsonlSink,
    failure: JsonlSink,
    rng: StdRng,
}

impl<'a> BatchRunner<'a> {
    /// Open both streams and rebuild the processed-id set from them, or
    /// truncate them when `clear_output_on_start` is set.
    pub fn new(
        generator: &'a dyn Completion,
        reviewer: Option<&'a dyn Completion>,
        settings: RunnerSettings,
        success_path: &Path,
        failure_path: &Path,
    ) -> Result<Self> {
        let processed = if settings.clear_output_on_start {
            io::truncate(success_path)?;
            io::truncate(failure_path)?;
            ProcessedIds::default()
        } else {
            ProcessedIds::load(&[success_path, failure_path])?
        };
        info!(processed = processed.len(), "resume index loaded");

        let rng = match &settings.mode {
            GenerationMode::Sampled {
                seed: Some(seed), ..
            } => StdRng::seed_from_u64(*seed),
            _ => StdRng::from_entropy(),
        };

        Ok(Self {
            generator,
            repair: RepairController::new(
                generator,
                settings.max_repair_attempts,
                settings.repair_temperature,
            ),
            gate: reviewer.map(|r| QualityGate::new(r, settings.review_temperature)),
            settings,
            processed,
            success: JsonlSink::open(success_path)?,
            failure: JsonlSink::open(failure_path)?,
            rng,
        })
    }

    pub fn processed(&self) -> &ProcessedIds {
        &self.processed
    }

    /// Process `protocols` in order. `limit` caps how many not-yet-seen
    /// records are processed in this run. Only stream I/O errors abort.
    pub fn run(&mut self, protocols: &[Value], limit: Option<usize>) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        let mut processed_now = 0usize;

        for (index, value) in protocols.iter().enumerate() {
            if limit.is_some_and(|n| processed_now >= n) {
                break;
            }
            summary.input_records += 1;
            let id = record_id(value, index);
            if self.processed.contains(&id) {
                debug!(%id, "already processed");
                summary.skipped_seen += 1;
                continue;
            }
            let fields = ProtocolFields::normalize(value);
            if !fields.is_complete() {
                debug!(%id, "missing title and procedure");
                summary.skipped_incomplete += 1;
                continue;
            }

            self.process_record(&id, &fields, &mut summary)?;
            self.processed.insert(id);
            processed_now += 1;
        }

        info!(
            input = summary.input_records,
            skipped = summary.skipped_seen,
            accepted = summary.accepted,
            flagged = summary.flagged,
            rejected = summary.rejected,
            unit_errors = summary.unit_errors,
            "batch finished"
        );
        debug!(
            success = %self.success.path().display(),
            success_lines = self.success.written(),
            failure = %self.failure.path().display(),
            failure_lines = self.failure.written(),
            "streams appended"
        );
        Ok(summary)
    }

    fn process_record(
        &mut self,
        id: &RecordId,
        fields: &ProtocolFields,
        summary: &mut BatchSummary,
    ) -> Result<()> {
        let units = plan_units(&self.settings.mode, &mut self.rng);
        for (qa_type, count) in units {
            let user = prompts::generation_user_prompt(fields, qa_type, count);
            let text = match self.generator.complete(
                prompts::GENERATION_SYSTEM,
                &user,
                self.settings.generation_temperature,
            ) {
                Ok(text) => text,
                Err(e) => {
                    warn!(%id, qa_type = %qa_type, error = %e, "generation failed");
                    summary.unit_errors += 1;
                    continue;
                }
            };

            let mut candidates = extract_records(&text);
            if candidates.len() > count {
                debug!(%id, got = candidates.len(), wanted = count, "truncating candidates");
                candidates.truncate(count);
            }
            summary.generated += candidates.len();

            for candidate in candidates {
                self.commit(id, qa_type, candidate, summary)?;
            }
        }
        Ok(())
    }

    fn commit(
        &mut self,
        id: &RecordId,
        qa_type: QaType,
        candidate: RawRecord,
        summary: &mut BatchSummary,
    ) -> Result<()> {
        match self.repair.check(candidate) {
            RepairOutcome::Valid {
                record,
                plan,
                attempts,
            } => {
                if attempts > 0 {
                    summary.repaired += 1;
                }
                let report = self.gate.as_ref().map(|g| g.review_record(&record));
                let qa = QaRecord::validated(id.clone(), qa_type, record, &plan);
                match report {
                    Some(report) if !report.passed() => {
                        let detail = FailureDetail::quality(report);
                        warn!(%id, qa_type = %qa_type, "record flagged by reviewer");
                        self.failure.append(&FailedRecord { record: qa, detail })?;
                        summary.flagged += 1;
                    }
                    _ => {
                        self.success.append(&qa)?;
                        info!(%id, qa_type = %qa_type, "record accepted");
                        summary.accepted += 1;
                    }
                }
            }
            RepairOutcome::Rejected {
                record,
                reason,
                attempts,
            } => {
                warn!(
                    %id,
                    qa_type = %qa_type,
                    attempts,
                    class = reason.class(),
                    %reason,
                    "candidate rejected"
                );
                let failed = FailedRecord {
                    record: QaRecord::unvalidated(id.clone(), qa_type, record),
                    detail: FailureDetail::Validation {
                        error: reason.to_string(),
                    },
                };
                self.failure.append(&failed)?;
                summary.rejected += 1;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::CollaboratorError;
    use crate::config::TypeCount;
    use crate::quality::Criterion;
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    type Reply = std::result::Result<String, CollaboratorError>;

    /// Routes each call by system prompt to its own reply queue.
    #[derive(Default)]
    struct Fake {
        generate: RefCell<VecDeque<Reply>>,
        repair: RefCell<VecDeque<Reply>>,
        review: RefCell<VecDeque<Reply>>,
        generate_calls: RefCell<usize>,
    }

    impl Fake {
        fn generating(replies: Vec<Reply>) -> Self {
            let fake = Fake::default();
            fake.generate.borrow_mut().extend(replies);
            fake
        }
    }

    impl Completion for Fake {
        fn complete(&self, system: &str, _user: &str, _t: f32) -> Reply {
            let queue = if system == prompts::GENERATION_SYSTEM {
                *self.generate_calls.borrow_mut() += 1;
                &self.generate
            } else if system == prompts::REPAIR_SYSTEM {
                &self.repair
            } else {
                &self.review
            };
            queue
                .borrow_mut()
                .pop_front()
                .unwrap_or(Err(CollaboratorError::EmptyResponse))
        }
    }

    fn good(question: &str) -> RawRecord {
        RawRecord {
            question: question.into(),
            think: "Spin them down.".into(),
            key: r#"Step 1: {"action": "centrifuge", "objects": ["cells"], "parameters": ["300xg"]}
Step 2: {"action": "wash", "objects": ["pellet"], "parameters": ["1x pbs"]}"#
                .into(),
            orc: "Step 1: Centrifuge the cells at 300xg.\nStep 2: Wash the pellet with 1x pbs."
                .into(),
            note: "Balance the rotor.".into(),
        }
    }

    fn bad() -> RawRecord {
        RawRecord {
            orc: "Step 1: Centrifuge.".into(),
            ..good("mismatched")
        }
    }

    fn tagged(records: &[RawRecord]) -> Reply {
        Ok(records
            .iter()
            .map(RawRecord::to_tagged)
            .collect::<Vec<_>>()
            .join("\n\n"))
    }

    fn report(failing: Option<(Criterion, &str)>) -> Reply {
        let mut text = String::from("<validation_report>");
        for c in Criterion::all() {
            let body = match failing {
                Some((f, msg)) if f == *c => msg,
                _ => c.pass_sentence(),
            };
            text.push_str(&format!("<{0}>{1}</{0}>", c.key(), body));
        }
        text.push_str("</validation_report>");
        Ok(text)
    }

    fn settings(count: usize) -> RunnerSettings {
        RunnerSettings {
            mode: GenerationMode::Fixed {
                counts: vec![TypeCount {
                    qa_type: "planning".into(),
                    count,
                }],
            },
            generation_temperature: 0.6,
            max_repair_attempts: 2,
            repair_temperature: 0.2,
            review_temperature: 0.2,
            clear_output_on_start: false,
        }
    }

    fn protocol(id: &str) -> Value {
        json!({"id": id, "title": "Cell pelleting", "procedure": "Spin at 300xg."})
    }

    fn lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    struct Streams {
        _dir: TempDir,
        success: std::path::PathBuf,
        failure: std::path::PathBuf,
    }

    fn streams() -> Streams {
        let dir = TempDir::new().unwrap();
        Streams {
            success: dir.path().join("out/success.jsonl"),
            failure: dir.path().join("out/failed.jsonl"),
            _dir: dir,
        }
    }

    #[test]
    fn resume_skips_committed_ids() {
        let s = streams();
        std::fs::create_dir_all(s.success.parent().unwrap()).unwrap();
        std::fs::write(&s.success, "{\"id\": \"p1\", \"type\": \"planning\"}\n").unwrap();

        let fake = Fake::generating(vec![tagged(&[good("q2")])]);
        let mut runner =
            BatchRunner::new(&fake, None, settings(1), &s.success, &s.failure).unwrap();
        let summary = runner.run(&[protocol("p1"), protocol("p2")], None).unwrap();

        assert_eq!(summary.skipped_seen, 1);
        assert_eq!(summary.accepted, 1);
        assert_eq!(*fake.generate_calls.borrow(), 1);
        let out = lines(&s.success);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1]["id"], "p2");
        assert_eq!(out[1]["action"], json!(["centrifuge", "wash"]));
        assert!(runner.processed().contains(&RecordId::from("p2")));
    }

    #[test]
    fn second_run_appends_nothing() {
        let s = streams();
        let fake = Fake::generating(vec![tagged(&[good("q1")])]);
        BatchRunner::new(&fake, None, settings(1), &s.success, &s.failure)
            .unwrap()
            .run(&[protocol("p1")], None)
            .unwrap();

        let again = Fake::default();
        let summary = BatchRunner::new(&again, None, settings(1), &s.success, &s.failure)
            .unwrap()
            .run(&[protocol("p1")], None)
            .unwrap();
        assert_eq!(summary.skipped_seen, 1);
        assert_eq!(*again.generate_calls.borrow(), 0);
        assert_eq!(lines(&s.success).len(), 1);
    }

    #[test]
    fn excess_candidates_are_truncated() {
        let s = streams();
        let fake = Fake::generating(vec![tagged(&[good("a"), good("b"), good("c")])]);
        let summary = BatchRunner::new(&fake, None, settings(2), &s.success, &s.failure)
            .unwrap()
            .run(&[protocol("p1")], None)
            .unwrap();
        assert_eq!(summary.generated, 2);
        let out = lines(&s.success);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1]["question"], "b");
    }

    #[test]
    fn unrepairable_candidate_goes_to_failure_stream() {
        let s = streams();
        let fake = Fake::generating(vec![tagged(&[bad()])]);
        fake.repair
            .borrow_mut()
            .extend([Ok("no tags here".to_string()), tagged(&[bad()])]);
        let summary = BatchRunner::new(&fake, None, settings(1), &s.success, &s.failure)
            .unwrap()
            .run(&[protocol("p1")], None)
            .unwrap();

        assert_eq!(summary.rejected, 1);
        assert!(lines(&s.success).is_empty());
        let failed = lines(&s.failure);
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0]["error"],
            "step count mismatch: <key> has 2 steps, <orc> has 1"
        );
        assert_eq!(failed[0]["action"], json!([]));
    }

    #[test]
    fn repaired_candidate_is_accepted() {
        let s = streams();
        let fake = Fake::generating(vec![tagged(&[bad()])]);
        fake.repair.borrow_mut().push_back(tagged(&[good("fixed")]));
        let summary = BatchRunner::new(&fake, None, settings(1), &s.success, &s.failure)
            .unwrap()
            .run(&[protocol("p1")], None)
            .unwrap();
        assert_eq!(summary.repaired, 1);
        assert_eq!(summary.accepted, 1);
        assert_eq!(lines(&s.success)[0]["question"], "fixed");
    }

    #[test]
    fn reviewer_verdict_routes_records() {
        let s = streams();
        let fake = Fake::generating(vec![tagged(&[good("ok"), good("flagged")])]);
        fake.review.borrow_mut().extend([
            report(None),
            report(Some((Criterion::SafetyCompliance, "No PPE guidance."))),
        ]);
        let summary =
            BatchRunner::new(&fake, Some(&fake), settings(2), &s.success, &s.failure)
                .unwrap()
                .run(&[protocol("p1")], None)
                .unwrap();

        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.flagged, 1);
        let failed = lines(&s.failure);
        assert_eq!(failed[0]["question"], "flagged");
        assert_eq!(failed[0]["error"], 1);
        assert_eq!(failed[0]["error1"], 1);
        assert_eq!(
            failed[0]["check_report"]["safety_compliance_check"],
            "No PPE guidance."
        );
    }

    #[test]
    fn reviewer_outage_fails_closed() {
        let s = streams();
        let fake = Fake::generating(vec![tagged(&[good("q")])]);
        let summary =
            BatchRunner::new(&fake, Some(&fake), settings(1), &s.success, &s.failure)
                .unwrap()
                .run(&[protocol("p1")], None)
                .unwrap();
        assert_eq!(summary.flagged, 1);
        assert_eq!(lines(&s.failure)[0]["error"], 6);
    }

    #[test]
    fn generation_error_still_marks_record_processed() {
        let s = streams();
        let fake = Fake::generating(vec![Err(CollaboratorError::Http("timeout".into()))]);
        let mut runner =
            BatchRunner::new(&fake, None, settings(1), &s.success, &s.failure).unwrap();
        let summary = runner.run(&[protocol("p1")], None).unwrap();
        assert_eq!(summary.unit_errors, 1);
        assert!(runner.processed().contains(&RecordId::from("p1")));
    }

    #[test]
    fn incomplete_records_are_skipped() {
        let s = streams();
        let fake = Fake::default();
        let summary = BatchRunner::new(&fake, None, settings(1), &s.success, &s.failure)
            .unwrap()
            .run(&[json!({"id": "x", "abstract": "no title"})], None)
            .unwrap();
        assert_eq!(summary.skipped_incomplete, 1);
        assert_eq!(*fake.generate_calls.borrow(), 0);
    }

    #[test]
    fn limit_caps_processed_records() {
        let s = streams();
        let fake = Fake::generating(vec![tagged(&[good("a")]), tagged(&[good("b")])]);
        let summary = BatchRunner::new(&fake, None, settings(1), &s.success, &s.failure)
            .unwrap()
            .run(&[protocol("p1"), protocol("p2")], Some(1))
            .unwrap();
        assert_eq!(summary.input_records, 1);
        assert_eq!(summary.accepted, 1);
        assert_eq!(*fake.generate_calls.borrow(), 1);
    }

    #[test]
    fn clear_on_start_truncates_streams() {
        let s = streams();
        std::fs::create_dir_all(s.success.parent().unwrap()).unwrap();
        std::fs::write(&s.success, "{\"id\": \"p1\"}\n").unwrap();
        let mut cfg = settings(1);
        cfg.clear_output_on_start = true;
        let fake = Fake::generating(vec![tagged(&[good("again")])]);
        let summary = BatchRunner::new(&fake, None, cfg, &s.success, &s.failure)
            .unwrap()
            .run(&[protocol("p1")], None)
            .unwrap();
        assert_eq!(summary.skipped_seen, 0);
        let out = lines(&s.success);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["question"], "again");
    }

    #[test]
    fn fixed_units_keep_order_and_skip_zero() {
        let mode = GenerationMode::Fixed {
            counts: vec![
                TypeCount {
                    qa_type: "overview_qa".into(),
                    count: 2,
                },
                TypeCount {
                    qa_type: "retrieval".into(),
                    count: 0,
                },
                TypeCount {
                    qa_type: "specific_step_qa".into(),
                    count: 5,
                },
            ],
        };
        let units = plan_units(&mode, &mut StdRng::seed_from_u64(1));
        assert_eq!(
            units,
            vec![(QaType::OverviewQa, 2), (QaType::SpecificStepQa, 5)]
        );
    }

    #[test]
    fn sampled_units_are_seeded_and_distinct() {
        let mode = GenerationMode::Sampled {
            types_per_record: 3,
            per_type_min: 1,
            per_type_max: 4,
            seed: Some(9),
        };
        let a = plan_units(&mode, &mut StdRng::seed_from_u64(9));
        let b = plan_units(&mode, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        let mut types: Vec<QaType> = a.iter().map(|(t, _)| *t).collect();
        types.sort();
        types.dedup();
        assert_eq!(types.len(), 3);
        for (t, n) in &a {
            assert!(QaType::problem_solving().contains(t));
            assert!((1..=4).contains(n));
        }
    }

    #[test]
    fn sampled_units_clamp_to_available() {
        let mode = GenerationMode::Sampled {
            types_per_record: 20,
            per_type_min: 1,
            per_type_max: 1,
            seed: None,
        };
        let units = plan_units(&mode, &mut StdRng::seed_from_u64(0));
        assert_eq!(units.len(), 6);
    }
}
