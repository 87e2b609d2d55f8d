//! Bounded repair of structurally invalid candidates.
//!
//! A candidate moves through `Checking -> Repairing(n) -> Checking -> ...`
//! until it validates or `max_attempts` repair calls have been spent. Each
//! repair call works on the latest candidate, and each returned candidate
//! is validated exactly once.

use crate::blocks::{extract_records, RawRecord};
use crate::collaborator::Completion;
use crate::plan::ActionPlan;
use crate::prompts;
use crate::schema::{validate_record, SchemaViolation};
use tracing::{debug, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    /// `attempts` is the number of repair calls spent; zero means the
    /// candidate was valid as generated.
    Valid {
        record: RawRecord,
        plan: ActionPlan,
        attempts: u32,
    },
    Rejected {
        record: RawRecord,
        reason: SchemaViolation,
        attempts: u32,
    },
}

impl RepairOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            RepairOutcome::Valid { attempts, .. } | RepairOutcome::Rejected { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, RepairOutcome::Valid { .. })
    }

    /// Valid only after at least one repair call.
    pub fn was_repaired(&self) -> bool {
        self.is_valid() && self.attempts() > 0
    }
}

enum State {
    Checking {
        candidate: RawRecord,
        attempts: u32,
    },
    Repairing {
        candidate: RawRecord,
        reason: SchemaViolation,
        attempt: u32,
    },
    Done(RepairOutcome),
}

pub struct RepairController<'a> {
    client: &'a dyn Completion,
    max_attempts: u32,
    temperature: f32,
}

impl<'a> RepairController<'a> {
    pub fn new(client: &'a dyn Completion, max_attempts: u32, temperature: f32) -> Self {
        Self {
            client,
            max_attempts,
            temperature,
        }
    }

    /// Validate `candidate`, repairing it if needed. Never fails: a
    /// collaborator error ends the loop with the last validation reason.
    pub fn check(&self, candidate: RawRecord) -> RepairOutcome {
        let mut state = State::Checking {
            candidate,
            attempts: 0,
        };
        loop {
            state = match state {
                State::Done(outcome) => return outcome,
                State::Checking {
                    candidate,
                    attempts,
                } => self.validate(candidate, attempts),
                State::Repairing {
                    candidate,
                    reason,
                    attempt,
                } => self.repair(candidate, reason, attempt),
            };
        }
    }

    fn validate(&self, candidate: RawRecord, attempts: u32) -> State {
        match validate_record(&candidate) {
            Ok(plan) => State::Done(RepairOutcome::Valid {
                record: candidate,
                plan,
                attempts,
            }),
            Err(reason) => self.next_attempt(candidate, reason, attempts),
        }
    }

    fn next_attempt(&self, candidate: RawRecord, reason: SchemaViolation, spent: u32) -> State {
        if spent < self.max_attempts {
            debug!(attempt = spent + 1, %reason, "repairing candidate");
            State::Repairing {
                candidate,
                reason,
                attempt: spent + 1,
            }
        } else {
            State::Done(RepairOutcome::Rejected {
                record: candidate,
                reason,
                attempts: spent,
            })
        }
    }

    fn repair(&self, candidate: RawRecord, reason: SchemaViolation, attempt: u32) -> State {
        let user = prompts::repair_user_prompt(&candidate);
        let text = match self
            .client
            .complete(prompts::REPAIR_SYSTEM, &user, self.temperature)
        {
            Ok(text) => text,
            Err(e) => {
                warn!(attempt, error = %e, "repair call failed");
                return State::Done(RepairOutcome::Rejected {
                    record: candidate,
                    reason,
                    attempts: attempt,
                });
            }
        };
        match extract_records(&text).into_iter().next() {
            Some(next) => State::Checking {
                candidate: next,
                attempts: attempt,
            },
            None => {
                debug!(attempt, "repair response held no record");
                self.next_attempt(candidate, reason, attempt)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
