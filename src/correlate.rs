//! Resolution of a coarse event to its fine-trace step.
//!
//! The coarse layer records the pc of the targeted instruction before it
//! executes; the fine trace records the pc after. For straight-line code
//! the two differ by exactly one instruction width, which is the anchor for
//! everything here. Control transfers break the anchor and are reported,
//! not guessed.

use std::cmp::Reverse;

use thiserror::Error;

use crate::isa::{self, Category, InsnKind};
use crate::offset::OffsetEstimator;
use crate::records::{CoarseEvent, FaultPayload};
use crate::trace::{StepRecord, TraceIndex};

/// Fixed instruction width; the subject executes no compressed encodings.
pub const INSTRUCTION_WIDTH: u32 = 4;

/// How a correlation was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// A single structural candidate matched.
    Exact,
    /// Several candidates matched and the offset heuristic picked one.
    /// Recorded as a warning on everything derived from this correlation.
    Disambiguated {
        /// Number of structural candidates before disambiguation.
        candidates: usize,
        /// Fine step the drift correction pointed at; `None` when no
        /// estimate was available and the largest in-budget step won.
        estimated_fine_step: Option<i64>,
    },
}

/// A coarse event resolved to one fine step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlation {
    /// Resolved step record index.
    pub step_index: u64,
    /// Resolved retirement counter.
    pub fine_step: u64,
    /// Post-execution pc of the resolved step.
    pub pc: u32,
    /// Category of the resolved step.
    pub category: Category,
    /// Classification of the original encoding, when the payload carried one.
    pub decoded: Option<InsnKind>,
    /// Exact or heuristic resolution.
    pub confidence: Confidence,
}

impl Correlation {
    /// True when the offset heuristic, not structure, settled the match.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self.confidence, Confidence::Disambiguated { .. })
    }
}

/// No structurally valid step matched the event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationFailure {
    /// No retirement step has the expected post-execution pc.
    #[error("no retirement step at expected pc {expected_pc:#010x}")]
    NoStepAtPc {
        /// `event.pc + 4`.
        expected_pc: u32,
        /// Classification of the original encoding, when available.
        decoded: Option<InsnKind>,
    },
    /// Retirement steps exist at the pc, but none carry the decoded category.
    #[error("{at_pc} retirement step(s) at {expected_pc:#010x}, none with category {want}")]
    CategoryMismatch {
        /// `event.pc + 4`.
        expected_pc: u32,
        /// Category required by the decoded original encoding.
        want: Category,
        /// Retirement steps found at the pc before the category filter.
        at_pc: usize,
        /// The decoded original encoding.
        kind: InsnKind,
    },
    /// Candidates exist but all retire after the coarse budget.
    #[error("all {candidates} candidate step(s) at {expected_pc:#010x} exceed coarse step {coarse_step}")]
    BeyondCoarseStep {
        /// `event.pc + 4`.
        expected_pc: u32,
        /// Structural candidates found.
        candidates: usize,
        /// Coarse step budget they all exceed.
        coarse_step: u64,
    },
}

impl CorrelationFailure {
    /// True when the failure is the expected one for a jump/branch source,
    /// whose post-execution pc is the transfer target rather than `pc + 4`.
    pub fn expected_control_transfer(&self) -> bool {
        match self {
            CorrelationFailure::NoStepAtPc {
                decoded: Some(kind),
                ..
            } => kind.is_control_transfer(),
            CorrelationFailure::CategoryMismatch { kind, .. } => kind.is_control_transfer(),
            _ => false,
        }
    }
}

/// Classification of the original encoding, for payloads that carry one.
///
/// Only an instruction-word payload is an encoding; output and store-data
/// payloads are runtime values and must not gate on an accidental decode.
fn decode_original(payload: &FaultPayload) -> Option<InsnKind> {
    match payload {
        FaultPayload::Word { original, .. } => isa::classify(*original).ok(),
        _ => None,
    }
}

/// Resolves `event` to a fine step record.
pub fn correlate_step(
    event: &CoarseEvent,
    index: &TraceIndex,
    offsets: &OffsetEstimator,
) -> Result<Correlation, CorrelationFailure> {
    let expected_pc = event.pc.wrapping_add(INSTRUCTION_WIDTH);
    let decoded = decode_original(&event.payload);

    let mut at_pc = 0usize;
    let mut candidates: Vec<&StepRecord> = Vec::new();
    for &step_index in index.steps_at_pc(expected_pc) {
        let Some(step) = index.step(step_index) else {
            continue;
        };
        if step.auxiliary {
            continue;
        }
        at_pc += 1;
        if let Some(kind) = decoded {
            if step.category != kind.category() {
                continue;
            }
        }
        candidates.push(step);
    }

    if candidates.is_empty() {
        return Err(match decoded {
            Some(kind) if at_pc > 0 => CorrelationFailure::CategoryMismatch {
                expected_pc,
                want: kind.category(),
                at_pc,
                kind,
            },
            _ => CorrelationFailure::NoStepAtPc {
                expected_pc,
                decoded,
            },
        });
    }

    if let [only] = candidates.as_slice() {
        return Ok(resolved(only, decoded, Confidence::Exact));
    }

    let structural = candidates.len();
    let in_budget: Vec<&StepRecord> = candidates
        .into_iter()
        .filter(|s| s.fine_step <= event.step)
        .collect();
    if in_budget.is_empty() {
        return Err(CorrelationFailure::BeyondCoarseStep {
            expected_pc,
            candidates: structural,
            coarse_step: event.step,
        });
    }

    let (choice, estimated_fine_step) = match offsets.estimate() {
        Some(offset) => {
            let estimated = event.step as i64 - offset;
            let choice = in_budget
                .iter()
                .copied()
                .min_by_key(|s| ((s.fine_step as i64 - estimated).abs(), Reverse(s.fine_step)))
                .unwrap_or(in_budget[0]);
            (choice, Some(estimated))
        }
        None => {
            let choice = in_budget
                .iter()
                .copied()
                .max_by_key(|s| s.fine_step)
                .unwrap_or(in_budget[0]);
            (choice, None)
        }
    };
    Ok(resolved(
        choice,
        decoded,
        Confidence::Disambiguated {
            candidates: structural,
            estimated_fine_step,
        },
    ))
}

fn resolved(step: &StepRecord, decoded: Option<InsnKind>, confidence: Confidence) -> Correlation {
    Correlation {
        step_index: step.index,
        fine_step: step.fine_step,
        pc: step.pc,
        category: step.category,
        decoded,
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::offset::OffsetSample;
    use crate::records::{AccessInfoRecord, MutationKind, StepInfoRecord};

    fn add_word() -> u32 {
        // add x1, x2, x3
        (3 << 20) | (2 << 15) | (1 << 7) | 0x33
    }

    fn beq_word() -> u32 {
        // beq x2, x5, <imm 0>
        (5 << 20) | (2 << 15) | 0x63
    }

    fn step(step_index: u64, fine_step: u64, pc: u32, major: u32, minor: u32) -> StepInfoRecord {
        StepInfoRecord {
            step_index,
            fine_step,
            pc,
            first_access_index: 0,
            major,
            minor,
        }
    }

    fn index_of(steps: Vec<StepInfoRecord>) -> TraceIndex {
        TraceIndex::from_records(steps, Vec::<AccessInfoRecord>::new())
            .expect("test trace should build")
    }

    fn word_event(step: u64, pc: u32, original: u32) -> CoarseEvent {
        CoarseEvent {
            step,
            pc,
            kind: MutationKind::InstructionType,
            payload: FaultPayload::Word {
                original,
                mutated: original ^ 0x7000,
            },
        }
    }

    fn no_offsets() -> OffsetEstimator {
        OffsetEstimator::from_samples(Vec::new())
    }

    #[test]
    fn straight_line_instruction_resolves_exactly() {
        let index = index_of(vec![
            step(0, 0, 0x1000, 5, 2),
            step(1, 1, 0x1004, 0, 0),
            step(2, 2, 0x1008, 6, 2),
        ]);
        let event = word_event(7, 0x1000, add_word());
        let got = correlate_step(&event, &index, &no_offsets()).expect("should resolve");
        assert_eq!(got.step_index, 1);
        assert_eq!(got.pc, event.pc + INSTRUCTION_WIDTH);
        assert_eq!(got.category, Category::new(0, 0));
        assert_eq!(got.confidence, Confidence::Exact);
        assert!(!got.is_ambiguous());
    }

    #[test]
    fn category_filter_separates_steps_sharing_a_pc() {
        // Two retirement steps with the same post-execution pc but
        // different categories; the decode picks the add.
        let index = index_of(vec![
            step(0, 0, 0x1004, 5, 2),
            step(1, 1, 0x1004, 0, 0),
        ]);
        let event = word_event(9, 0x1000, add_word());
        let got = correlate_step(&event, &index, &no_offsets()).expect("should resolve");
        assert_eq!(got.step_index, 1);
        assert_eq!(got.confidence, Confidence::Exact);
    }

    #[test]
    fn auxiliary_steps_never_become_candidates() {
        let index = index_of(vec![
            step(0, 0, 0x1004, 9, 0),
            step(1, 0, 0x1004, 0, 0),
        ]);
        let event = word_event(5, 0x1000, add_word());
        let got = correlate_step(&event, &index, &no_offsets()).expect("should resolve");
        assert_eq!(got.step_index, 1);
    }

    #[test]
    fn loop_disambiguation_follows_the_offset_estimate() {
        let pc = 0x2004;
        let index = index_of(vec![
            step(0, 10, pc, 0, 0),
            step(1, 20, pc, 0, 0),
            step(2, 30, pc, 0, 0),
        ]);
        let event = word_event(34, pc - 4, add_word());
        let offsets = OffsetEstimator::from_samples(vec![OffsetSample {
            pc: 0x1000,
            coarse_step: 13,
            fine_step: 10,
        }]);
        let got = correlate_step(&event, &index, &offsets).expect("should resolve");
        // Estimated fine step 34 - 3 = 31; 30 is closest without exceeding 34.
        assert_eq!(got.fine_step, 30);
        assert_eq!(
            got.confidence,
            Confidence::Disambiguated {
                candidates: 3,
                estimated_fine_step: Some(31),
            }
        );
        assert!(got.is_ambiguous());
    }

    #[test]
    fn without_an_estimate_the_largest_in_budget_step_wins() {
        let pc = 0x2004;
        let index = index_of(vec![
            step(0, 10, pc, 0, 0),
            step(1, 20, pc, 0, 0),
            step(2, 30, pc, 0, 0),
        ]);
        let event = word_event(25, pc - 4, add_word());
        let got = correlate_step(&event, &index, &no_offsets()).expect("should resolve");
        assert_eq!(got.fine_step, 20);
        assert_eq!(
            got.confidence,
            Confidence::Disambiguated {
                candidates: 3,
                estimated_fine_step: None,
            }
        );
    }

    #[test]
    fn candidates_past_the_coarse_budget_are_a_failure() {
        let pc = 0x2004;
        let index = index_of(vec![step(0, 10, pc, 0, 0), step(1, 20, pc, 0, 0)]);
        let event = word_event(5, pc - 4, add_word());
        let err = correlate_step(&event, &index, &no_offsets()).expect_err("should fail");
        assert_eq!(
            err,
            CorrelationFailure::BeyondCoarseStep {
                expected_pc: pc,
                candidates: 2,
                coarse_step: 5,
            }
        );
        assert!(!err.expected_control_transfer());
    }

    #[test]
    fn taken_branch_with_no_fall_through_reports_the_transfer() {
        let index = index_of(vec![step(0, 0, 0x9000, 0, 0)]);
        let event = word_event(3, 0x1000, beq_word());
        let err = correlate_step(&event, &index, &no_offsets()).expect_err("should fail");
        assert!(matches!(err, CorrelationFailure::NoStepAtPc { .. }));
        assert!(err.expected_control_transfer());
    }

    #[test]
    fn taken_branch_with_a_fall_through_step_reports_a_category_mismatch() {
        // Something else retires at pc+4, but never with the branch category.
        let index = index_of(vec![step(0, 0, 0x1004, 0, 0)]);
        let event = word_event(3, 0x1000, beq_word());
        let err = correlate_step(&event, &index, &no_offsets()).expect_err("should fail");
        assert!(matches!(
            err,
            CorrelationFailure::CategoryMismatch {
                at_pc: 1,
                kind: InsnKind::Beq,
                ..
            }
        ));
        assert!(err.expected_control_transfer());
    }

    #[test]
    fn value_payloads_do_not_gate_on_category() {
        // An output payload is runtime data; even if it happened to decode,
        // no category filter applies, so the lone pc match wins.
        let index = index_of(vec![step(0, 0, 0x1004, 5, 2)]);
        let event = CoarseEvent {
            step: 9,
            pc: 0x1000,
            kind: MutationKind::LoadedValue,
            payload: FaultPayload::Output {
                original: add_word(),
                mutated: 77,
            },
        };
        let got = correlate_step(&event, &index, &no_offsets()).expect("should resolve");
        assert_eq!(got.step_index, 0);
        assert_eq!(got.decoded, None);
    }

    #[test]
    fn undecodable_original_encoding_degrades_to_pc_matching() {
        let index = index_of(vec![step(0, 0, 0x1004, 3, 1)]);
        let event = word_event(9, 0x1000, 0xffff_ffff);
        let got = correlate_step(&event, &index, &no_offsets()).expect("should resolve");
        assert_eq!(got.step_index, 0);
        assert_eq!(got.decoded, None);
    }

    proptest! {
        // Disambiguation optimality: no in-budget candidate sits closer to
        // the estimated fine step than the chosen one, and distance ties go
        // to the later step.
        #[test]
        fn disambiguation_picks_the_closest_in_budget_candidate(
            fines in proptest::collection::btree_set(0u64..60, 2..8),
            coarse_step in 20u64..80,
            offset in 0u64..15,
        ) {
            let fines: Vec<u64> = fines.into_iter().collect();
            prop_assume!(fines.iter().any(|&f| f <= coarse_step));

            let pc = 0x2004u32;
            let steps = fines
                .iter()
                .enumerate()
                .map(|(i, &f)| step(i as u64, f, pc, 0, 0))
                .collect();
            let index = index_of(steps);
            let offsets = OffsetEstimator::from_samples(vec![OffsetSample {
                pc: 0x1000,
                coarse_step: offset,
                fine_step: 0,
            }]);

            let event = word_event(coarse_step, pc - 4, add_word());
            let got = correlate_step(&event, &index, &offsets).expect("in-budget candidate exists");
            prop_assert!(got.fine_step <= coarse_step);
            prop_assert!(got.is_ambiguous());

            let estimate = coarse_step as i64 - offset as i64;
            let distance = |f: u64| (f as i64 - estimate).abs();
            for &f in fines.iter().filter(|&&f| f <= coarse_step) {
                prop_assert!(
                    distance(got.fine_step) < distance(f)
                        || (distance(got.fine_step) == distance(f) && got.fine_step >= f)
                );
            }
        }
    }
}
