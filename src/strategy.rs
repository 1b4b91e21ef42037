//! Mutation synthesis: one coarse fault in, one surgical trace edit out.
//!
//! Every strategy resolves the fault to its fine step through the
//! correlator, then picks exactly one record to rewrite. All unrelated
//! fields stay untouched, so the mutated run shows the fault's direct
//! constraint fallout instead of the cascade a full re-execution would
//! produce.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::correlate::{Correlation, CorrelationFailure, correlate_step};
use crate::isa::{self, Category, REGISTER_WINDOW_BASE};
use crate::offset::OffsetEstimator;
use crate::records::{CoarseEvent, FaultPayload, MutationKind};
use crate::trace::TraceIndex;

/// Majors 0 through this one retire instructions that deposit a computed
/// result in a register.
const MAX_COMPUTED_MAJOR: u32 = 4;
/// Major reserved for loads.
const LOAD_MAJOR: u32 = 5;
/// Major reserved for stores.
const STORE_MAJOR: u32 = 6;

/// Failure to turn a coarse fault into a concrete edit.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// The fault could not be resolved to a fine step.
    #[error(transparent)]
    Correlation(#[from] CorrelationFailure),
    /// The trace holds no record satisfying the strategy's constraints.
    #[error("no viable mutation target: {reason}")]
    NoValidTarget {
        /// Why the candidates were rejected, or why none existed.
        reason: String,
    },
}

/// Which of the two register strategies realizes a pre-execution fault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterStrategy {
    /// Corrupt the next read of the register at or after the injection point.
    #[default]
    NextRead,
    /// Corrupt the most recent write to the register before it.
    PriorWrite,
}

impl fmt::Display for RegisterStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterStrategy::NextRead => f.write_str("next-read"),
            RegisterStrategy::PriorWrite => f.write_str("prior-write"),
        }
    }
}

impl FromStr for RegisterStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<RegisterStrategy, String> {
        match s {
            "next-read" => Ok(RegisterStrategy::NextRead),
            "prior-write" => Ok(RegisterStrategy::PriorWrite),
            other => Err(format!(
                "unknown register strategy `{other}` (expected next-read or prior-write)"
            )),
        }
    }
}

/// The single field-level edit a mutation applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEdit {
    /// Rewrite one step's category; every access record stays untouched.
    StepCategory {
        /// Step record to rewrite.
        step_index: u64,
        /// Category to write.
        category: Category,
    },
    /// Rewrite one access record's value; its prior value stays untouched.
    AccessValue {
        /// Access record to rewrite.
        access_index: u64,
        /// Value to write.
        value: u32,
    },
}

impl fmt::Display for TraceEdit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TraceEdit::StepCategory {
                step_index,
                category,
            } => write!(f, "rewrite step {step_index} category to {category}"),
            TraceEdit::AccessValue {
                access_index,
                value,
            } => write!(f, "rewrite access {access_index} value to {value:#010x}"),
        }
    }
}

/// A fully resolved mutation, ready for external application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationTarget {
    /// Mutation kind the edit realizes.
    pub kind: MutationKind,
    /// Step record owning the edited record.
    pub step_index: u64,
    /// Retirement counter of that step; the subject keys the edit on it.
    pub fine_step: u64,
    /// The one edit to apply.
    pub edit: TraceEdit,
    /// How the fault's injection step was resolved.
    pub correlation: Correlation,
}

impl MutationTarget {
    /// Subject-facing document describing this mutation.
    pub fn document(&self) -> MutationDocument {
        match self.edit {
            TraceEdit::StepCategory { category, .. } => MutationDocument::Category {
                mutation: self.kind,
                fine_step: self.fine_step,
                major: category.major,
                minor: category.minor,
            },
            TraceEdit::AccessValue {
                access_index,
                value,
            } => MutationDocument::Value {
                mutation: self.kind,
                fine_step: self.fine_step,
                access_index,
                value,
            },
        }
    }
}

impl fmt::Display for MutationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at fine step {}: {}", self.kind, self.fine_step, self.edit)
    }
}

/// One-shot mutation configuration handed to the subject.
///
/// Flat JSON keyed by the mutation tag, carrying only the fields that
/// kind requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MutationDocument {
    /// Category rewrite for one step.
    Category {
        /// Kind tag the subject dispatches on.
        mutation: MutationKind,
        /// Retirement counter of the edited step.
        fine_step: u64,
        /// Major to write.
        major: u32,
        /// Minor to write.
        minor: u32,
    },
    /// Value rewrite for one access record.
    Value {
        /// Kind tag the subject dispatches on.
        mutation: MutationKind,
        /// Retirement counter of the step owning the edited record.
        fine_step: u64,
        /// Access record to rewrite.
        access_index: u64,
        /// Value to write.
        value: u32,
    },
}

impl MutationDocument {
    /// The kind tag this document dispatches on.
    pub fn kind(&self) -> MutationKind {
        match *self {
            MutationDocument::Category { mutation, .. }
            | MutationDocument::Value { mutation, .. } => mutation,
        }
    }

    /// Retirement counter the subject keys the edit on.
    pub fn fine_step(&self) -> u64 {
        match *self {
            MutationDocument::Category { fine_step, .. }
            | MutationDocument::Value { fine_step, .. } => fine_step,
        }
    }
}

/// Mutation strategy contract: resolve a coarse fault to its one edit.
pub trait MutationStrategy {
    /// Short label used in logs and reports.
    fn name(&self) -> &'static str;

    /// Kind tag written into the mutation document.
    fn kind(&self) -> MutationKind;

    /// Resolves `event` against the trace to a fully specified target.
    fn resolve(
        &self,
        event: &CoarseEvent,
        index: &TraceIndex,
        offsets: &OffsetEstimator,
    ) -> Result<MutationTarget, SynthesisError>;
}

/// Dispatch table keyed by mutation kind.
pub fn strategy_for(
    kind: MutationKind,
    register: RegisterStrategy,
) -> &'static dyn MutationStrategy {
    match kind {
        MutationKind::InstructionType => &InstructionTypeStrategy,
        MutationKind::ComputedOutput => &ComputedOutputStrategy,
        MutationKind::LoadedValue => &LoadedValueStrategy,
        MutationKind::StoredOutput => &StoredOutputStrategy,
        MutationKind::PreExecutionRegister => match register {
            RegisterStrategy::NextRead => &NextReadStrategy,
            RegisterStrategy::PriorWrite => &PriorWriteStrategy,
        },
    }
}

/// Rewrites the targeted step's category to the mutated encoding's.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstructionTypeStrategy;

impl MutationStrategy for InstructionTypeStrategy {
    fn name(&self) -> &'static str {
        "instruction-type"
    }

    fn kind(&self) -> MutationKind {
        MutationKind::InstructionType
    }

    fn resolve(
        &self,
        event: &CoarseEvent,
        index: &TraceIndex,
        offsets: &OffsetEstimator,
    ) -> Result<MutationTarget, SynthesisError> {
        let correlation = correlate_step(event, index, offsets)?;
        let FaultPayload::Word { mutated, .. } = event.payload else {
            return Err(SynthesisError::NoValidTarget {
                reason: format!("{} fault carries no instruction encoding", event.kind),
            });
        };
        let category = match isa::category_of(mutated) {
            Ok(category) => category,
            Err(err) => {
                return Err(SynthesisError::NoValidTarget {
                    reason: format!("mutated encoding is not classifiable: {err}"),
                });
            }
        };
        Ok(MutationTarget {
            kind: self.kind(),
            step_index: correlation.step_index,
            fine_step: correlation.fine_step,
            edit: TraceEdit::StepCategory {
                step_index: correlation.step_index,
                category,
            },
            correlation,
        })
    }
}

/// Rewrites the register result a computation step deposits.
#[derive(Debug, Default, Clone, Copy)]
pub struct ComputedOutputStrategy;

impl MutationStrategy for ComputedOutputStrategy {
    fn name(&self) -> &'static str {
        "computed-output"
    }

    fn kind(&self) -> MutationKind {
        MutationKind::ComputedOutput
    }

    fn resolve(
        &self,
        event: &CoarseEvent,
        index: &TraceIndex,
        offsets: &OffsetEstimator,
    ) -> Result<MutationTarget, SynthesisError> {
        let correlation = correlate_step(event, index, offsets)?;
        if correlation.category.major > MAX_COMPUTED_MAJOR {
            return Err(SynthesisError::NoValidTarget {
                reason: format!(
                    "step at fine step {} has category {}, not a computation category (majors 0..={MAX_COMPUTED_MAJOR})",
                    correlation.fine_step, correlation.category,
                ),
            });
        }
        last_owned_write(
            self.kind(),
            event.payload.injected_value(),
            index,
            &correlation,
            WriteClass::Register,
        )
    }
}

/// Rewrites the register a load deposits its word into.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadedValueStrategy;

impl MutationStrategy for LoadedValueStrategy {
    fn name(&self) -> &'static str {
        "loaded-value"
    }

    fn kind(&self) -> MutationKind {
        MutationKind::LoadedValue
    }

    fn resolve(
        &self,
        event: &CoarseEvent,
        index: &TraceIndex,
        offsets: &OffsetEstimator,
    ) -> Result<MutationTarget, SynthesisError> {
        let correlation = correlate_step(event, index, offsets)?;
        if correlation.category.major != LOAD_MAJOR {
            return Err(SynthesisError::NoValidTarget {
                reason: format!(
                    "step at fine step {} has category {}, not the load category (major {LOAD_MAJOR})",
                    correlation.fine_step, correlation.category,
                ),
            });
        }
        last_owned_write(
            self.kind(),
            event.payload.injected_value(),
            index,
            &correlation,
            WriteClass::Register,
        )
    }
}

/// Rewrites the memory word a store writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoredOutputStrategy;

impl MutationStrategy for StoredOutputStrategy {
    fn name(&self) -> &'static str {
        "stored-output"
    }

    fn kind(&self) -> MutationKind {
        MutationKind::StoredOutput
    }

    fn resolve(
        &self,
        event: &CoarseEvent,
        index: &TraceIndex,
        offsets: &OffsetEstimator,
    ) -> Result<MutationTarget, SynthesisError> {
        let correlation = correlate_step(event, index, offsets)?;
        if correlation.category.major != STORE_MAJOR {
            return Err(SynthesisError::NoValidTarget {
                reason: format!(
                    "step at fine step {} has category {}, not the store category (major {STORE_MAJOR})",
                    correlation.fine_step, correlation.category,
                ),
            });
        }
        last_owned_write(
            self.kind(),
            event.payload.injected_value(),
            index,
            &correlation,
            WriteClass::Memory,
        )
    }
}

/// Rewrites the next read of the corrupted location so the injected value
/// is observed where the coarse layer planted it.
///
/// Reads owned by auxiliary steps are skipped; consistency is not checked
/// there, so an edit would go unnoticed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NextReadStrategy;

impl MutationStrategy for NextReadStrategy {
    fn name(&self) -> &'static str {
        "next-read"
    }

    fn kind(&self) -> MutationKind {
        MutationKind::PreExecutionRegister
    }

    fn resolve(
        &self,
        event: &CoarseEvent,
        index: &TraceIndex,
        offsets: &OffsetEstimator,
    ) -> Result<MutationTarget, SynthesisError> {
        let correlation = correlate_step(event, index, offsets)?;
        let (address, location) = fault_location(&event.payload)?;

        // The coarse layer corrupts the location before the instruction
        // executes, so a read at the injection step itself already sees
        // the injected value and counts as a target.
        let mut auxiliary_reads = 0usize;
        let mut first_auxiliary: Option<(u64, Category)> = None;
        for access in index.accesses() {
            if !access.is_read() || access.address != address {
                continue;
            }
            let Some(owner) = index.step(access.owner_index()) else {
                continue;
            };
            if owner.fine_step < correlation.fine_step {
                continue;
            }
            if owner.auxiliary {
                auxiliary_reads += 1;
                if first_auxiliary.is_none() {
                    first_auxiliary = Some((owner.fine_step, owner.category));
                }
                continue;
            }
            return Ok(value_target(
                self.kind(),
                owner.index,
                owner.fine_step,
                access.index,
                event.payload.injected_value(),
                correlation,
            ));
        }

        Err(SynthesisError::NoValidTarget {
            reason: match first_auxiliary {
                Some((fine_step, category)) => format!(
                    "{auxiliary_reads} read(s) of {location} from fine step {} on all fall in auxiliary steps \
                     (first at fine step {fine_step}, category {category}); those reads are not constraint checked",
                    correlation.fine_step,
                ),
                None => format!(
                    "{location} is never read at or after fine step {}",
                    correlation.fine_step
                ),
            },
        })
    }
}

/// Rewrites the most recent write to the corrupted location, so the next
/// read's prior value no longer matches what was written.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorWriteStrategy;

impl MutationStrategy for PriorWriteStrategy {
    fn name(&self) -> &'static str {
        "prior-write"
    }

    fn kind(&self) -> MutationKind {
        MutationKind::PreExecutionRegister
    }

    fn resolve(
        &self,
        event: &CoarseEvent,
        index: &TraceIndex,
        offsets: &OffsetEstimator,
    ) -> Result<MutationTarget, SynthesisError> {
        let correlation = correlate_step(event, index, offsets)?;
        let (address, location) = fault_location(&event.payload)?;

        for access in index.accesses().iter().rev() {
            if !access.is_write() || access.address != address {
                continue;
            }
            let Some(owner) = index.step(access.owner_index()) else {
                continue;
            };
            if owner.fine_step >= correlation.fine_step {
                continue;
            }
            return Ok(value_target(
                self.kind(),
                owner.index,
                owner.fine_step,
                access.index,
                event.payload.injected_value(),
                correlation,
            ));
        }

        Err(SynthesisError::NoValidTarget {
            reason: format!(
                "{location} is never written before fine step {}",
                correlation.fine_step
            ),
        })
    }
}

/// Which address class a write-targeting scan accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteClass {
    Register,
    Memory,
}

/// Picks the last write of the given class owned by the resolved step.
fn last_owned_write(
    kind: MutationKind,
    value: u32,
    index: &TraceIndex,
    correlation: &Correlation,
    class: WriteClass,
) -> Result<MutationTarget, SynthesisError> {
    let access = index
        .owned_accesses(correlation.step_index)
        .iter()
        .rev()
        .find(|a| {
            a.is_write()
                && match class {
                    WriteClass::Register => a.is_register(),
                    WriteClass::Memory => !a.is_register(),
                }
        })
        .ok_or_else(|| SynthesisError::NoValidTarget {
            reason: match class {
                WriteClass::Register => format!(
                    "step at fine step {} writes no register",
                    correlation.fine_step
                ),
                WriteClass::Memory => format!(
                    "step at fine step {} writes no memory word",
                    correlation.fine_step
                ),
            },
        })?;
    Ok(value_target(
        kind,
        correlation.step_index,
        correlation.fine_step,
        access.index,
        value,
        *correlation,
    ))
}

/// Word address and display name of the location a pre-execution fault
/// names. Fails for payloads that carry only values.
fn fault_location(payload: &FaultPayload) -> Result<(u32, String), SynthesisError> {
    match *payload {
        FaultPayload::Register { register, .. } => {
            let name = isa::register_name(register)
                .map(str::to_string)
                .unwrap_or_else(|| format!("x{register}"));
            Ok((REGISTER_WINDOW_BASE + register, format!("register {name}")))
        }
        FaultPayload::Memory { address, .. } => {
            Ok((address >> 2, format!("memory word at {address:#010x}")))
        }
        _ => Err(SynthesisError::NoValidTarget {
            reason: "fault payload names no register or memory word".to_string(),
        }),
    }
}

fn value_target(
    kind: MutationKind,
    step_index: u64,
    fine_step: u64,
    access_index: u64,
    value: u32,
    correlation: Correlation,
) -> MutationTarget {
    MutationTarget {
        kind,
        step_index,
        fine_step,
        edit: TraceEdit::AccessValue {
            access_index,
            value,
        },
        correlation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::InsnKind;
    use crate::records::{AccessInfoRecord, StepInfoRecord};

    fn step(
        step_index: u64,
        fine_step: u64,
        pc: u32,
        major: u32,
        minor: u32,
        first: u64,
    ) -> StepInfoRecord {
        StepInfoRecord {
            step_index,
            fine_step,
            pc,
            first_access_index: first,
            major,
            minor,
        }
    }

    fn read(access_index: u64, address: u32, owner: u64, value: u32) -> AccessInfoRecord {
        AccessInfoRecord {
            access_index,
            address,
            phase: 2 * owner,
            value,
            prior_phase: 0,
            prior_value: value,
        }
    }

    fn write(access_index: u64, address: u32, owner: u64, value: u32) -> AccessInfoRecord {
        AccessInfoRecord {
            access_index,
            address,
            phase: 2 * owner + 1,
            value,
            prior_phase: 0,
            prior_value: value.wrapping_add(1),
        }
    }

    fn index_of(steps: Vec<StepInfoRecord>, accesses: Vec<AccessInfoRecord>) -> TraceIndex {
        TraceIndex::from_records(steps, accesses).expect("test trace should build")
    }

    fn event(step: u64, pc: u32, kind: MutationKind, payload: FaultPayload) -> CoarseEvent {
        CoarseEvent {
            step,
            pc,
            kind,
            payload,
        }
    }

    fn no_offsets() -> OffsetEstimator {
        OffsetEstimator::from_samples(Vec::new())
    }

    fn reg(index: u32) -> u32 {
        REGISTER_WINDOW_BASE + index
    }

    #[test]
    fn instruction_type_rewrites_the_category_of_the_resolved_step() {
        // The documented worked example: an addi swapped for a xori two
        // blocks over, landing on the step that retires at pc + 4.
        let index = index_of(
            vec![
                step(0, 197, 2144416, 0, 0, 0),
                step(1, 198, 2144420, 0, 7, 0),
                step(2, 199, 2144424, 5, 2, 0),
            ],
            vec![],
        );
        let fault = event(
            200,
            2144416,
            MutationKind::InstructionType,
            FaultPayload::Word {
                original: 3147283,
                mutated: 8897555,
            },
        );
        let target = InstructionTypeStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect("should resolve");
        assert_eq!(target.step_index, 1);
        assert_eq!(target.fine_step, 198);
        assert_eq!(
            target.edit,
            TraceEdit::StepCategory {
                step_index: 1,
                category: Category::new(1, 0),
            }
        );
        // Re-decoding the mutated encoding gives exactly the written category.
        assert_eq!(
            isa::category_of(8897555).expect("mutated word should classify"),
            Category::new(1, 0)
        );
        assert_eq!(
            target.document(),
            MutationDocument::Category {
                mutation: MutationKind::InstructionType,
                fine_step: 198,
                major: 1,
                minor: 0,
            }
        );
    }

    #[test]
    fn instruction_type_needs_a_classifiable_mutated_encoding() {
        let index = index_of(vec![step(0, 0, 0x1004, 0, 0, 0)], vec![]);
        let add = (3 << 20) | (2 << 15) | (1 << 7) | 0x33;
        let fault = event(
            5,
            0x1000,
            MutationKind::InstructionType,
            FaultPayload::Word {
                original: add,
                mutated: 0xffff_ffff,
            },
        );
        let err = InstructionTypeStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect_err("should reject");
        match err {
            SynthesisError::NoValidTarget { reason } => {
                assert!(reason.contains("not classifiable"), "reason: {reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn instruction_type_needs_an_encoding_payload() {
        let index = index_of(vec![step(0, 0, 0x1004, 0, 0, 0)], vec![]);
        let fault = event(
            5,
            0x1000,
            MutationKind::InstructionType,
            FaultPayload::Register {
                register: 10,
                value: 7,
            },
        );
        let err = InstructionTypeStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect_err("should reject");
        match err {
            SynthesisError::NoValidTarget { reason } => {
                assert!(reason.contains("no instruction encoding"), "reason: {reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn correlation_failures_pass_through_synthesis() {
        // A taken branch retires at its target, never at pc + 4.
        let index = index_of(vec![step(0, 0, 0x9000, 0, 0, 0)], vec![]);
        let beq = (5 << 20) | (2 << 15) | 0x63;
        let fault = event(
            3,
            0x1000,
            MutationKind::InstructionType,
            FaultPayload::Word {
                original: beq,
                mutated: beq ^ 0x7000,
            },
        );
        let err = InstructionTypeStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect_err("should fail");
        match err {
            SynthesisError::Correlation(inner) => {
                assert!(inner.expected_control_transfer());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn computation_fixture() -> TraceIndex {
        index_of(
            vec![
                step(0, 0, 0x1000, 5, 0, 0),
                step(1, 1, 0x1004, 0, 0, 2),
                step(2, 2, 0x1008, 6, 0, 6),
            ],
            vec![
                read(0, reg(10), 0, 1),
                write(1, reg(10), 0, 2),
                read(2, reg(11), 1, 3),
                write(3, reg(12), 1, 4),
                write(4, 0x4000, 1, 5),
                write(5, reg(13), 1, 6),
                write(6, 0x5000, 2, 7),
            ],
        )
    }

    #[test]
    fn computed_output_targets_the_last_register_write() {
        let index = computation_fixture();
        let fault = event(
            9,
            0x1000,
            MutationKind::ComputedOutput,
            FaultPayload::Output {
                original: 4,
                mutated: 0xdead_beef,
            },
        );
        let target = ComputedOutputStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect("should resolve");
        assert_eq!(target.step_index, 1);
        assert_eq!(target.fine_step, 1);
        assert_eq!(
            target.edit,
            TraceEdit::AccessValue {
                access_index: 5,
                value: 0xdead_beef,
            }
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let index = computation_fixture();
        let fault = event(
            9,
            0x1000,
            MutationKind::ComputedOutput,
            FaultPayload::Output {
                original: 4,
                mutated: 0xdead_beef,
            },
        );
        let first = ComputedOutputStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect("should resolve");
        let second = ComputedOutputStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect("should resolve");
        assert_eq!(first, second);
    }

    #[test]
    fn computed_output_rejects_non_computation_steps() {
        // The step at pc + 4 is a load, outside the computation majors.
        let index = index_of(
            vec![step(0, 0, 0x1000, 0, 0, 0), step(1, 1, 0x1004, 5, 0, 0)],
            vec![],
        );
        let fault = event(
            9,
            0x1000,
            MutationKind::ComputedOutput,
            FaultPayload::Output {
                original: 4,
                mutated: 5,
            },
        );
        let err = ComputedOutputStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect_err("should reject");
        match err {
            SynthesisError::NoValidTarget { reason } => {
                assert!(reason.contains("not a computation category"), "reason: {reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn load_fixture() -> TraceIndex {
        index_of(
            vec![step(0, 0, 0x1000, 0, 0, 0), step(1, 1, 0x1004, 5, 2, 0)],
            vec![read(0, 0x9000, 1, 6), write(1, reg(14), 1, 6)],
        )
    }

    #[test]
    fn loaded_value_targets_the_load_register_write() {
        let index = load_fixture();
        let fault = event(
            9,
            0x1000,
            MutationKind::LoadedValue,
            FaultPayload::Output {
                original: 6,
                mutated: 77,
            },
        );
        let target = LoadedValueStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect("should resolve");
        assert_eq!(
            target.edit,
            TraceEdit::AccessValue {
                access_index: 1,
                value: 77,
            }
        );
        assert_eq!(
            target.document(),
            MutationDocument::Value {
                mutation: MutationKind::LoadedValue,
                fine_step: 1,
                access_index: 1,
                value: 77,
            }
        );
    }

    #[test]
    fn loaded_value_rejects_non_load_steps() {
        let index = computation_fixture();
        let fault = event(
            9,
            0x1000,
            MutationKind::LoadedValue,
            FaultPayload::Output {
                original: 6,
                mutated: 77,
            },
        );
        let err = LoadedValueStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect_err("should reject");
        match err {
            SynthesisError::NoValidTarget { reason } => {
                assert!(reason.contains("not the load category"), "reason: {reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn stored_output_targets_the_memory_write() {
        // A register write follows the memory write; the memory word is
        // still the one the store deposited.
        let index = index_of(
            vec![step(0, 0, 0x1000, 0, 0, 0), step(1, 1, 0x1004, 6, 2, 0)],
            vec![
                read(0, reg(15), 1, 6),
                write(1, 0x4000, 1, 6),
                write(2, reg(15), 1, 6),
            ],
        );
        let fault = event(
            9,
            0x1000,
            MutationKind::StoredOutput,
            FaultPayload::StoreData {
                original: 6,
                mutated: 0x55,
            },
        );
        let target = StoredOutputStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect("should resolve");
        assert_eq!(
            target.edit,
            TraceEdit::AccessValue {
                access_index: 1,
                value: 0x55,
            }
        );
    }

    #[test]
    fn stored_output_needs_a_memory_write() {
        let index = index_of(
            vec![step(0, 0, 0x1000, 0, 0, 0), step(1, 1, 0x1004, 6, 2, 0)],
            vec![write(0, reg(15), 1, 6)],
        );
        let fault = event(
            9,
            0x1000,
            MutationKind::StoredOutput,
            FaultPayload::StoreData {
                original: 6,
                mutated: 0x55,
            },
        );
        let err = StoredOutputStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect_err("should reject");
        match err {
            SynthesisError::NoValidTarget { reason } => {
                assert!(reason.contains("writes no memory word"), "reason: {reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn next_read_skips_earlier_and_auxiliary_readers() {
        // One read before the injection point, one inside an auxiliary
        // step, one inside a later retirement step. Only the last counts.
        let index = index_of(
            vec![
                step(0, 9, 0x1000, 5, 0, 0),
                step(1, 10, 0x1004, 0, 7, 1),
                step(2, 10, 0x2000, 9, 0, 1),
                step(3, 11, 0x1008, 5, 0, 2),
            ],
            vec![
                read(0, reg(13), 0, 3),
                read(1, reg(13), 2, 3),
                read(2, reg(13), 3, 3),
            ],
        );
        let fault = event(
            10,
            0x1000,
            MutationKind::PreExecutionRegister,
            FaultPayload::Register {
                register: 13,
                value: 0xbeef,
            },
        );
        let target = NextReadStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect("should resolve");
        assert_eq!(target.step_index, 3);
        assert_eq!(target.fine_step, 11);
        assert_eq!(
            target.edit,
            TraceEdit::AccessValue {
                access_index: 2,
                value: 0xbeef,
            }
        );
    }

    #[test]
    fn next_read_counts_the_injection_steps_own_read() {
        let index = index_of(
            vec![
                step(0, 4, 0x1000, 0, 0, 0),
                step(1, 5, 0x1004, 0, 7, 0),
                step(2, 6, 0x1008, 5, 0, 1),
            ],
            vec![read(0, reg(20), 1, 3), read(1, reg(20), 2, 3)],
        );
        let fault = event(
            5,
            0x1000,
            MutationKind::PreExecutionRegister,
            FaultPayload::Register {
                register: 20,
                value: 0x7777,
            },
        );
        let target = NextReadStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect("should resolve");
        assert_eq!(target.step_index, 1);
        assert_eq!(target.fine_step, 5);
        assert_eq!(
            target.edit,
            TraceEdit::AccessValue {
                access_index: 0,
                value: 0x7777,
            }
        );
    }

    #[test]
    fn next_read_with_only_auxiliary_readers_is_not_applicable() {
        let index = index_of(
            vec![
                step(0, 4, 0x1000, 0, 0, 0),
                step(1, 5, 0x1004, 0, 7, 0),
                step(2, 5, 0x2000, 9, 1, 0),
            ],
            vec![read(0, reg(21), 2, 3)],
        );
        let fault = event(
            5,
            0x1000,
            MutationKind::PreExecutionRegister,
            FaultPayload::Register {
                register: 21,
                value: 1,
            },
        );
        let err = NextReadStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect_err("should reject");
        match err {
            SynthesisError::NoValidTarget { reason } => {
                assert!(reason.contains("auxiliary"), "reason: {reason}");
                assert!(reason.contains("not constraint checked"), "reason: {reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn next_read_resolves_memory_word_addresses() {
        let index = index_of(
            vec![step(0, 1, 0x1000, 0, 7, 0), step(1, 2, 0x1004, 5, 0, 0)],
            vec![read(0, 0x4000, 1, 9)],
        );
        let fault = event(
            1,
            0xffc,
            MutationKind::PreExecutionRegister,
            FaultPayload::Memory {
                address: 0x10000,
                value: 9,
            },
        );
        let target = NextReadStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect("should resolve");
        assert_eq!(
            target.edit,
            TraceEdit::AccessValue {
                access_index: 0,
                value: 9,
            }
        );
    }

    #[test]
    fn register_strategies_need_a_location_payload() {
        let index = index_of(vec![step(0, 0, 0x1004, 0, 0, 0)], vec![]);
        let fault = event(
            5,
            0x1000,
            MutationKind::PreExecutionRegister,
            FaultPayload::Output {
                original: 1,
                mutated: 2,
            },
        );
        let err = NextReadStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect_err("should reject");
        match err {
            SynthesisError::NoValidTarget { reason } => {
                assert!(reason.contains("names no register"), "reason: {reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn prior_write_fixture() -> TraceIndex {
        index_of(
            vec![
                step(0, 3, 0xf00, 0, 0, 0),
                step(1, 7, 0xf04, 0, 0, 1),
                step(2, 10, 0x1004, 0, 7, 2),
                step(3, 12, 0x1008, 5, 0, 3),
            ],
            vec![
                write(0, reg(20), 0, 1),
                write(1, reg(20), 1, 2),
                write(2, reg(20), 2, 3),
            ],
        )
    }

    #[test]
    fn prior_write_finds_the_most_recent_write_before_injection() {
        let index = prior_write_fixture();
        let fault = event(
            10,
            0x1000,
            MutationKind::PreExecutionRegister,
            FaultPayload::Register {
                register: 20,
                value: 0x7777,
            },
        );
        let target = PriorWriteStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect("should resolve");
        // The injection step's own write is not prior; fine step 7 is.
        assert_eq!(target.step_index, 1);
        assert_eq!(target.fine_step, 7);
        assert_eq!(
            target.edit,
            TraceEdit::AccessValue {
                access_index: 1,
                value: 0x7777,
            }
        );
    }

    #[test]
    fn prior_write_without_an_earlier_write_is_not_applicable() {
        let index = prior_write_fixture();
        let fault = event(
            10,
            0x1000,
            MutationKind::PreExecutionRegister,
            FaultPayload::Register {
                register: 25,
                value: 0x7777,
            },
        );
        let err = PriorWriteStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect_err("should reject");
        match err {
            SynthesisError::NoValidTarget { reason } => {
                assert!(reason.contains("never written before"), "reason: {reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn dispatch_selects_by_kind_and_register_strategy() {
        let table = [
            (MutationKind::InstructionType, "instruction-type"),
            (MutationKind::ComputedOutput, "computed-output"),
            (MutationKind::LoadedValue, "loaded-value"),
            (MutationKind::StoredOutput, "stored-output"),
        ];
        for (kind, name) in table {
            let strategy = strategy_for(kind, RegisterStrategy::default());
            assert_eq!(strategy.name(), name);
            assert_eq!(strategy.kind(), kind);
        }
        assert_eq!(
            strategy_for(MutationKind::PreExecutionRegister, RegisterStrategy::NextRead).name(),
            "next-read"
        );
        assert_eq!(
            strategy_for(MutationKind::PreExecutionRegister, RegisterStrategy::PriorWrite).name(),
            "prior-write"
        );
    }

    #[test]
    fn register_strategy_parses_its_display_form() {
        for strategy in [RegisterStrategy::NextRead, RegisterStrategy::PriorWrite] {
            let parsed: RegisterStrategy = strategy
                .to_string()
                .parse()
                .expect("display form should parse");
            assert_eq!(parsed, strategy);
        }
        assert!("sideways".parse::<RegisterStrategy>().is_err());
    }

    #[test]
    fn documents_carry_only_the_fields_their_kind_requires() {
        let category = MutationDocument::Category {
            mutation: MutationKind::InstructionType,
            fine_step: 198,
            major: 1,
            minor: 0,
        };
        assert_eq!(
            serde_json::to_value(category).expect("category document should serialize"),
            serde_json::json!({
                "mutation": "instruction-type",
                "fine_step": 198,
                "major": 1,
                "minor": 0,
            })
        );

        let value = MutationDocument::Value {
            mutation: MutationKind::PreExecutionRegister,
            fine_step: 512,
            access_index: 4031,
            value: 77,
        };
        let json = serde_json::to_value(value).expect("value document should serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "mutation": "pre-execution-register",
                "fine_step": 512,
                "access_index": 4031,
                "value": 77,
            })
        );
        let back: MutationDocument =
            serde_json::from_value(json).expect("value document should deserialize");
        assert_eq!(back, value);
        assert_eq!(back.kind(), MutationKind::PreExecutionRegister);
        assert_eq!(back.fine_step(), 512);
    }

    #[test]
    fn correlation_metadata_survives_into_the_target() {
        let index = computation_fixture();
        let fault = event(
            9,
            0x1000,
            MutationKind::ComputedOutput,
            FaultPayload::Output {
                original: 4,
                mutated: 5,
            },
        );
        let target = ComputedOutputStrategy
            .resolve(&fault, &index, &no_offsets())
            .expect("should resolve");
        assert!(!target.correlation.is_ambiguous());
        assert_eq!(target.correlation.decoded, None::<InsnKind>);
        assert_eq!(target.to_string(), format!("computed-output at fine step 1: {}", target.edit));
    }
}
