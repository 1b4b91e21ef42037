//! Fine-trace index: step records, access records, and the ownership
//! adjacency between them.
//!
//! Step records always cover the whole run; access records may be a
//! step-scoped subset (the subject dumps them per fine step on request), so
//! they are keyed by their global index rather than by position.

use std::collections::BTreeMap;

use crate::isa::{Category, REGISTER_COUNT, REGISTER_WINDOW_BASE};
use crate::records::{
    AccessInfoRecord, AccessRangeRecord, ParseError, StepInfoRecord, parse_access_infos,
    parse_access_ranges, parse_step_infos,
};

/// One fine-trace cycle, auxiliary or retirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRecord {
    /// Position in the fine sequence.
    pub index: u64,
    /// Retirement counter; repeats across auxiliary records.
    pub fine_step: u64,
    /// Address after execution, i.e. the next instruction's address.
    pub pc: u32,
    /// Cycle category.
    pub category: Category,
    /// Index of the first access record this step owns.
    pub first_access_index: u64,
    /// True for non-retirement cycles.
    pub auxiliary: bool,
}

/// One word-granular memory or register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRecord {
    /// Position in the access sequence.
    pub index: u64,
    /// Word-granular location.
    pub address: u32,
    /// `2 * owning step index + (0 for read, 1 for write)`.
    pub phase: u64,
    /// Value observed (read) or deposited (write).
    pub value: u32,
    /// Phase of the previous access to the same address.
    pub prior_phase: u64,
    /// Value displaced by this access; equals `value` for reads.
    pub prior_value: u32,
}

impl AccessRecord {
    /// True when the phase parity marks a write.
    pub fn is_write(&self) -> bool {
        self.phase % 2 == 1
    }

    /// True when the phase parity marks a read.
    pub fn is_read(&self) -> bool {
        !self.is_write()
    }

    /// Step record index encoded in the phase.
    pub fn owner_index(&self) -> u64 {
        self.phase / 2
    }

    /// True when the address falls inside the register window.
    pub fn is_register(&self) -> bool {
        (REGISTER_WINDOW_BASE..REGISTER_WINDOW_BASE + REGISTER_COUNT).contains(&self.address)
    }

    /// Register index for addresses inside the window.
    pub fn register_index(&self) -> Option<u32> {
        if self.is_register() {
            Some(self.address - REGISTER_WINDOW_BASE)
        } else {
            None
        }
    }
}

impl From<AccessInfoRecord> for AccessRecord {
    fn from(r: AccessInfoRecord) -> Self {
        AccessRecord {
            index: r.access_index,
            address: r.address,
            phase: r.phase,
            prior_phase: r.prior_phase,
            value: r.value,
            prior_value: r.prior_value,
        }
    }
}

/// Read-only index over one inspection dump.
#[derive(Debug, Clone)]
pub struct TraceIndex {
    steps: Vec<StepRecord>,
    accesses: Vec<AccessRecord>,
    by_pc: BTreeMap<u32, Vec<u64>>,
    by_fine: BTreeMap<u64, u64>,
}

impl TraceIndex {
    /// Parses an inspection dump and builds the index.
    ///
    /// Any `<step-access-range>` records in the dump are cross-checked
    /// against the adjacency the index derives itself.
    pub fn from_output(text: &str) -> Result<TraceIndex, ParseError> {
        let index = TraceIndex::from_records(parse_step_infos(text)?, parse_access_infos(text)?)?;
        index.check_ranges(&parse_access_ranges(text)?)?;
        Ok(index)
    }

    /// Builds the index from already-parsed wire records, validating the
    /// adjacency invariants.
    pub fn from_records(
        step_infos: Vec<StepInfoRecord>,
        access_infos: Vec<AccessInfoRecord>,
    ) -> Result<TraceIndex, ParseError> {
        if step_infos.is_empty() {
            return Err(ParseError::EmptyTrace);
        }

        let mut steps = Vec::with_capacity(step_infos.len());
        let mut by_pc: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
        let mut by_fine: BTreeMap<u64, u64> = BTreeMap::new();
        let mut prev_first = 0u64;
        for (position, info) in step_infos.into_iter().enumerate() {
            let expected = position as u64;
            if info.step_index != expected {
                return Err(ParseError::StepIndexGap {
                    found: info.step_index,
                    expected,
                });
            }
            if info.first_access_index < prev_first {
                return Err(ParseError::NonMonotonicFirstAccess {
                    step_index: info.step_index,
                });
            }
            prev_first = info.first_access_index;
            let category = Category::new(info.major, info.minor);
            by_pc.entry(info.pc).or_default().push(info.step_index);
            if !category.is_auxiliary() {
                by_fine.entry(info.fine_step).or_insert(info.step_index);
            }
            steps.push(StepRecord {
                index: info.step_index,
                fine_step: info.fine_step,
                pc: info.pc,
                category,
                first_access_index: info.first_access_index,
                auxiliary: category.is_auxiliary(),
            });
        }

        let mut accesses: Vec<AccessRecord> = Vec::with_capacity(access_infos.len());
        let mut prev_index: Option<u64> = None;
        for info in access_infos {
            let access = AccessRecord::from(info);
            if let Some(prev) = prev_index {
                if access.index <= prev {
                    return Err(ParseError::AccessOutOfOrder {
                        found: access.index,
                        prev,
                    });
                }
            }
            prev_index = Some(access.index);
            if access.is_read() && access.value != access.prior_value {
                return Err(ParseError::ReadDisplacesValue {
                    access_index: access.index,
                });
            }
            accesses.push(access);
        }

        let index = TraceIndex {
            steps,
            accesses,
            by_pc,
            by_fine,
        };
        index.check_ownership()?;
        Ok(index)
    }

    /// Declared ranges must match the adjacency-derived bounds exactly.
    fn check_ranges(&self, ranges: &[AccessRangeRecord]) -> Result<(), ParseError> {
        for range in ranges {
            let (derived_start, derived_end) =
                self.access_bounds(range.step_index).unwrap_or((0, 0));
            if range.access_start != derived_start || range.access_end != derived_end {
                return Err(ParseError::RangeMismatch {
                    step_index: range.step_index,
                    access_start: range.access_start,
                    access_end: range.access_end,
                    derived_start,
                    derived_end,
                });
            }
        }
        Ok(())
    }

    /// Every access's phase-encoded owner must agree with the adjacency
    /// derived from `first_access_index`.
    fn check_ownership(&self) -> Result<(), ParseError> {
        for access in &self.accesses {
            let owner = access.owner_index();
            let consistent = match self.access_bounds(owner) {
                Some((start, end)) => access.index >= start && access.index < end,
                None => false,
            };
            if !consistent {
                return Err(ParseError::PhaseOutsideOwner {
                    access_index: access.index,
                    phase: access.phase,
                    step_index: owner,
                });
            }
        }
        Ok(())
    }

    /// All step records in sequence order.
    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// All known access records in index order.
    pub fn accesses(&self) -> &[AccessRecord] {
        &self.accesses
    }

    /// Step record by sequence index.
    pub fn step(&self, index: u64) -> Option<&StepRecord> {
        self.steps.get(index as usize)
    }

    /// Access record by global access index, if it was dumped.
    pub fn access(&self, index: u64) -> Option<&AccessRecord> {
        let position = self
            .accesses
            .binary_search_by_key(&index, |a| a.index)
            .ok()?;
        self.accesses.get(position)
    }

    /// Step indexes whose post-execution pc equals `pc`, in sequence order.
    pub fn steps_at_pc(&self, pc: u32) -> &[u64] {
        self.by_pc.get(&pc).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The retirement step carrying this fine step value.
    ///
    /// Auxiliary records repeat the counter of a neighboring retirement and
    /// are never returned here.
    pub fn retirement_at_fine(&self, fine_step: u64) -> Option<&StepRecord> {
        self.step(*self.by_fine.get(&fine_step)?)
    }

    /// Ownership bounds `[start, end)` of a step's access range.
    ///
    /// The last step owns everything from its `first_access_index` on; its
    /// end bound is clamped to one past the highest dumped access.
    pub fn access_bounds(&self, step_index: u64) -> Option<(u64, u64)> {
        let step = self.step(step_index)?;
        let start = step.first_access_index;
        let end = match self.step(step_index + 1) {
            Some(next) => next.first_access_index,
            None => self
                .accesses
                .last()
                .map(|a| a.index + 1)
                .unwrap_or(start)
                .max(start),
        };
        Some((start, end))
    }

    /// The dumped access records a step owns.
    pub fn owned_accesses(&self, step_index: u64) -> &[AccessRecord] {
        let Some((start, end)) = self.access_bounds(step_index) else {
            return &[];
        };
        let lo = self.accesses.partition_point(|a| a.index < start);
        let hi = self.accesses.partition_point(|a| a.index < end);
        &self.accesses[lo..hi]
    }
}
