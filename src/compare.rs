//! Differential comparison of constraint-failure sets.
//!
//! The coarse and fine runs each yield a set of constraint failures. A
//! shared failure means the synthesized mutation reproduced the coarse
//! fault's effect; the partition into common and one-sided failures is
//! the whole point of the exercise.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::isa::Category;
use crate::records::{FailureRecord, MutationKind};

/// How failure identity is keyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Category, location, fine step, and pc must all match.
    #[default]
    Exact,
    /// Category and location only. Used when the two injection points sit
    /// at different trace positions by construction, so exact positions
    /// are expected to differ.
    Loose,
}

impl KeyPolicy {
    /// Policy appropriate for a mutation kind.
    ///
    /// The register strategies edit a read or write away from the coarse
    /// injection point; every other kind edits the injected step itself.
    pub fn for_kind(kind: MutationKind) -> KeyPolicy {
        match kind {
            MutationKind::PreExecutionRegister => KeyPolicy::Loose,
            _ => KeyPolicy::Exact,
        }
    }

    /// Canonical key of one failure under this policy.
    pub fn key(&self, failure: &FailureRecord) -> FailureKey {
        FailureKey {
            category: failure.category(),
            location: failure.location_tag(),
            position: match self {
                KeyPolicy::Exact => Some((failure.fine_step, failure.pc)),
                KeyPolicy::Loose => None,
            },
        }
    }
}

impl fmt::Display for KeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPolicy::Exact => f.write_str("exact"),
            KeyPolicy::Loose => f.write_str("loose"),
        }
    }
}

/// Canonical identity of one constraint failure.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FailureKey {
    /// Category of the failing step.
    pub category: Category,
    /// Normalized constraint location.
    pub location: String,
    /// `(fine_step, pc)`, present only under the exact policy.
    pub position: Option<(u64, u32)>,
}

impl fmt::Display for FailureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.category, self.location)?;
        if let Some((fine_step, pc)) = self.position {
            write!(f, " at fine step {fine_step} pc {pc:#010x}")?;
        }
        Ok(())
    }
}

/// Overall outcome of one differential comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// At least one failure is shared.
    Aligned,
    /// Both runs were inspected, nothing is shared.
    Divergent,
    /// Neither run produced a single failure.
    Silent,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Aligned => f.write_str("aligned"),
            Verdict::Divergent => f.write_str("divergent"),
            Verdict::Silent => f.write_str("silent"),
        }
    }
}

/// Partition of two failure sets by canonical key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifferentialReport {
    /// Policy the keys were computed under.
    pub policy: KeyPolicy,
    /// Failures present on both sides, in key order.
    pub common: Vec<FailureKey>,
    /// Failures only the coarse run produced.
    pub coarse_only: Vec<FailureKey>,
    /// Failures only the fine run produced.
    pub fine_only: Vec<FailureKey>,
}

impl DifferentialReport {
    /// Partitions the two failure sets under `policy`.
    ///
    /// Failures collapsing to the same key count once; ordered sets keep
    /// the partition deterministic.
    pub fn compare(
        policy: KeyPolicy,
        coarse: &[FailureRecord],
        fine: &[FailureRecord],
    ) -> DifferentialReport {
        let coarse_keys: BTreeSet<FailureKey> = coarse.iter().map(|f| policy.key(f)).collect();
        let fine_keys: BTreeSet<FailureKey> = fine.iter().map(|f| policy.key(f)).collect();
        DifferentialReport {
            policy,
            common: coarse_keys.intersection(&fine_keys).cloned().collect(),
            coarse_only: coarse_keys.difference(&fine_keys).cloned().collect(),
            fine_only: fine_keys.difference(&coarse_keys).cloned().collect(),
        }
    }

    /// Aligned, divergent, or silent.
    pub fn verdict(&self) -> Verdict {
        if !self.common.is_empty() {
            Verdict::Aligned
        } else if self.coarse_only.is_empty() && self.fine_only.is_empty() {
            Verdict::Silent
        } else {
            Verdict::Divergent
        }
    }

    /// True when at least one failure is shared.
    pub fn is_aligned(&self) -> bool {
        self.verdict() == Verdict::Aligned
    }
}
