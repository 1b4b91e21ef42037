//! Drift estimation between the coarse and fine step counters.
//!
//! The coarse counter ticks on every attempted instruction; the fine
//! counter only on retirement, and the fine trace carries auxiliary cycles
//! with no coarse counterpart. The difference grows over a run, so a single
//! global median over shared landmarks is only a disambiguation aid, never
//! ground truth.

use std::collections::BTreeMap;

use crate::records::CoarseTraceRecord;
use crate::trace::TraceIndex;

/// Landmark pair: the first visit of one address seen by both layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSample {
    /// Address shared by both traces.
    pub pc: u32,
    /// First coarse step at that address.
    pub coarse_step: u64,
    /// First fine retirement step at that address.
    pub fine_step: u64,
}

impl OffsetSample {
    /// Coarse-minus-fine drift at this landmark.
    pub fn offset(&self) -> i64 {
        self.coarse_step as i64 - self.fine_step as i64
    }
}

/// Median drift correction fitted from landmark samples.
#[derive(Debug, Clone, Default)]
pub struct OffsetEstimator {
    samples: Vec<OffsetSample>,
    median: Option<i64>,
}

impl OffsetEstimator {
    /// Collects first-occurrence landmarks from a coarse trace and a fine
    /// index (retirement steps only) and fits the median offset.
    pub fn from_landmarks(coarse: &[CoarseTraceRecord], index: &TraceIndex) -> OffsetEstimator {
        let mut coarse_first: BTreeMap<u32, u64> = BTreeMap::new();
        for record in coarse {
            coarse_first.entry(record.pc).or_insert(record.step);
        }
        let mut fine_first: BTreeMap<u32, u64> = BTreeMap::new();
        for step in index.steps() {
            if step.auxiliary {
                continue;
            }
            fine_first.entry(step.pc).or_insert(step.fine_step);
        }
        let samples = coarse_first
            .iter()
            .filter_map(|(pc, coarse_step)| {
                fine_first.get(pc).map(|fine_step| OffsetSample {
                    pc: *pc,
                    coarse_step: *coarse_step,
                    fine_step: *fine_step,
                })
            })
            .collect();
        OffsetEstimator::from_samples(samples)
    }

    /// Fits the median offset over explicit samples.
    pub fn from_samples(samples: Vec<OffsetSample>) -> OffsetEstimator {
        let mut offsets: Vec<i64> = samples.iter().map(OffsetSample::offset).collect();
        offsets.sort_unstable();
        let median = if offsets.is_empty() {
            None
        } else {
            Some(offsets[offsets.len() / 2])
        };
        OffsetEstimator { samples, median }
    }

    /// The fitted correction, absent when the layers share no landmark.
    pub fn estimate(&self) -> Option<i64> {
        self.median
    }

    /// The landmark samples backing the estimate.
    pub fn samples(&self) -> &[OffsetSample] {
        &self.samples
    }
}
