//! Event model for append-only campaign logs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::compare::DifferentialReport;
use crate::records::MutationKind;
use crate::strategy::RegisterStrategy;

/// One planned injection case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasePlan {
    /// Stable identifier, unique within a campaign.
    pub id: String,
    /// Coarse step the fault is injected at.
    pub inject_step: u64,
    /// Mutation kind under test.
    pub kind: MutationKind,
    /// Subject seed.
    pub seed: u64,
}

impl CasePlan {
    /// Builds the case for one `(step, kind, seed)` combination.
    ///
    /// The id is filesystem-safe and doubles as the artifact stem.
    pub fn new(inject_step: u64, kind: MutationKind, seed: u64) -> Self {
        Self {
            id: format!("step{inject_step}-{kind}-seed{seed}"),
            inject_step,
            kind,
            seed,
        }
    }
}

/// Plan parameters recorded at campaign start.
///
/// A later invocation resumes an interrupted campaign only when its own
/// plan is equal to the recorded one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignPlan {
    /// Coarse injection steps, one case per step and kind.
    pub steps: Vec<u64>,
    /// Mutation kinds under test.
    pub kinds: Vec<MutationKind>,
    /// Subject seed shared by every case.
    pub seed: u64,
    /// Register-fault targeting.
    pub register_strategy: RegisterStrategy,
    /// Timeout hint in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CampaignPlan {
    /// Expands the plan into its cases, steps outermost.
    pub fn cases(&self) -> Vec<CasePlan> {
        let mut cases = Vec::with_capacity(self.steps.len() * self.kinds.len());
        for &step in &self.steps {
            for &kind in &self.kinds {
                cases.push(CasePlan::new(step, kind, self.seed));
            }
        }
        cases
    }
}

/// Outcome of one differential case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseOutcome {
    /// Both layers reported a shared failure under the exact key.
    Aligned,
    /// Failure sets matched under the loose register-fault key.
    AlignedLoose,
    /// Both layers failed, nothing shared.
    Divergent,
    /// Neither layer reported a single failure.
    Silent,
    /// No viable mutation target for this case.
    NotApplicable {
        /// Precise skip reason surfaced in reports.
        reason: String,
    },
    /// A run died instead of reporting constraint failures.
    Crashed {
        /// First crash marker line, prefixed with the side it came from.
        reason: String,
    },
    /// The pipeline failed before a comparison was possible.
    Errored {
        /// Human-readable error detail.
        message: String,
    },
}

impl fmt::Display for CaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseOutcome::Aligned => f.write_str("aligned"),
            CaseOutcome::AlignedLoose => f.write_str("aligned (loose)"),
            CaseOutcome::Divergent => f.write_str("divergent"),
            CaseOutcome::Silent => f.write_str("silent"),
            CaseOutcome::NotApplicable { reason } => write!(f, "not applicable: {reason}"),
            CaseOutcome::Crashed { reason } => write!(f, "crashed: {reason}"),
            CaseOutcome::Errored { message } => write!(f, "errored: {message}"),
        }
    }
}

/// Failure-set partition sizes recorded for a comparable case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonCounts {
    /// Failure keys present on both sides.
    pub common: usize,
    /// Keys only the coarse run produced.
    pub coarse_only: usize,
    /// Keys only the fine run produced.
    pub fine_only: usize,
}

impl From<&DifferentialReport> for ComparisonCounts {
    fn from(report: &DifferentialReport) -> Self {
        Self {
            common: report.common.len(),
            coarse_only: report.coarse_only.len(),
            fine_only: report.fine_only.len(),
        }
    }
}

impl fmt::Display for ComparisonCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} common / {} coarse-only / {} fine-only",
            self.common, self.coarse_only, self.fine_only
        )
    }
}

/// Log event emitted during campaign orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CampaignEvent {
    /// New campaign created.
    CampaignStarted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Number of planned cases.
        planned: usize,
        /// Plan parameters for resume compatibility.
        #[serde(default)]
        plan: Option<CampaignPlan>,
    },
    /// Existing campaign resumed.
    CampaignResumed {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Number of remaining cases before resume.
        remaining: usize,
    },
    /// Case known for this campaign.
    CasePlanned {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Planned case.
        case: CasePlan,
    },
    /// Case execution started.
    CaseStarted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Case id.
        case_id: String,
    },
    /// Case execution finished.
    CaseFinished {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Case id.
        case_id: String,
        /// Final outcome.
        outcome: CaseOutcome,
        /// Partition sizes when a comparison was reached.
        #[serde(default)]
        comparison: Option<ComparisonCounts>,
        /// Optional relative coarse log artifact path.
        #[serde(default)]
        coarse_artifact_path: Option<String>,
        /// Optional relative fine log artifact path.
        #[serde(default)]
        fine_artifact_path: Option<String>,
        /// Optional relative mutation document artifact path.
        #[serde(default)]
        document_artifact_path: Option<String>,
        /// Optional start timestamp.
        #[serde(default)]
        started_at_ms: Option<i64>,
        /// Optional finish timestamp.
        #[serde(default)]
        finished_at_ms: Option<i64>,
        /// Optional runtime in milliseconds.
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    /// Campaign interrupted by signal or operator.
    CampaignInterrupted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Free-form reason.
        reason: String,
    },
    /// Campaign completed terminally.
    CampaignCompleted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
    },
}

/// Current unix timestamp in milliseconds.
pub fn now_timestamp_ms() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_else(|_| std::time::Duration::from_secs(0));
    (duration.as_secs() as i64)
        .saturating_mul(1000)
        .saturating_add(duration.subsec_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_expand_steps_outermost() {
        let plan = CampaignPlan {
            steps: vec![10, 20],
            kinds: vec![MutationKind::ComputedOutput, MutationKind::StoredOutput],
            seed: 7,
            register_strategy: RegisterStrategy::NextRead,
            timeout_secs: None,
        };

        let ids: Vec<String> = plan.cases().into_iter().map(|c| c.id).collect();
        assert_eq!(
            ids,
            vec![
                "step10-computed-output-seed7",
                "step10-stored-output-seed7",
                "step20-computed-output-seed7",
                "step20-stored-output-seed7",
            ]
        );
    }

    #[test]
    fn case_ids_are_filesystem_safe() {
        let case = CasePlan::new(512, MutationKind::PreExecutionRegister, 3);
        assert!(
            case.id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        );
    }

    #[test]
    fn events_tag_by_snake_case_name() {
        let event = CampaignEvent::CaseFinished {
            run_id: "run-1".to_string(),
            timestamp_ms: 5,
            case_id: "step10-computed-output-seed7".to_string(),
            outcome: CaseOutcome::NotApplicable {
                reason: "no step at pc".to_string(),
            },
            comparison: None,
            coarse_artifact_path: None,
            fine_artifact_path: None,
            document_artifact_path: None,
            started_at_ms: None,
            finished_at_ms: None,
            duration_ms: None,
        };

        let json = serde_json::to_string(&event).expect("event should serialize");
        assert!(json.contains("\"event\":\"case_finished\""));
        assert!(json.contains("\"not_applicable\""));

        let back: CampaignEvent = serde_json::from_str(&json).expect("event should deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn outcome_display_carries_reasons() {
        let outcome = CaseOutcome::Crashed {
            reason: "fine: Guest panicked: overflow".to_string(),
        };
        assert_eq!(outcome.to_string(), "crashed: fine: Guest panicked: overflow");
        assert_eq!(CaseOutcome::AlignedLoose.to_string(), "aligned (loose)");
    }
}
