//! Event replay and campaign-state projection.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use thiserror::Error;

use super::events::{CampaignEvent, CampaignPlan, CaseOutcome, CasePlan, ComparisonCounts};

/// Status derived from the event stream for each case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseStatus {
    /// Planned and not started.
    Pending,
    /// Started but no terminal outcome yet.
    Running,
    /// Terminal: aligned under the exact key.
    Aligned,
    /// Terminal: aligned under the loose key.
    AlignedLoose,
    /// Terminal: divergent.
    Divergent,
    /// Terminal: silent.
    Silent,
    /// Terminal: skipped for lack of a viable target.
    NotApplicable,
    /// Terminal: a run crashed.
    Crashed,
    /// Terminal: pipeline error.
    Errored,
}

impl CaseStatus {
    /// True if status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Per-case state in a replay snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseState {
    /// Planned case.
    pub plan: CasePlan,
    /// Derived status.
    pub status: CaseStatus,
    /// Terminal outcome, carrying any skip or error detail.
    pub outcome: Option<CaseOutcome>,
    /// Partition sizes when a comparison was reached.
    pub comparison: Option<ComparisonCounts>,
    /// Case execution start timestamp.
    pub started_at_ms: Option<i64>,
    /// Case execution finish timestamp.
    pub finished_at_ms: Option<i64>,
    /// Duration in milliseconds.
    pub duration_ms: Option<u64>,
    /// Relative path to the coarse log artifact.
    pub coarse_artifact_path: Option<String>,
    /// Relative path to the fine log artifact.
    pub fine_artifact_path: Option<String>,
    /// Relative path to the mutation document artifact.
    pub document_artifact_path: Option<String>,
}

/// Materialized campaign state derived from `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignSnapshot {
    /// Run id.
    pub run_id: String,
    /// Cases by id.
    pub cases: BTreeMap<String, CaseState>,
    /// Plan recorded at campaign start.
    pub plan: Option<CampaignPlan>,
    /// Number of malformed event lines ignored.
    pub malformed_lines: usize,
    /// Whether any interruption event has occurred.
    pub interrupted: bool,
    /// Whether a completion event has occurred.
    pub completed: bool,
}

impl CampaignSnapshot {
    /// Collect remaining cases to execute.
    pub fn pending_cases(&self) -> Vec<CasePlan> {
        self.cases
            .values()
            .filter(|c| !c.status.is_terminal())
            .map(|c| c.plan.clone())
            .collect()
    }

    /// Collect cases whose failure sets did not align.
    pub fn divergent_cases(&self) -> Vec<CasePlan> {
        self.cases
            .values()
            .filter(|c| c.status == CaseStatus::Divergent)
            .map(|c| c.plan.clone())
            .collect()
    }
}

/// State replay errors.
#[derive(Debug, Error)]
pub enum CampaignStateError {
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn status_of(outcome: &CaseOutcome) -> CaseStatus {
    match outcome {
        CaseOutcome::Aligned => CaseStatus::Aligned,
        CaseOutcome::AlignedLoose => CaseStatus::AlignedLoose,
        CaseOutcome::Divergent => CaseStatus::Divergent,
        CaseOutcome::Silent => CaseStatus::Silent,
        CaseOutcome::NotApplicable { .. } => CaseStatus::NotApplicable,
        CaseOutcome::Crashed { .. } => CaseStatus::Crashed,
        CaseOutcome::Errored { .. } => CaseStatus::Errored,
    }
}

/// Replay event log from `events.jsonl` into a snapshot.
pub fn replay_events(events_path: &Path) -> Result<CampaignSnapshot, CampaignStateError> {
    let file = std::fs::File::open(events_path)?;
    let reader = BufReader::new(file);

    let mut run_id = String::new();
    let mut cases: BTreeMap<String, CaseState> = BTreeMap::new();
    let mut plan = None;
    let mut malformed_lines = 0;
    let mut interrupted = false;
    let mut completed = false;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let event = match serde_json::from_str::<CampaignEvent>(&line) {
            Ok(event) => event,
            Err(_) => {
                malformed_lines += 1;
                continue;
            }
        };

        match event {
            CampaignEvent::CampaignStarted {
                run_id: id,
                plan: recorded,
                ..
            } => {
                if run_id.is_empty() {
                    run_id = id;
                }
                if plan.is_none() {
                    plan = recorded;
                }
            }
            CampaignEvent::CampaignResumed { run_id: id, .. } => {
                if run_id.is_empty() {
                    run_id = id;
                }
            }
            CampaignEvent::CasePlanned { case, .. } => {
                cases.insert(
                    case.id.clone(),
                    CaseState {
                        plan: case,
                        status: CaseStatus::Pending,
                        outcome: None,
                        comparison: None,
                        started_at_ms: None,
                        finished_at_ms: None,
                        duration_ms: None,
                        coarse_artifact_path: None,
                        fine_artifact_path: None,
                        document_artifact_path: None,
                    },
                );
            }
            CampaignEvent::CaseStarted {
                case_id,
                timestamp_ms,
                ..
            } => {
                if let Some(state) = cases.get_mut(&case_id) {
                    state.status = CaseStatus::Running;
                    state.started_at_ms = Some(timestamp_ms);
                }
            }
            CampaignEvent::CaseFinished {
                case_id,
                timestamp_ms,
                outcome,
                comparison,
                coarse_artifact_path,
                fine_artifact_path,
                document_artifact_path,
                started_at_ms,
                finished_at_ms: _,
                duration_ms,
                ..
            } => {
                if let Some(state) = cases.get_mut(&case_id) {
                    state.finished_at_ms = Some(timestamp_ms);
                    state.started_at_ms = started_at_ms.or(state.started_at_ms);
                    state.duration_ms = duration_ms.or_else(|| {
                        state
                            .started_at_ms
                            .zip(state.finished_at_ms)
                            .and_then(|(start, finish)| {
                                finish
                                    .checked_sub(start)
                                    .and_then(|delta| u64::try_from(delta).ok())
                            })
                    });
                    state.comparison = comparison;
                    state.coarse_artifact_path = coarse_artifact_path;
                    state.fine_artifact_path = fine_artifact_path;
                    state.document_artifact_path = document_artifact_path;
                    state.status = status_of(&outcome);
                    state.outcome = Some(outcome);
                }
            }
            CampaignEvent::CampaignInterrupted { .. } => {
                interrupted = true;
            }
            CampaignEvent::CampaignCompleted { .. } => {
                completed = true;
            }
        }
    }

    Ok(CampaignSnapshot {
        run_id,
        cases,
        plan,
        malformed_lines,
        interrupted,
        completed,
    })
}

/// Append one event as a JSONL line.
pub fn append_event(
    events_path: &Path,
    event: &CampaignEvent,
) -> Result<(), CampaignStateError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(events_path)?;
    let json = serde_json::to_string(event).expect("campaign events should serialize");
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()?;
    Ok(())
}
