//! Campaign orchestration (new run, resume, status, report).
//!
//! One case is one coarse fault replayed as a fine trace edit: run the
//! coarse layer, resolve the fault against an inspection dump, hand the
//! resulting document to a mutated fine run, and compare the two failure
//! sets. Every transition is appended to `events.jsonl`, so an
//! interrupted campaign picks up where it stopped.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use thiserror::Error;

use crate::compare::{DifferentialReport, KeyPolicy, Verdict};
use crate::correlate::Confidence;
use crate::offset::OffsetEstimator;
use crate::records::{CoarseEvent, ParseError, parse_coarse_trace, parse_failures};
use crate::strategy::{MutationTarget, RegisterStrategy, SynthesisError, strategy_for};
use crate::trace::TraceIndex;

use super::config::HarnessConfig;
use super::events::{
    CampaignEvent, CampaignPlan, CaseOutcome, CasePlan, ComparisonCounts, now_timestamp_ms,
};
use super::report::{ReportFormat, render_report};
use super::state::{CampaignSnapshot, CampaignStateError, append_event, replay_events};
use super::subject::{Capture, Subject, SubjectError, crash_reason};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Campaign orchestration errors.
#[derive(Debug, Error)]
pub enum CampaignRunError {
    /// State layer error.
    #[error("state error: {0}")]
    State(#[from] CampaignStateError),
    /// Subject invocation error.
    #[error("subject error: {0}")]
    Subject(#[from] SubjectError),
    /// Record scraping error.
    #[error("record error: {0}")]
    Parse(#[from] ParseError),
    /// Mutation synthesis error.
    #[error("synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Signal handler error.
    #[error("signal handler installation failed: {0}")]
    Signal(String),
}

/// Result returned by run/resume operations.
#[derive(Debug, Clone)]
pub struct CampaignResult {
    /// Run id.
    pub run_id: String,
    /// Path to the run directory.
    pub run_dir: PathBuf,
    /// Materialized snapshot after the operation.
    pub snapshot: CampaignSnapshot,
}

/// Detailed result of a single-case run.
#[derive(Debug, Clone)]
pub struct CaseRunReport {
    /// The executed case.
    pub case: CasePlan,
    /// Final outcome.
    pub outcome: CaseOutcome,
    /// Resolved mutation target, when synthesis got that far.
    pub target: Option<MutationTarget>,
    /// Full key partition, when a comparison was reached.
    pub comparison: Option<DifferentialReport>,
    /// Path to the run directory holding artifacts and events.
    pub run_dir: PathBuf,
}

/// A coarse fault resolved against an inspection dump.
#[derive(Debug, Clone)]
pub struct TargetResolution {
    /// The parsed coarse fault.
    pub event: CoarseEvent,
    /// The one edit that realizes it.
    pub target: MutationTarget,
}

/// Resolves the fault in `coarse_text` to a mutation target using the
/// inspection dump in `inspection_text`.
///
/// The fault record itself names the mutation kind; `register` only
/// selects between the two pre-execution register strategies.
pub fn resolve_target(
    register: RegisterStrategy,
    coarse_text: &str,
    inspection_text: &str,
) -> Result<TargetResolution, CampaignRunError> {
    let event = CoarseEvent::sole_from_output(coarse_text)?;
    let index = TraceIndex::from_output(inspection_text)?;
    let landmarks = parse_coarse_trace(coarse_text)?;
    let offsets = OffsetEstimator::from_landmarks(&landmarks, &index);
    let strategy = strategy_for(event.kind, register);
    let target = strategy.resolve(&event, &index, &offsets)?;
    Ok(TargetResolution { event, target })
}

fn install_signal_handler_once() -> Result<(), CampaignRunError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();

    let result = INIT.get_or_init(|| {
        ctrlc::set_handler(|| {
            INTERRUPTED.store(true, Ordering::SeqCst);
        })
        .map_err(|e| e.to_string())
    });

    match result {
        Ok(()) => Ok(()),
        Err(msg) => Err(CampaignRunError::Signal(msg.clone())),
    }
}

fn generate_run_id() -> String {
    let seq = RUN_SEQUENCE.fetch_add(1, Ordering::SeqCst);
    format!("camp-{}-{}-{}", now_timestamp_ms(), std::process::id(), seq)
}

fn events_path(run_dir: &Path) -> PathBuf {
    run_dir.join("events.jsonl")
}

#[derive(Debug, Clone, Copy)]
struct RunIdKey {
    timestamp_ms: i64,
    pid: u32,
    sequence: u64,
}

fn parse_run_id_key(run_id: &str) -> Option<RunIdKey> {
    let mut parts = run_id.split('-');
    if parts.next()? != "camp" {
        return None;
    }

    Some(RunIdKey {
        timestamp_ms: parts.next()?.parse().ok()?,
        pid: parts.next()?.parse().ok()?,
        sequence: parts.next()?.parse().ok()?,
    })
}

fn is_newer_run_id(candidate: &RunIdKey, current: &RunIdKey) -> bool {
    candidate.timestamp_ms > current.timestamp_ms
        || (candidate.timestamp_ms == current.timestamp_ms && candidate.pid > current.pid)
        || (candidate.timestamp_ms == current.timestamp_ms
            && candidate.pid == current.pid
            && candidate.sequence > current.sequence)
}

/// A run is only resumable under the exact plan it was created with.
fn is_snapshot_compatible(snapshot: &CampaignSnapshot, plan: &CampaignPlan) -> bool {
    snapshot.plan.as_ref() == Some(plan)
}

fn latest_incomplete_run_id(
    config: &HarnessConfig,
    plan: &CampaignPlan,
) -> Result<Option<String>, CampaignRunError> {
    if !config.run_root.exists() {
        return Ok(None);
    }

    let mut newest: Option<(RunIdKey, String)> = None;

    for entry in std::fs::read_dir(&config.run_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let run_id = entry.file_name().to_string_lossy().to_string();
        let run_id_key = match parse_run_id_key(&run_id) {
            Some(key) => key,
            None => continue,
        };

        let snapshot = match load_campaign_status(config, &run_id) {
            Ok(snapshot) => snapshot,
            Err(CampaignRunError::State(_)) => continue,
            Err(err) => return Err(err),
        };

        if snapshot.completed || snapshot.pending_cases().is_empty() {
            continue;
        }

        if !is_snapshot_compatible(&snapshot, plan) {
            continue;
        }

        let is_newer = match &newest {
            Some((current, _)) => is_newer_run_id(&run_id_key, current),
            None => true,
        };

        if is_newer {
            newest = Some((run_id_key, run_id));
        }
    }

    Ok(newest.map(|(_, run_id)| run_id))
}

/// Everything one case produced, terminal outcome included.
#[derive(Debug, Clone)]
struct CaseExecution {
    outcome: CaseOutcome,
    comparison: Option<DifferentialReport>,
    target: Option<MutationTarget>,
    coarse: Option<Capture>,
    fine: Option<Capture>,
    document_artifact_path: Option<String>,
}

impl CaseExecution {
    fn from_outcome(outcome: CaseOutcome) -> Self {
        CaseExecution {
            outcome,
            comparison: None,
            target: None,
            coarse: None,
            fine: None,
            document_artifact_path: None,
        }
    }
}

/// Skip reason for synthesis failures, with the control-transfer caveat
/// spelled out where it applies.
fn skip_reason(err: &SynthesisError) -> String {
    match err {
        SynthesisError::Correlation(failure) if failure.expected_control_transfer() => {
            format!(
                "{failure}; control transfers retire at their target, not at the fall-through pc"
            )
        }
        other => other.to_string(),
    }
}

fn write_document(
    run_dir: &Path,
    case: &CasePlan,
    target: &MutationTarget,
) -> Result<(PathBuf, String), CampaignRunError> {
    let base = run_dir.join("artifacts");
    std::fs::create_dir_all(&base)?;
    let file_name = format!("{}.document.json", case.id);
    let path = base.join(&file_name);
    let json = serde_json::to_string_pretty(&target.document())
        .expect("mutation documents should serialize");
    std::fs::write(&path, json)?;
    Ok((path, format!("artifacts/{file_name}")))
}

fn write_case_artifacts(
    run_dir: &Path,
    case_id: &str,
    execution: &CaseExecution,
) -> Result<(Option<String>, Option<String>), CampaignRunError> {
    let base = run_dir.join("artifacts");
    std::fs::create_dir_all(&base)?;

    let mut coarse_artifact_path = None;
    let mut fine_artifact_path = None;

    if let Some(coarse) = &execution.coarse {
        let text = coarse.text();
        if !text.is_empty() {
            let name = format!("{case_id}.coarse.log");
            std::fs::write(base.join(&name), text)?;
            coarse_artifact_path = Some(format!("artifacts/{name}"));
        }
    }

    if let Some(fine) = &execution.fine {
        let text = fine.text();
        if !text.is_empty() {
            let name = format!("{case_id}.fine.log");
            std::fs::write(base.join(&name), text)?;
            fine_artifact_path = Some(format!("artifacts/{name}"));
        }
    }

    Ok((coarse_artifact_path, fine_artifact_path))
}

/// Runs the full pipeline for one case and classifies the result.
///
/// Subject failures, unusable records, and unviable targets become case
/// outcomes rather than errors; only the harness's own IO propagates.
fn execute_case(
    subject: &dyn Subject,
    register: RegisterStrategy,
    case: &CasePlan,
    run_dir: &Path,
) -> Result<CaseExecution, CampaignRunError> {
    let coarse = match subject.run_coarse(case) {
        Ok(capture) => capture,
        Err(err) => {
            return Ok(CaseExecution::from_outcome(CaseOutcome::Errored {
                message: format!("coarse run failed: {err}"),
            }));
        }
    };
    let coarse_text = coarse.text();

    let inspection = match subject.run_inspection(case, None) {
        Ok(capture) => capture,
        Err(err) => {
            return Ok(CaseExecution {
                coarse: Some(coarse),
                ..CaseExecution::from_outcome(CaseOutcome::Errored {
                    message: format!("inspection run failed: {err}"),
                })
            });
        }
    };
    let inspection_text = inspection.text();

    let resolution = match resolve_target(register, &coarse_text, &inspection_text) {
        Ok(resolution) => resolution,
        Err(CampaignRunError::Synthesis(err)) => {
            return Ok(CaseExecution {
                coarse: Some(coarse),
                ..CaseExecution::from_outcome(CaseOutcome::NotApplicable {
                    reason: skip_reason(&err),
                })
            });
        }
        Err(CampaignRunError::Parse(err)) => {
            // A run that died mid-flight leaves truncated records behind;
            // report the crash, not the parse fallout.
            let crashed = crash_reason(&coarse_text)
                .map(|reason| format!("coarse: {reason}"))
                .or_else(|| crash_reason(&inspection_text).map(|reason| format!("fine: {reason}")));
            let outcome = match crashed {
                Some(reason) => CaseOutcome::Crashed { reason },
                None => CaseOutcome::Errored {
                    message: err.to_string(),
                },
            };
            return Ok(CaseExecution {
                coarse: Some(coarse),
                ..CaseExecution::from_outcome(outcome)
            });
        }
        Err(err) => return Err(err),
    };
    let target = resolution.target;

    if let Confidence::Disambiguated { candidates, .. } = target.correlation.confidence {
        println!(
            "tracegraft: {}: {candidates} candidate step(s) at the expected pc, drift heuristic picked fine step {}",
            case.id, target.correlation.fine_step
        );
    }

    let (document_path, document_artifact_path) = write_document(run_dir, case, &target)?;

    let fine = match subject.run_mutation(case, &document_path) {
        Ok(capture) => capture,
        Err(err) => {
            return Ok(CaseExecution {
                coarse: Some(coarse),
                target: Some(target),
                document_artifact_path: Some(document_artifact_path),
                ..CaseExecution::from_outcome(CaseOutcome::Errored {
                    message: format!("mutation run failed: {err}"),
                })
            });
        }
    };
    let fine_text = fine.text();

    let failed = |message: String| CaseExecution {
        coarse: Some(coarse.clone()),
        fine: Some(fine.clone()),
        target: Some(target),
        document_artifact_path: Some(document_artifact_path.clone()),
        ..CaseExecution::from_outcome(CaseOutcome::Errored { message })
    };

    let coarse_failures = match parse_failures(&coarse_text) {
        Ok(failures) => failures,
        Err(err) => return Ok(failed(format!("coarse failure records: {err}"))),
    };
    let fine_failures = match parse_failures(&fine_text) {
        Ok(failures) => failures,
        Err(err) => return Ok(failed(format!("fine failure records: {err}"))),
    };

    // Zero failure records from a run that logged a crash marker means
    // the guest died instead of tripping constraints.
    let crashed = if coarse_failures.is_empty() {
        crash_reason(&coarse_text).map(|reason| format!("coarse: {reason}"))
    } else {
        None
    };
    let crashed = crashed.or_else(|| {
        if fine_failures.is_empty() {
            crash_reason(&fine_text).map(|reason| format!("fine: {reason}"))
        } else {
            None
        }
    });
    if let Some(reason) = crashed {
        return Ok(CaseExecution {
            coarse: Some(coarse),
            fine: Some(fine),
            target: Some(target),
            document_artifact_path: Some(document_artifact_path),
            ..CaseExecution::from_outcome(CaseOutcome::Crashed { reason })
        });
    }

    let policy = KeyPolicy::for_kind(target.kind);
    let report = DifferentialReport::compare(policy, &coarse_failures, &fine_failures);
    let outcome = match report.verdict() {
        Verdict::Aligned if policy == KeyPolicy::Loose => CaseOutcome::AlignedLoose,
        Verdict::Aligned => CaseOutcome::Aligned,
        Verdict::Divergent => CaseOutcome::Divergent,
        Verdict::Silent => CaseOutcome::Silent,
    };

    Ok(CaseExecution {
        outcome,
        comparison: Some(report),
        target: Some(target),
        coarse: Some(coarse),
        fine: Some(fine),
        document_artifact_path: Some(document_artifact_path),
    })
}

fn run_case(
    run_id: &str,
    run_dir: &Path,
    events: &Path,
    subject: &dyn Subject,
    register: RegisterStrategy,
    case: &CasePlan,
) -> Result<CaseExecution, CampaignRunError> {
    let started_at_ms = now_timestamp_ms();
    append_event(
        events,
        &CampaignEvent::CaseStarted {
            run_id: run_id.to_string(),
            timestamp_ms: started_at_ms,
            case_id: case.id.clone(),
        },
    )?;

    let started = Instant::now();
    let execution = execute_case(subject, register, case, run_dir)?;

    let finished_at_ms = now_timestamp_ms();
    let duration_ms = started.elapsed().as_millis() as u64;
    let (coarse_artifact_path, fine_artifact_path) =
        write_case_artifacts(run_dir, &case.id, &execution)?;

    append_event(
        events,
        &CampaignEvent::CaseFinished {
            run_id: run_id.to_string(),
            timestamp_ms: finished_at_ms,
            case_id: case.id.clone(),
            outcome: execution.outcome.clone(),
            comparison: execution.comparison.as_ref().map(ComparisonCounts::from),
            coarse_artifact_path,
            fine_artifact_path,
            document_artifact_path: execution.document_artifact_path.clone(),
            started_at_ms: Some(started_at_ms),
            finished_at_ms: Some(finished_at_ms),
            duration_ms: Some(duration_ms),
        },
    )?;

    Ok(execution)
}

/// Start a new campaign, resuming a compatible interrupted one first.
pub fn run_campaign(
    config: &HarnessConfig,
    plan: &CampaignPlan,
    subject: &dyn Subject,
) -> Result<CampaignResult, CampaignRunError> {
    install_signal_handler_once()?;
    INTERRUPTED.store(false, Ordering::SeqCst);

    if let Some(run_id) = latest_incomplete_run_id(config, plan)? {
        println!("tracegraft: resuming interrupted campaign {run_id}");
        return resume_campaign(config, &run_id, subject);
    }

    let run_id = generate_run_id();
    let run_dir = config.run_root.join(&run_id);
    std::fs::create_dir_all(&run_dir)?;
    let events = events_path(&run_dir);

    let cases = plan.cases();
    println!(
        "tracegraft: planned {} case(s) against {}",
        cases.len(),
        config.subject.display()
    );

    append_event(
        &events,
        &CampaignEvent::CampaignStarted {
            run_id: run_id.clone(),
            timestamp_ms: now_timestamp_ms(),
            planned: cases.len(),
            plan: Some(plan.clone()),
        },
    )?;

    for case in &cases {
        append_event(
            &events,
            &CampaignEvent::CasePlanned {
                run_id: run_id.clone(),
                timestamp_ms: now_timestamp_ms(),
                case: case.clone(),
            },
        )?;
    }

    let total_cases = cases.len();
    for (index, case) in cases.iter().enumerate() {
        let position = index + 1;
        println!("tracegraft: running case {position}/{total_cases}: {}", case.id);
        if INTERRUPTED.load(Ordering::SeqCst) {
            append_event(
                &events,
                &CampaignEvent::CampaignInterrupted {
                    run_id: run_id.clone(),
                    timestamp_ms: now_timestamp_ms(),
                    reason: "received interrupt signal".to_string(),
                },
            )?;
            break;
        }
        run_case(
            &run_id,
            &run_dir,
            &events,
            subject,
            plan.register_strategy,
            case,
        )?;
    }

    if !INTERRUPTED.load(Ordering::SeqCst) {
        append_event(
            &events,
            &CampaignEvent::CampaignCompleted {
                run_id: run_id.clone(),
                timestamp_ms: now_timestamp_ms(),
            },
        )?;
    }

    let snapshot = replay_events(&events)?;
    Ok(CampaignResult {
        run_id,
        run_dir,
        snapshot,
    })
}

/// Resume an existing campaign by run id.
pub fn resume_campaign(
    config: &HarnessConfig,
    run_id: &str,
    subject: &dyn Subject,
) -> Result<CampaignResult, CampaignRunError> {
    install_signal_handler_once()?;
    INTERRUPTED.store(false, Ordering::SeqCst);

    let run_dir = config.run_root.join(run_id);
    let events = events_path(&run_dir);
    let snapshot = replay_events(&events)?;
    let pending = snapshot.pending_cases();

    if snapshot.completed {
        println!("tracegraft: campaign {run_id} already completed");
        return Ok(CampaignResult {
            run_id: run_id.to_string(),
            run_dir,
            snapshot,
        });
    }

    println!(
        "tracegraft: resuming campaign {run_id}, {} case(s) remaining",
        pending.len()
    );

    append_event(
        &events,
        &CampaignEvent::CampaignResumed {
            run_id: run_id.to_string(),
            timestamp_ms: now_timestamp_ms(),
            remaining: pending.len(),
        },
    )?;

    // The recorded plan's register strategy is authoritative; the config's
    // only covers legacy logs that predate plan recording.
    let register = snapshot
        .plan
        .as_ref()
        .map(|plan| plan.register_strategy)
        .unwrap_or(config.register_strategy);

    let total_cases = pending.len();
    for (index, case) in pending.iter().enumerate() {
        let position = index + 1;
        println!("tracegraft: running case {position}/{total_cases}: {}", case.id);
        if INTERRUPTED.load(Ordering::SeqCst) {
            append_event(
                &events,
                &CampaignEvent::CampaignInterrupted {
                    run_id: run_id.to_string(),
                    timestamp_ms: now_timestamp_ms(),
                    reason: "received interrupt signal during resume".to_string(),
                },
            )?;
            break;
        }
        run_case(run_id, &run_dir, &events, subject, register, case)?;
    }

    if !INTERRUPTED.load(Ordering::SeqCst) {
        append_event(
            &events,
            &CampaignEvent::CampaignCompleted {
                run_id: run_id.to_string(),
                timestamp_ms: now_timestamp_ms(),
            },
        )?;
    }

    let snapshot = replay_events(&events)?;
    Ok(CampaignResult {
        run_id: run_id.to_string(),
        run_dir,
        snapshot,
    })
}

/// Run one case in its own run directory and return its full detail.
///
/// The run's event log records no plan, so `run_campaign` never picks a
/// single-case run up for auto-resume. No interrupt handler is installed;
/// a lone case is expected to be killed, not checkpointed.
pub fn run_single_case(
    config: &HarnessConfig,
    case: &CasePlan,
    subject: &dyn Subject,
) -> Result<CaseRunReport, CampaignRunError> {
    let run_id = generate_run_id();
    let run_dir = config.run_root.join(&run_id);
    std::fs::create_dir_all(&run_dir)?;
    let events = events_path(&run_dir);

    append_event(
        &events,
        &CampaignEvent::CampaignStarted {
            run_id: run_id.clone(),
            timestamp_ms: now_timestamp_ms(),
            planned: 1,
            plan: None,
        },
    )?;
    append_event(
        &events,
        &CampaignEvent::CasePlanned {
            run_id: run_id.clone(),
            timestamp_ms: now_timestamp_ms(),
            case: case.clone(),
        },
    )?;

    let execution = run_case(
        &run_id,
        &run_dir,
        &events,
        subject,
        config.register_strategy,
        case,
    )?;

    append_event(
        &events,
        &CampaignEvent::CampaignCompleted {
            run_id: run_id.clone(),
            timestamp_ms: now_timestamp_ms(),
        },
    )?;

    Ok(CaseRunReport {
        case: case.clone(),
        outcome: execution.outcome,
        target: execution.target,
        comparison: execution.comparison,
        run_dir,
    })
}

/// Load a campaign status snapshot.
pub fn load_campaign_status(
    config: &HarnessConfig,
    run_id: &str,
) -> Result<CampaignSnapshot, CampaignRunError> {
    let events = events_path(&config.run_root.join(run_id));
    Ok(replay_events(&events)?)
}

/// Render a campaign report.
pub fn render_campaign_report(
    config: &HarnessConfig,
    run_id: &str,
    format: ReportFormat,
) -> Result<String, CampaignRunError> {
    let snapshot = load_campaign_status(config, run_id)?;
    Ok(render_report(&snapshot, format))
}
