use serde::Serialize;

use super::events::CaseOutcome;
use super::state::{CampaignSnapshot, CaseState, CaseStatus};

/// Supported output formats for campaign reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Markdown summary.
    Markdown,
    /// JSON summary with all cases inline.
    Json,
}

/// Per-case report entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseReport {
    /// Case id.
    pub id: String,
    /// Coarse injection step.
    pub inject_step: u64,
    /// Mutation kind tag.
    pub kind: String,
    /// Subject seed.
    pub seed: u64,
    /// Execution status.
    pub status: String,
    /// Skip, crash, or error detail when the outcome carries one.
    pub detail: Option<String>,
    /// Shared failure keys, for comparable cases.
    pub common: Option<usize>,
    /// Coarse-only failure keys.
    pub coarse_only: Option<usize>,
    /// Fine-only failure keys.
    pub fine_only: Option<usize>,
    /// Duration in milliseconds.
    pub duration_ms: Option<u64>,
}

impl From<&CaseState> for CaseReport {
    fn from(state: &CaseState) -> Self {
        let detail = match &state.outcome {
            Some(CaseOutcome::NotApplicable { reason }) => Some(reason.clone()),
            Some(CaseOutcome::Crashed { reason }) => Some(reason.clone()),
            Some(CaseOutcome::Errored { message }) => Some(message.clone()),
            _ => None,
        };
        Self {
            id: state.plan.id.clone(),
            inject_step: state.plan.inject_step,
            kind: state.plan.kind.to_string(),
            seed: state.plan.seed,
            status: status_to_string(&state.status),
            detail,
            common: state.comparison.map(|c| c.common),
            coarse_only: state.comparison.map(|c| c.coarse_only),
            fine_only: state.comparison.map(|c| c.fine_only),
            duration_ms: state.duration_ms,
        }
    }
}

fn status_to_string(status: &CaseStatus) -> String {
    match status {
        CaseStatus::Pending => "pending".to_string(),
        CaseStatus::Running => "running".to_string(),
        CaseStatus::Aligned => "aligned".to_string(),
        CaseStatus::AlignedLoose => "aligned_loose".to_string(),
        CaseStatus::Divergent => "divergent".to_string(),
        CaseStatus::Silent => "silent".to_string(),
        CaseStatus::NotApplicable => "not_applicable".to_string(),
        CaseStatus::Crashed => "crashed".to_string(),
        CaseStatus::Errored => "errored".to_string(),
    }
}

/// Aggregated campaign counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignSummary {
    /// Total planned cases.
    pub total: usize,
    /// Alignment rate over comparable cases, percentage.
    pub alignment_rate: f64,
    /// Cases aligned under the exact key.
    pub aligned: usize,
    /// Cases aligned under the loose key.
    pub aligned_loose: usize,
    /// Divergent cases.
    pub divergent: usize,
    /// Silent cases.
    pub silent: usize,
    /// Cases without a viable target.
    pub not_applicable: usize,
    /// Cases whose run crashed.
    pub crashed: usize,
    /// Cases the pipeline errored on.
    pub errored: usize,
    /// Still pending or running cases.
    pub incomplete: usize,
}

impl CampaignSummary {
    /// Build summary from snapshot.
    pub fn from_snapshot(snapshot: &CampaignSnapshot) -> Self {
        let mut out = Self {
            total: snapshot.cases.len(),
            alignment_rate: 0.0,
            aligned: 0,
            aligned_loose: 0,
            divergent: 0,
            silent: 0,
            not_applicable: 0,
            crashed: 0,
            errored: 0,
            incomplete: 0,
        };

        for case in snapshot.cases.values() {
            match case.status {
                CaseStatus::Aligned => out.aligned += 1,
                CaseStatus::AlignedLoose => out.aligned_loose += 1,
                CaseStatus::Divergent => out.divergent += 1,
                CaseStatus::Silent => out.silent += 1,
                CaseStatus::NotApplicable => out.not_applicable += 1,
                CaseStatus::Crashed => out.crashed += 1,
                CaseStatus::Errored => out.errored += 1,
                CaseStatus::Pending | CaseStatus::Running => out.incomplete += 1,
            }
        }

        let comparable = out.aligned + out.aligned_loose + out.divergent + out.silent;
        if comparable > 0 {
            out.alignment_rate =
                ((out.aligned + out.aligned_loose) as f64) * 100.0 / (comparable as f64);
        } else {
            out.alignment_rate = 100.0;
        }

        out
    }
}

fn case_reports(snapshot: &CampaignSnapshot) -> Vec<CaseReport> {
    let mut states: Vec<&CaseState> = snapshot.cases.values().collect();
    states.sort_by_key(|s| (s.plan.inject_step, s.plan.kind.to_string(), s.plan.seed));
    states.into_iter().map(CaseReport::from).collect()
}

/// Render campaign report in requested format.
pub fn render_report(snapshot: &CampaignSnapshot, format: ReportFormat) -> String {
    let summary = CampaignSummary::from_snapshot(snapshot);
    let cases = case_reports(snapshot);

    match format {
        ReportFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
            "run_id": snapshot.run_id,
            "completed": snapshot.completed,
            "interrupted": snapshot.interrupted,
            "malformed_lines": snapshot.malformed_lines,
            "plan": snapshot.plan,
            "summary": summary,
            "cases": cases,
        }))
        .expect("report JSON should serialize"),
        ReportFormat::Markdown => {
            let mut out = format!("# Differential Campaign {}\n\n", snapshot.run_id);

            out.push_str(&format!(
                "- completed: {}\n- interrupted: {}\n- malformed lines: {}\n\n",
                snapshot.completed, snapshot.interrupted, snapshot.malformed_lines
            ));

            if let Some(ref plan) = snapshot.plan {
                out.push_str("## Plan\n\n");
                let steps: Vec<String> = plan.steps.iter().map(ToString::to_string).collect();
                let kinds: Vec<String> = plan.kinds.iter().map(ToString::to_string).collect();
                out.push_str(&format!("- steps: {}\n", steps.join(", ")));
                out.push_str(&format!("- kinds: {}\n", kinds.join(", ")));
                out.push_str(&format!("- seed: {}\n", plan.seed));
                out.push_str(&format!(
                    "- register strategy: {}\n",
                    plan.register_strategy
                ));
                if let Some(timeout_secs) = plan.timeout_secs {
                    out.push_str(&format!("- timeout hint: {timeout_secs}s\n"));
                }
                out.push_str("\n");
            }

            out.push_str("## Summary\n\n| metric | count |\n|---|---:|\n");
            out.push_str(&format!("| total | {} |\n", summary.total));
            out.push_str(&format!("| aligned | {} |\n", summary.aligned));
            out.push_str(&format!("| aligned_loose | {} |\n", summary.aligned_loose));
            out.push_str(&format!("| divergent | {} |\n", summary.divergent));
            out.push_str(&format!("| silent | {} |\n", summary.silent));
            out.push_str(&format!("| not_applicable | {} |\n", summary.not_applicable));
            out.push_str(&format!("| crashed | {} |\n", summary.crashed));
            out.push_str(&format!("| errored | {} |\n", summary.errored));
            out.push_str(&format!("| incomplete | {} |\n", summary.incomplete));
            out.push_str(&format!(
                "| alignment rate | {:.2}% |\n",
                summary.alignment_rate
            ));

            if !cases.is_empty() {
                out.push_str("\n## Cases\n\n| case | status | comparison | duration |\n|---|---|---|---:|\n");
                for case in &cases {
                    let comparison = match (case.common, case.coarse_only, case.fine_only) {
                        (Some(common), Some(coarse_only), Some(fine_only)) => format!(
                            "{common} common / {coarse_only} coarse-only / {fine_only} fine-only"
                        ),
                        _ => "-".to_string(),
                    };
                    let duration = case
                        .duration_ms
                        .map(|d| format!("{d}ms"))
                        .unwrap_or_else(|| "-".to_string());
                    out.push_str(&format!(
                        "| {} | {} | {} | {} |\n",
                        case.id, case.status, comparison, duration
                    ));
                }
            }

            let detailed: Vec<&CaseReport> =
                cases.iter().filter(|c| c.detail.is_some()).collect();
            if !detailed.is_empty() {
                out.push_str("\n## Details\n\n");
                for case in detailed {
                    out.push_str(&format!("### {}\n\n", case.id));
                    out.push_str(&format!("- **status**: {}\n", case.status));
                    if let Some(ref detail) = case.detail {
                        out.push_str(&format!("- **detail**: {detail}\n"));
                    }
                    out.push_str("\n");
                }
            }

            out
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::harness::events::{CampaignPlan, CasePlan, ComparisonCounts};
    use crate::records::MutationKind;
    use crate::strategy::RegisterStrategy;

    fn case_state(
        step: u64,
        kind: MutationKind,
        status: CaseStatus,
        outcome: Option<CaseOutcome>,
        comparison: Option<ComparisonCounts>,
    ) -> CaseState {
        CaseState {
            plan: CasePlan::new(step, kind, 7),
            status,
            outcome,
            comparison,
            started_at_ms: None,
            finished_at_ms: None,
            duration_ms: Some(1200),
            coarse_artifact_path: None,
            fine_artifact_path: None,
            document_artifact_path: None,
        }
    }

    fn snapshot_with(states: Vec<CaseState>) -> CampaignSnapshot {
        let mut cases = BTreeMap::new();
        for state in states {
            cases.insert(state.plan.id.clone(), state);
        }
        CampaignSnapshot {
            run_id: "run-9".to_string(),
            cases,
            plan: Some(CampaignPlan {
                steps: vec![10, 20, 30, 40],
                kinds: vec![MutationKind::ComputedOutput],
                seed: 7,
                register_strategy: RegisterStrategy::NextRead,
                timeout_secs: Some(120),
            }),
            malformed_lines: 0,
            interrupted: false,
            completed: true,
        }
    }

    #[test]
    fn alignment_rate_is_over_comparable_cases() {
        let snapshot = snapshot_with(vec![
            case_state(
                10,
                MutationKind::ComputedOutput,
                CaseStatus::Aligned,
                Some(CaseOutcome::Aligned),
                Some(ComparisonCounts {
                    common: 2,
                    coarse_only: 0,
                    fine_only: 0,
                }),
            ),
            case_state(
                20,
                MutationKind::PreExecutionRegister,
                CaseStatus::AlignedLoose,
                Some(CaseOutcome::AlignedLoose),
                Some(ComparisonCounts {
                    common: 1,
                    coarse_only: 1,
                    fine_only: 0,
                }),
            ),
            case_state(
                30,
                MutationKind::ComputedOutput,
                CaseStatus::Divergent,
                Some(CaseOutcome::Divergent),
                Some(ComparisonCounts {
                    common: 0,
                    coarse_only: 2,
                    fine_only: 1,
                }),
            ),
            case_state(
                40,
                MutationKind::ComputedOutput,
                CaseStatus::NotApplicable,
                Some(CaseOutcome::NotApplicable {
                    reason: "targeted step is auxiliary".to_string(),
                }),
                None,
            ),
        ]);

        let summary = CampaignSummary::from_snapshot(&snapshot);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.aligned, 1);
        assert_eq!(summary.aligned_loose, 1);
        assert_eq!(summary.divergent, 1);
        assert_eq!(summary.not_applicable, 1);
        // 2 aligned of 3 comparable; the skipped case does not count.
        assert!((summary.alignment_rate - 66.67).abs() < 0.01);
    }

    #[test]
    fn empty_snapshot_rate_is_vacuously_full() {
        let summary = CampaignSummary::from_snapshot(&snapshot_with(Vec::new()));
        assert_eq!(summary.total, 0);
        assert_eq!(summary.alignment_rate, 100.0);
    }

    #[test]
    fn markdown_report_lists_cases_and_details() {
        let snapshot = snapshot_with(vec![
            case_state(
                10,
                MutationKind::ComputedOutput,
                CaseStatus::Aligned,
                Some(CaseOutcome::Aligned),
                Some(ComparisonCounts {
                    common: 2,
                    coarse_only: 0,
                    fine_only: 0,
                }),
            ),
            case_state(
                20,
                MutationKind::ComputedOutput,
                CaseStatus::NotApplicable,
                Some(CaseOutcome::NotApplicable {
                    reason: "no step at pc 0x00001234".to_string(),
                }),
                None,
            ),
        ]);

        let report = render_report(&snapshot, ReportFormat::Markdown);
        assert!(report.contains("# Differential Campaign run-9"));
        assert!(report.contains("| metric | count |"));
        assert!(report.contains("| aligned | 1 |"));
        assert!(report.contains("- steps: 10, 20, 30, 40"));
        assert!(report.contains("- register strategy: next-read"));
        assert!(report.contains("| step10-computed-output-seed7 | aligned | 2 common / 0 coarse-only / 0 fine-only | 1200ms |"));
        assert!(report.contains("### step20-computed-output-seed7"));
        assert!(report.contains("- **detail**: no step at pc 0x00001234"));
    }

    #[test]
    fn json_report_parses_back() {
        let snapshot = snapshot_with(vec![case_state(
            10,
            MutationKind::ComputedOutput,
            CaseStatus::Divergent,
            Some(CaseOutcome::Divergent),
            Some(ComparisonCounts {
                common: 0,
                coarse_only: 1,
                fine_only: 1,
            }),
        )]);

        let report = render_report(&snapshot, ReportFormat::Json);
        let value: serde_json::Value =
            serde_json::from_str(&report).expect("report should be valid JSON");
        assert_eq!(value["run_id"], "run-9");
        assert_eq!(value["summary"]["divergent"], 1);
        assert_eq!(value["cases"][0]["status"], "divergent");
        assert_eq!(value["cases"][0]["coarse_only"], 1);
        assert_eq!(value["plan"]["seed"], 7);
    }

    #[test]
    fn cases_sort_by_injection_step() {
        let snapshot = snapshot_with(vec![
            case_state(
                120,
                MutationKind::ComputedOutput,
                CaseStatus::Pending,
                None,
                None,
            ),
            case_state(
                15,
                MutationKind::ComputedOutput,
                CaseStatus::Pending,
                None,
                None,
            ),
        ]);

        let reports = case_reports(&snapshot);
        assert_eq!(reports[0].inject_step, 15);
        assert_eq!(reports[1].inject_step, 120);
    }
}
