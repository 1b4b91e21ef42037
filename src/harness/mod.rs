//! Resumable differential campaign orchestration.

pub mod config;
pub mod events;
/// Human-readable and machine-friendly report generation.
pub mod report;
pub mod runner;
pub mod state;
pub mod subject;

pub use config::HarnessConfig;
pub use events::{
    CampaignEvent, CampaignPlan, CaseOutcome, CasePlan, ComparisonCounts, now_timestamp_ms,
};
pub use report::{CampaignSummary, CaseReport, ReportFormat, render_report};
pub use runner::{
    CampaignResult, CampaignRunError, CaseRunReport, TargetResolution, load_campaign_status,
    render_campaign_report, resolve_target, resume_campaign, run_campaign, run_single_case,
};
pub use state::{CampaignSnapshot, CaseState, CaseStatus};
pub use subject::{Capture, ProcessSubject, Subject, SubjectError, crash_reason};
