use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use tracegraft::correlate::Confidence;
use tracegraft::harness::{
    CampaignPlan, CampaignSummary, CasePlan, ComparisonCounts, HarnessConfig, ProcessSubject,
    ReportFormat, load_campaign_status, render_campaign_report, resolve_target, resume_campaign,
    run_campaign, run_single_case,
};
use tracegraft::records::MutationKind;
use tracegraft::strategy::{MutationTarget, RegisterStrategy, TraceEdit};

#[derive(Debug, Parser)]
#[command(name = "tracegraft")]
#[command(about = "Differential fault-targeting campaigns against a witness-checked subject")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a campaign over a plan of cases. If an incomplete interrupted
    /// campaign with the same plan exists, it resumes automatically.
    Campaign {
        /// Subject binary carrying both instrumentation layers.
        #[arg(long)]
        subject: PathBuf,
        /// Argument passed to the subject ahead of mode flags; repeatable.
        #[arg(long = "subject-arg")]
        subject_args: Vec<String>,
        /// Run root directory.
        #[arg(long)]
        run_root: Option<PathBuf>,
        /// Coarse injection steps, comma separated.
        #[arg(long, value_delimiter = ',', required = true)]
        steps: Vec<u64>,
        /// Mutation kinds, comma separated.
        #[arg(long, value_enum, value_delimiter = ',', required = true)]
        kinds: Vec<KindArg>,
        /// Subject seed.
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Target selection for pre-execution register faults.
        #[arg(long, value_enum, default_value = "next-read")]
        register_strategy: StrategyArg,
        /// Optional timeout hint in seconds, exported to the subject.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Resume an existing campaign by run id.
    Resume {
        /// Existing run id.
        run_id: String,
        /// Subject binary carrying both instrumentation layers.
        #[arg(long)]
        subject: PathBuf,
        /// Argument passed to the subject ahead of mode flags; repeatable.
        #[arg(long = "subject-arg")]
        subject_args: Vec<String>,
        /// Run root directory.
        #[arg(long)]
        run_root: Option<PathBuf>,
        /// Optional timeout hint in seconds, exported to the subject.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Run a single case end to end and print the comparison.
    Compare {
        /// Subject binary carrying both instrumentation layers.
        #[arg(long)]
        subject: PathBuf,
        /// Argument passed to the subject ahead of mode flags; repeatable.
        #[arg(long = "subject-arg")]
        subject_args: Vec<String>,
        /// Run root directory.
        #[arg(long)]
        run_root: Option<PathBuf>,
        /// Coarse injection step.
        #[arg(long)]
        step: u64,
        /// Mutation kind.
        #[arg(long, value_enum)]
        kind: KindArg,
        /// Subject seed.
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Target selection for pre-execution register faults.
        #[arg(long, value_enum, default_value = "next-read")]
        register_strategy: StrategyArg,
        /// Optional timeout hint in seconds, exported to the subject.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },
    /// Resolve a captured fault against a saved inspection dump, without
    /// running anything.
    FindTarget {
        /// File holding captured coarse output (fault and trace landmarks).
        #[arg(long)]
        coarse_log: PathBuf,
        /// File holding a saved inspection dump.
        #[arg(long)]
        inspection_log: PathBuf,
        /// Target selection for pre-execution register faults.
        #[arg(long, value_enum, default_value = "next-read")]
        register_strategy: StrategyArg,
        /// Also write the mutation document to this path.
        #[arg(long)]
        write_document: Option<PathBuf>,
        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },
    /// Show status for run id.
    Status {
        /// Existing run id.
        run_id: String,
        /// Run root directory.
        #[arg(long)]
        run_root: Option<PathBuf>,
    },
    /// Render report for run id.
    Report {
        /// Existing run id.
        run_id: String,
        /// Output format.
        #[arg(long, value_enum, default_value = "md")]
        format: OutputFormat,
        /// Run root directory.
        #[arg(long)]
        run_root: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Markdown
    Md,
    /// JSON
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    /// Swap the instruction's category in the witness.
    InstructionType,
    /// Corrupt the register result of a computation.
    ComputedOutput,
    /// Corrupt the register result of a load.
    LoadedValue,
    /// Corrupt the word a store writes.
    StoredOutput,
    /// Overwrite a register ahead of execution.
    PreExecutionRegister,
}

impl From<KindArg> for MutationKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::InstructionType => MutationKind::InstructionType,
            KindArg::ComputedOutput => MutationKind::ComputedOutput,
            KindArg::LoadedValue => MutationKind::LoadedValue,
            KindArg::StoredOutput => MutationKind::StoredOutput,
            KindArg::PreExecutionRegister => MutationKind::PreExecutionRegister,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    /// Corrupt the next read of the register at or after the injection point.
    NextRead,
    /// Corrupt the last write of the register before the injection point.
    PriorWrite,
}

impl From<StrategyArg> for RegisterStrategy {
    fn from(strategy: StrategyArg) -> Self {
        match strategy {
            StrategyArg::NextRead => RegisterStrategy::NextRead,
            StrategyArg::PriorWrite => RegisterStrategy::PriorWrite,
        }
    }
}

fn make_config(
    subject: Option<PathBuf>,
    subject_args: Vec<String>,
    run_root: Option<PathBuf>,
    register_strategy: Option<RegisterStrategy>,
    timeout_secs: Option<u64>,
) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    if let Some(subject) = subject {
        config = config.with_subject(subject);
    }
    if !subject_args.is_empty() {
        config = config.with_subject_args(subject_args);
    }
    if let Some(run_root) = run_root {
        config = config.with_run_root(run_root);
    }
    if let Some(register_strategy) = register_strategy {
        config = config.with_register_strategy(register_strategy);
    }
    if let Some(timeout_secs) = timeout_secs {
        config = config.with_timeout_secs(timeout_secs);
    }
    config
}

fn print_summary(summary: &CampaignSummary) {
    println!(
        "summary: aligned={}, aligned_loose={}, divergent={}, silent={}, not_applicable={}, crashed={}, errored={}, incomplete={}, alignment_rate={:.2}%",
        summary.aligned,
        summary.aligned_loose,
        summary.divergent,
        summary.silent,
        summary.not_applicable,
        summary.crashed,
        summary.errored,
        summary.incomplete,
        summary.alignment_rate
    );
}

fn print_target(target: &MutationTarget) {
    println!(
        "target: {} at step record {}, fine step {}, pc {:#010x}",
        target.kind, target.step_index, target.fine_step, target.correlation.pc
    );
    match target.correlation.confidence {
        Confidence::Exact => println!("confidence: exact"),
        Confidence::Disambiguated {
            candidates,
            estimated_fine_step,
        } => match estimated_fine_step {
            Some(estimate) => println!(
                "confidence: disambiguated among {candidates} candidate(s), drift estimate {estimate}"
            ),
            None => println!(
                "confidence: disambiguated among {candidates} candidate(s) without a drift estimate"
            ),
        },
    }
    match target.edit {
        TraceEdit::StepCategory {
            step_index,
            category,
        } => println!("edit: step record {step_index} category -> {category}"),
        TraceEdit::AccessValue {
            access_index,
            value,
        } => println!("edit: access record {access_index} value -> {value}"),
    }
}

fn target_payload(target: &MutationTarget) -> serde_json::Value {
    let confidence = match target.correlation.confidence {
        Confidence::Exact => serde_json::json!({ "exact": true }),
        Confidence::Disambiguated {
            candidates,
            estimated_fine_step,
        } => serde_json::json!({
            "exact": false,
            "candidates": candidates,
            "estimated_fine_step": estimated_fine_step,
        }),
    };
    serde_json::json!({
        "kind": target.kind.to_string(),
        "step_index": target.step_index,
        "fine_step": target.fine_step,
        "pc": target.correlation.pc,
        "confidence": confidence,
        "document": target.document(),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Campaign {
            subject,
            subject_args,
            run_root,
            steps,
            kinds,
            seed,
            register_strategy,
            timeout_secs,
        } => {
            let register_strategy = RegisterStrategy::from(register_strategy);
            let config = make_config(
                Some(subject),
                subject_args,
                run_root,
                Some(register_strategy),
                timeout_secs,
            );
            let plan = CampaignPlan {
                steps,
                kinds: kinds.into_iter().map(MutationKind::from).collect(),
                seed,
                register_strategy,
                timeout_secs,
            };
            let process = ProcessSubject::new(config.clone());
            let result = run_campaign(&config, &plan, &process)?;
            let summary = CampaignSummary::from_snapshot(&result.snapshot);
            println!("run id: {}", result.run_id);
            println!("run dir: {}", result.run_dir.display());
            print_summary(&summary);
        }
        Command::Resume {
            run_id,
            subject,
            subject_args,
            run_root,
            timeout_secs,
        } => {
            let config = make_config(Some(subject), subject_args, run_root, None, timeout_secs);
            let process = ProcessSubject::new(config.clone());
            let result = resume_campaign(&config, &run_id, &process)?;
            let summary = CampaignSummary::from_snapshot(&result.snapshot);
            println!("run id: {}", result.run_id);
            print_summary(&summary);
        }
        Command::Compare {
            subject,
            subject_args,
            run_root,
            step,
            kind,
            seed,
            register_strategy,
            timeout_secs,
            json,
        } => {
            let config = make_config(
                Some(subject),
                subject_args,
                run_root,
                Some(register_strategy.into()),
                timeout_secs,
            );
            let case = CasePlan::new(step, kind.into(), seed);
            let process = ProcessSubject::new(config.clone());
            let report = run_single_case(&config, &case, &process)?;

            if json {
                let comparison = report.comparison.as_ref().map(|r| {
                    serde_json::json!({
                        "policy": r.policy,
                        "verdict": r.verdict(),
                        "common": r.common,
                        "coarse_only": r.coarse_only,
                        "fine_only": r.fine_only,
                    })
                });
                let output = serde_json::json!({
                    "case_id": report.case.id,
                    "outcome": report.outcome,
                    "target": report.target.as_ref().map(target_payload),
                    "comparison": comparison,
                    "run_dir": report.run_dir.display().to_string(),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("case: {}", report.case.id);
                println!("outcome: {}", report.outcome);
                if let Some(target) = &report.target {
                    print_target(target);
                }
                if let Some(comparison) = &report.comparison {
                    println!("comparison: {}", ComparisonCounts::from(comparison));
                    for key in &comparison.common {
                        println!("  common      {key}");
                    }
                    for key in &comparison.coarse_only {
                        println!("  coarse-only {key}");
                    }
                    for key in &comparison.fine_only {
                        println!("  fine-only   {key}");
                    }
                }
                println!("run dir: {}", report.run_dir.display());
            }
        }
        Command::FindTarget {
            coarse_log,
            inspection_log,
            register_strategy,
            write_document,
            json,
        } => {
            let coarse_text = fs::read_to_string(&coarse_log)
                .with_context(|| format!("reading coarse log {}", coarse_log.display()))?;
            let inspection_text = fs::read_to_string(&inspection_log)
                .with_context(|| format!("reading inspection dump {}", inspection_log.display()))?;
            let resolution =
                resolve_target(register_strategy.into(), &coarse_text, &inspection_text)?;
            let document = resolution.target.document();

            if let Some(path) = &write_document {
                fs::write(path, serde_json::to_string_pretty(&document)?)
                    .with_context(|| format!("writing mutation document {}", path.display()))?;
            }

            if json {
                let output = serde_json::json!({
                    "fault": {
                        "coarse_step": resolution.event.step,
                        "pc": resolution.event.pc,
                        "kind": resolution.event.kind.to_string(),
                    },
                    "target": target_payload(&resolution.target),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!(
                    "fault: {} at coarse step {}, pc {:#010x}",
                    resolution.event.kind, resolution.event.step, resolution.event.pc
                );
                print_target(&resolution.target);
                println!("document: {}", serde_json::to_string(&document)?);
                if let Some(path) = write_document {
                    println!("document written to {}", path.display());
                }
            }
        }
        Command::Status { run_id, run_root } => {
            let config = make_config(None, Vec::new(), run_root, None, None);
            let snapshot = load_campaign_status(&config, &run_id)?;
            let summary = CampaignSummary::from_snapshot(&snapshot);
            println!("run id: {}", snapshot.run_id);
            println!("completed: {}", snapshot.completed);
            println!("interrupted: {}", snapshot.interrupted);
            print_summary(&summary);
        }
        Command::Report {
            run_id,
            format,
            run_root,
        } => {
            let config = make_config(None, Vec::new(), run_root, None, None);
            let format = match format {
                OutputFormat::Md => ReportFormat::Markdown,
                OutputFormat::Json => ReportFormat::Json,
            };
            println!("{}", render_campaign_report(&config, &run_id, format)?);
        }
    }

    Ok(())
}
