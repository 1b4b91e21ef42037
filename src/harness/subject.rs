//! Subject invocation for coarse and fine runs.
//!
//! One subject binary carries both instrumentation layers. The coarse
//! layer is driven by arguments (`--trace --inject --seed S
//! --inject-step N --inject-kind K`); the fine layer is driven by
//! environment toggles so the same base invocation serves inspection
//! and mutation runs. Exit status is captured but not interpreted: a
//! mutated run is expected to fail its checks.

use std::path::Path;
use std::process::Command;

use thiserror::Error;

use super::config::HarnessConfig;
use super::events::CasePlan;

/// Enables step records on the fine run's output.
pub const INSPECT_ENV: &str = "WITNESS_INSPECT";
/// Restricts the access dump to one retirement step.
pub const DUMP_STEP_ENV: &str = "WITNESS_DUMP_STEP";
/// Enables access records on the fine run's output.
pub const DUMP_ACCESSES_ENV: &str = "WITNESS_DUMP_ACCESSES";
/// Points the fine run at a mutation document to apply.
pub const MUTATION_CONFIG_ENV: &str = "WITNESS_MUTATION_CONFIG";
/// Makes the verifier-side check report every failure instead of
/// stopping at the first.
pub const CONSTRAINT_CONTINUE_ENV: &str = "CONSTRAINT_CONTINUE";
/// Timeout hint in seconds, enforced subject-side.
pub const TIMEOUT_ENV: &str = "SUBJECT_TIMEOUT_SECS";

/// Captured output of one subject invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    /// Process exit code, if the subject exited normally.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl Capture {
    /// Concatenated stdout and stderr for record scraping.
    pub fn text(&self) -> String {
        let mut text = String::with_capacity(self.stdout.len() + self.stderr.len());
        text.push_str(&self.stdout);
        text.push_str(&self.stderr);
        text
    }
}

/// Subject invocation errors.
#[derive(Debug, Error)]
pub enum SubjectError {
    /// Subject binary not found at the configured path.
    #[error("subject binary `{0}` was not found")]
    Missing(String),
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One coarse or fine invocation of the subject under test.
pub trait Subject {
    /// Run the coarse layer with the case's fault injected.
    fn run_coarse(&self, case: &CasePlan) -> Result<Capture, SubjectError>;

    /// Run the fine layer in inspection mode.
    ///
    /// `dump_step` narrows the access dump to one retirement step;
    /// `None` dumps the whole trace.
    fn run_inspection(
        &self,
        case: &CasePlan,
        dump_step: Option<u64>,
    ) -> Result<Capture, SubjectError>;

    /// Run the fine layer with a mutation document applied.
    fn run_mutation(&self, case: &CasePlan, document: &Path) -> Result<Capture, SubjectError>;
}

/// Subject invoked as a child process per the instrumentation contract.
#[derive(Debug, Clone)]
pub struct ProcessSubject {
    config: HarnessConfig,
}

impl ProcessSubject {
    /// Wraps the configured subject binary.
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.subject);
        cmd.args(&self.config.subject_args);
        cmd.env(CONSTRAINT_CONTINUE_ENV, "1");
        if let Some(timeout_secs) = self.config.timeout_secs {
            cmd.env(TIMEOUT_ENV, timeout_secs.to_string());
        }
        cmd
    }

    fn capture(&self, cmd: &mut Command) -> Result<Capture, SubjectError> {
        let output = match cmd.output() {
            Ok(output) => output,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SubjectError::Missing(
                    self.config.subject.display().to_string(),
                ));
            }
            Err(err) => return Err(SubjectError::Io(err)),
        };

        Ok(Capture {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

impl Subject for ProcessSubject {
    fn run_coarse(&self, case: &CasePlan) -> Result<Capture, SubjectError> {
        let mut cmd = self.base_command();
        cmd.arg("--trace")
            .arg("--inject")
            .arg("--seed")
            .arg(case.seed.to_string())
            .arg("--inject-step")
            .arg(case.inject_step.to_string())
            .arg("--inject-kind")
            .arg(case.kind.to_string());
        self.capture(&mut cmd)
    }

    fn run_inspection(
        &self,
        case: &CasePlan,
        dump_step: Option<u64>,
    ) -> Result<Capture, SubjectError> {
        let mut cmd = self.base_command();
        cmd.arg("--seed").arg(case.seed.to_string());
        cmd.env(INSPECT_ENV, "1");
        cmd.env(DUMP_ACCESSES_ENV, "1");
        if let Some(step) = dump_step {
            cmd.env(DUMP_STEP_ENV, step.to_string());
        }
        self.capture(&mut cmd)
    }

    fn run_mutation(&self, case: &CasePlan, document: &Path) -> Result<Capture, SubjectError> {
        let mut cmd = self.base_command();
        cmd.arg("--seed").arg(case.seed.to_string());
        cmd.env(MUTATION_CONFIG_ENV, document);
        self.capture(&mut cmd)
    }
}

/// First crash marker line in a run's output, if any.
///
/// Applied only when a run produced zero failure records: a marker
/// means the guest program died instead of tripping constraints.
pub fn crash_reason(text: &str) -> Option<String> {
    text.lines()
        .find(|line| is_crash_marker(line))
        .map(|line| line.trim().to_string())
}

fn is_crash_marker(line: &str) -> bool {
    (line.contains("\"status\":\"error\"") && line.contains("\"context\":\"Prover\""))
        || line.contains("panicked at")
        || line.contains("Guest panicked:")
}
