//! Campaign and subject configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::strategy::RegisterStrategy;

/// Configuration for differential campaigns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessConfig {
    /// Subject binary carrying both instrumentation layers.
    pub subject: PathBuf,
    /// Arguments passed to the subject ahead of any mode flags.
    pub subject_args: Vec<String>,
    /// Root directory where campaign state is persisted.
    pub run_root: PathBuf,
    /// Target selection for pre-execution register faults.
    pub register_strategy: RegisterStrategy,
    /// Optional per-run timeout hint in seconds, exported to the subject.
    pub timeout_secs: Option<u64>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let run_root = cwd.join(".tracegraft").join("campaigns");
        Self {
            subject: PathBuf::from("subject"),
            subject_args: Vec::new(),
            run_root,
            register_strategy: RegisterStrategy::default(),
            timeout_secs: None,
        }
    }
}

impl HarnessConfig {
    /// Set subject binary.
    pub fn with_subject(mut self, subject: impl Into<PathBuf>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Set base subject arguments.
    pub fn with_subject_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subject_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set run-state root.
    pub fn with_run_root(mut self, run_root: impl Into<PathBuf>) -> Self {
        self.run_root = run_root.into();
        self
    }

    /// Set register-fault targeting.
    pub fn with_register_strategy(mut self, register_strategy: RegisterStrategy) -> Self {
        self.register_strategy = register_strategy;
        self
    }

    /// Set timeout hint in seconds.
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }
}
