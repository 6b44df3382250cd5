//! Declarative provisioning steps.
//!
//! A [`Step`] describes WHAT to do: an idempotency [`Check`], an [`Action`],
//! a [`FailurePolicy`] and whether the action is retried. The runner in
//! [`runner`] interprets them in order.
//!
//! # Example
//!
//! ```rust
//! use desk_provision::executor::CommandSpec;
//! use desk_provision::step::{self, Step};
//!
//! let nmap = Step::new(
//!     "apt: nmap",
//!     step::run(CommandSpec::new("apt-get", ["install", "-y", "nmap"])),
//! )
//! .with_check(step::succeeds(CommandSpec::new("dpkg-query", ["-W", "nmap"])))
//! .fatal()
//! .retrying();
//!
//! assert!(nmap.retryable);
//! ```

pub mod action;
pub mod runner;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::executor::files::Owner;
use crate::executor::{CommandSpec, Executor};
use crate::identity::Identity;
use crate::log::InstallLog;
use crate::retry::{AttemptError, RetryPolicy, Sleeper};

pub use runner::{preview, run_all, PlannedStep, RunResult, StepOutcome, StepStatus};

pub type CheckFn = Box<dyn Fn(&StepContext<'_>) -> bool>;
pub type ActionFn = Box<dyn Fn(&StepContext<'_>) -> Result<(), StepError>>;

/// What happens to the run when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Abort the remaining steps.
    Fatal,
    /// Record the failure and continue.
    #[default]
    Tolerant,
}

/// Everything a step may use while executing. Shared read-only.
pub struct StepContext<'a> {
    pub identity: &'a Identity,
    pub executor: &'a dyn Executor,
    pub sleeper: &'a dyn Sleeper,
    pub cancel: &'a CancelToken,
    pub retry: &'a RetryPolicy,
    pub log: &'a InstallLog,
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("`{command}` exited with status {exit_code}{}", tail_suffix(.stderr_tail))]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr_tail: String,
    },

    #[error("could not start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: {detail}", .path.display())]
    File { path: PathBuf, detail: String },

    #[error("all {} alternatives failed: {}", .0.len(), .0.join("; "))]
    AllAlternativesFailed(Vec<String>),

    #[error("{0}")]
    Custom(String),

    #[error("cancelled by operator")]
    Cancelled,
}

fn tail_suffix(tail: &str) -> String {
    match tail.lines().last() {
        Some(line) if !line.trim().is_empty() => format!(": {}", line.trim()),
        _ => String::new(),
    }
}

impl AttemptError for StepError {
    fn is_cancellation(&self) -> bool {
        matches!(self, StepError::Cancelled)
    }
}

/// Idempotency predicate: true means the step's effect is already present.
pub enum Check {
    /// Always run the action.
    Never,
    PathExists(PathBuf),
    /// The file carries the managed block `marker`.
    HasBlock { path: PathBuf, marker: String },
    /// The file exists with exactly this content.
    FileMatches { path: PathBuf, content: String },
    /// The command exits 0.
    Succeeds(CommandSpec),
    /// The command exits 0 and some stdout line starts with `prefix`.
    OutputLine { command: CommandSpec, prefix: String },
    All(Vec<Check>),
    /// Satisfied when one member is; covers steps with a fallback path.
    Any(Vec<Check>),
    Custom(CheckFn),
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Never => write!(f, "Never"),
            Check::PathExists(path) => write!(f, "PathExists({})", path.display()),
            Check::HasBlock { path, marker } => {
                write!(f, "HasBlock({}, {marker})", path.display())
            }
            Check::FileMatches { path, .. } => write!(f, "FileMatches({})", path.display()),
            Check::Succeeds(spec) => write!(f, "Succeeds({spec})"),
            Check::OutputLine { command, prefix } => {
                write!(f, "OutputLine({command}, {prefix:?})")
            }
            Check::All(checks) => f.debug_tuple("All").field(checks).finish(),
            Check::Any(checks) => f.debug_tuple("Any").field(checks).finish(),
            Check::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Side-effecting operation of a step.
pub enum Action {
    Run(CommandSpec),
    /// Run each action in order, stopping at the first failure.
    Sequence(Vec<Action>),
    /// Try each action in order, succeeding on the first that succeeds.
    FirstSuccess(Vec<Action>),
    WriteFile {
        path: PathBuf,
        content: String,
        mode: Option<u32>,
        owner: Option<Owner>,
    },
    AppendBlock {
        path: PathBuf,
        marker: String,
        content: String,
        owner: Option<Owner>,
    },
    RecreateDir {
        path: PathBuf,
        owner: Option<Owner>,
    },
    RemoveDir(PathBuf),
    Custom(ActionFn),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Run(spec) => write!(f, "Run({spec})"),
            Action::Sequence(actions) => f.debug_tuple("Sequence").field(actions).finish(),
            Action::FirstSuccess(actions) => {
                f.debug_tuple("FirstSuccess").field(actions).finish()
            }
            Action::WriteFile { path, .. } => write!(f, "WriteFile({})", path.display()),
            Action::AppendBlock { path, marker, .. } => {
                write!(f, "AppendBlock({}, {marker})", path.display())
            }
            Action::RecreateDir { path, .. } => write!(f, "RecreateDir({})", path.display()),
            Action::RemoveDir(path) => write!(f, "RemoveDir({})", path.display()),
            Action::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// One unit of provisioning work. Immutable once built.
#[derive(Debug)]
pub struct Step {
    pub name: String,
    pub check: Check,
    pub action: Action,
    pub policy: FailurePolicy,
    pub retryable: bool,
    /// Shared resources (profile file, venv dir, home) this step mutates.
    pub touches: Vec<PathBuf>,
}

impl Step {
    /// A tolerant, non-retried step that always runs.
    pub fn new(name: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into(),
            check: Check::Never,
            action,
            policy: FailurePolicy::Tolerant,
            retryable: false,
            touches: Vec::new(),
        }
    }

    pub fn with_check(mut self, check: Check) -> Self {
        self.check = check;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn fatal(self) -> Self {
        self.with_policy(FailurePolicy::Fatal)
    }

    pub fn with_retry(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn retrying(self) -> Self {
        self.with_retry(true)
    }

    pub fn touching(mut self, path: impl Into<PathBuf>) -> Self {
        self.touches.push(path.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper functions for readable step definitions
// ─────────────────────────────────────────────────────────────────────────────

/// Run a command.
pub fn run(spec: CommandSpec) -> Action {
    Action::Run(spec)
}

/// Run actions in order.
pub fn sequence(actions: impl IntoIterator<Item = Action>) -> Action {
    Action::Sequence(actions.into_iter().collect())
}

/// Fallback chain: the first alternative that succeeds wins.
pub fn first_success_of(alternatives: impl IntoIterator<Item = Action>) -> Action {
    Action::FirstSuccess(alternatives.into_iter().collect())
}

/// Atomically write a whole file.
pub fn write_file(
    path: impl Into<PathBuf>,
    content: impl Into<String>,
    mode: Option<u32>,
    owner: Option<Owner>,
) -> Action {
    Action::WriteFile {
        path: path.into(),
        content: content.into(),
        mode,
        owner,
    }
}

/// Append a delimited block.
pub fn append_block(
    path: impl Into<PathBuf>,
    marker: impl Into<String>,
    content: impl Into<String>,
    owner: Option<Owner>,
) -> Action {
    Action::AppendBlock {
        path: path.into(),
        marker: marker.into(),
        content: content.into(),
        owner,
    }
}

/// Remove and recreate a directory.
pub fn recreate_dir(path: impl Into<PathBuf>, owner: Option<Owner>) -> Action {
    Action::RecreateDir {
        path: path.into(),
        owner,
    }
}

/// Remove a directory tree if present.
pub fn remove_dir(path: impl Into<PathBuf>) -> Action {
    Action::RemoveDir(path.into())
}

/// Arbitrary in-process action.
pub fn custom(f: impl Fn(&StepContext<'_>) -> Result<(), StepError> + 'static) -> Action {
    Action::Custom(Box::new(f))
}

/// Satisfied when the path exists.
pub fn path_exists(path: impl Into<PathBuf>) -> Check {
    Check::PathExists(path.into())
}

/// Satisfied when the command exits 0.
pub fn succeeds(spec: CommandSpec) -> Check {
    Check::Succeeds(spec)
}

/// Satisfied when the command exits 0 and prints a line starting with `prefix`.
pub fn output_line(spec: CommandSpec, prefix: impl Into<String>) -> Check {
    Check::OutputLine {
        command: spec,
        prefix: prefix.into(),
    }
}

/// Satisfied when every check is.
pub fn all(checks: impl IntoIterator<Item = Check>) -> Check {
    Check::All(checks.into_iter().collect())
}

/// Satisfied when any check is.
pub fn any(checks: impl IntoIterator<Item = Check>) -> Check {
    Check::Any(checks.into_iter().collect())
}

/// Arbitrary in-process predicate.
pub fn custom_check(f: impl Fn(&StepContext<'_>) -> bool + 'static) -> Check {
    Check::Custom(Box::new(f))
}

/// Owned context pieces for tests.
#[cfg(test)]
pub(crate) struct TestHarness {
    pub(crate) identity: Identity,
    pub(crate) executor: crate::executor::mock::ScriptedExecutor,
    pub(crate) sleeper: crate::retry::RecordingSleeper,
    pub(crate) cancel: CancelToken,
    pub(crate) retry: RetryPolicy,
    pub(crate) log: InstallLog,
}

#[cfg(test)]
impl TestHarness {
    pub(crate) fn new(executor: crate::executor::mock::ScriptedExecutor) -> Self {
        Self {
            identity: crate::identity::test_identity(std::path::Path::new("/home/alice")),
            executor,
            sleeper: crate::retry::RecordingSleeper::default(),
            cancel: CancelToken::new(),
            retry: RetryPolicy::default(),
            log: InstallLog::silent(),
        }
    }

    pub(crate) fn ctx(&self) -> StepContext<'_> {
        StepContext {
            identity: &self.identity,
            executor: &self.executor,
            sleeper: &self.sleeper,
            cancel: &self.cancel,
            retry: &self.retry,
            log: &self.log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_defaults() {
        let step = Step::new("noop", custom(|_| Ok(())));
        assert_eq!(step.policy, FailurePolicy::Tolerant);
        assert!(!step.retryable);
        assert!(matches!(step.check, Check::Never));
        assert!(step.touches.is_empty());
    }

    #[test]
    fn test_builder_helpers() {
        let step = Step::new("venv", recreate_dir("/opt/venv", None))
            .with_check(path_exists("/opt/venv/bin/python"))
            .fatal()
            .retrying()
            .touching("/opt/venv");

        assert_eq!(step.policy, FailurePolicy::Fatal);
        assert!(step.retryable);
        assert_eq!(step.touches, vec![PathBuf::from("/opt/venv")]);
        assert_eq!(format!("{:?}", step.check), "PathExists(/opt/venv/bin/python)");
    }

    #[test]
    fn test_command_failed_message_carries_command_and_tail() {
        let err = StepError::CommandFailed {
            command: "apt-get install -y nmap".into(),
            exit_code: 100,
            stderr_tail: "W: something\nE: Unable to locate package nmap".into(),
        };
        assert_eq!(
            err.to_string(),
            "`apt-get install -y nmap` exited with status 100: E: Unable to locate package nmap"
        );
    }

    #[test]
    fn test_only_cancelled_is_cancellation() {
        assert!(StepError::Cancelled.is_cancellation());
        assert!(!StepError::Custom("boom".into()).is_cancellation());
    }

    #[test]
    fn test_failure_policy_parses_lowercase() {
        #[derive(Deserialize)]
        struct Holder {
            policy: FailurePolicy,
        }
        let holder: Holder = toml::from_str("policy = \"fatal\"").unwrap();
        assert_eq!(holder.policy, FailurePolicy::Fatal);
    }
}
