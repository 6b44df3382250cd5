//! Command executor and the filesystem primitives step actions are built from.
//!
//! Every external tool (apt-get, pipx, git, snap, python) is reached through
//! the [`Executor`] trait. A nonzero exit status is returned as data in
//! [`ExecResult`]; only a failure to spawn the process is an error.
//!
//! # Usage
//!
//! ```rust,ignore
//! use desk_provision::executor::{CommandSpec, Executor, SystemExecutor};
//!
//! let spec = CommandSpec::new("pipx", ["install", "impacket"]).as_user();
//! let result = SystemExecutor.run(&spec, &identity)?;
//! if !result.success() {
//!     eprintln!("{}", result.stderr_tail(5));
//! }
//! ```

pub mod directories;
pub mod files;
#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, ExitStatus};

use serde::Serialize;

use crate::identity::Identity;

/// Environment variables carried into a target-user command.
const PASSTHROUGH_ENV: &[&str] = &["LANG", "LC_ALL", "TERM", "http_proxy", "https_proxy", "no_proxy"];

/// Whose privileges a command runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAs {
    /// Inherit the elevated process context.
    #[default]
    Elevated,
    /// Drop to the resolved target user with a clean login-like environment.
    TargetUser,
}

/// Per-invocation options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub run_as: RunAs,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// A fully specified external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub options: ExecOptions,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            options: ExecOptions::default(),
        }
    }

    /// Run this command through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh", ["-c".to_string(), script.into()])
    }

    pub fn as_user(mut self) -> Self {
        self.options.run_as = RunAs::TargetUser;
        self
    }

    pub fn run_as(mut self, run_as: RunAs) -> Self {
        self.options.run_as = run_as;
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandSpec {
    /// Shell-ish rendering used in logs and retry hints.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.options.run_as == RunAs::TargetUser {
            write!(f, "(as user) ")?;
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg.replace('\'', r"'\''"))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Exit status and captured output of one command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `lines` non-empty lines of stderr (stdout if stderr is empty).
    pub fn stderr_tail(&self, lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let tail: Vec<&str> = source
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect();
        let start = tail.len().saturating_sub(lines);
        tail[start..].join("\n")
    }

    fn from_status(status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> Self {
        let exit_code = status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig))
            .unwrap_or(-1);
        Self {
            exit_code,
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }
}

/// Runs external commands on behalf of steps, checks and probes.
pub trait Executor {
    /// Run `spec` to completion. `identity` supplies the target user for
    /// [`RunAs::TargetUser`] commands.
    fn run(&self, spec: &CommandSpec, identity: &Identity) -> io::Result<ExecResult>;
}

/// Executor backed by real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn run(&self, spec: &CommandSpec, identity: &Identity) -> io::Result<ExecResult> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);

        if spec.options.run_as == RunAs::TargetUser {
            cmd.env_clear();
            for key in PASSTHROUGH_ENV {
                if let Ok(value) = std::env::var(key) {
                    cmd.env(key, value);
                }
            }
            cmd.env("HOME", &identity.home)
                .env("USER", &identity.username)
                .env("LOGNAME", &identity.username)
                .env("SHELL", &identity.shell)
                .env("PATH", identity.path_env())
                .uid(identity.uid)
                .gid(identity.gid)
                .current_dir(&identity.home);
        }

        if let Some(dir) = &spec.options.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.options.env {
            cmd.env(key, value);
        }

        let output = cmd.output()?;
        Ok(ExecResult::from_status(
            output.status,
            &output.stdout,
            &output.stderr,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_identity;
    use std::path::Path;

    #[test]
    fn test_display_quotes_whitespace() {
        let spec = CommandSpec::new("sh", ["-c", "make install"]).as_user();
        assert_eq!(spec.to_string(), "(as user) sh -c 'make install'");
    }

    #[test]
    fn test_system_executor_reports_nonzero_exit_as_data() {
        let identity = test_identity(Path::new("/tmp"));
        let result = SystemExecutor
            .run(&CommandSpec::shell("echo oops >&2; exit 3"), &identity)
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
        assert_eq!(result.stderr_tail(1), "oops");
    }

    #[test]
    fn test_system_executor_captures_stdout_and_env() {
        let identity = test_identity(Path::new("/tmp"));
        let spec = CommandSpec::shell("printf '%s' \"$GREETING\"").env("GREETING", "hello");
        let result = SystemExecutor.run(&spec, &identity).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello");
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let identity = test_identity(Path::new("/tmp"));
        let spec = CommandSpec::new("definitely_not_a_real_command_12345", Vec::<String>::new());
        assert!(SystemExecutor.run(&spec, &identity).is_err());
    }

    #[test]
    fn test_stderr_tail_falls_back_to_stdout() {
        let result = ExecResult {
            exit_code: 1,
            stdout: "a\nb\n\nc\n".into(),
            stderr: "  \n".into(),
        };
        assert_eq!(result.stderr_tail(2), "b\nc");
    }
}
