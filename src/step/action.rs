//! Interpreter for [`Action`] and [`Check`] values.

use crate::executor::directories;
use crate::executor::files::{self, WriteOutcome};
use crate::executor::{CommandSpec, ExecResult};

use super::{Action, Check, StepContext, StepError};

/// Lines of stderr kept in a [`StepError::CommandFailed`].
const STDERR_TAIL_LINES: usize = 5;

/// Evaluate an idempotency check. Errors while probing count as "not satisfied".
pub fn satisfied(check: &Check, ctx: &StepContext<'_>) -> bool {
    match check {
        Check::Never => false,
        Check::PathExists(path) => path.exists(),
        Check::HasBlock { path, marker } => files::has_block(path, marker),
        Check::FileMatches { path, content } => files::file_matches(path, content),
        Check::Succeeds(spec) => probe(spec, ctx).is_some_and(|result| result.success()),
        Check::OutputLine { command, prefix } => probe(command, ctx).is_some_and(|result| {
            result.success()
                && result
                    .stdout
                    .lines()
                    .any(|line| line.trim_start().starts_with(prefix.as_str()))
        }),
        Check::All(checks) => checks.iter().all(|check| satisfied(check, ctx)),
        Check::Any(checks) => checks.iter().any(|check| satisfied(check, ctx)),
        Check::Custom(predicate) => predicate(ctx),
    }
}

/// Execute an action once.
pub fn perform(action: &Action, ctx: &StepContext<'_>) -> Result<(), StepError> {
    match action {
        Action::Run(spec) => run_command(spec, ctx).map(|_| ()),
        Action::Sequence(actions) => {
            for action in actions {
                perform(action, ctx)?;
            }
            Ok(())
        }
        Action::FirstSuccess(alternatives) => first_success(alternatives, ctx),
        Action::WriteFile {
            path,
            content,
            mode,
            owner,
        } => {
            let outcome =
                files::write_file_atomic(path, content, *mode, *owner).map_err(|err| {
                    StepError::File {
                        path: path.clone(),
                        detail: format!("{err:#}"),
                    }
                })?;
            if let WriteOutcome::Replaced { backup } = outcome {
                ctx.log.info(format!(
                    "replaced '{}' (previous version kept at '{}')",
                    path.display(),
                    backup.display()
                ));
            }
            Ok(())
        }
        Action::AppendBlock {
            path,
            marker,
            content,
            owner,
        } => files::append_block(path, marker, content, *owner)
            .map(|_| ())
            .map_err(|err| StepError::File {
                path: path.clone(),
                detail: format!("{err:#}"),
            }),
        Action::RecreateDir { path, owner } => {
            directories::recreate_dir(path, *owner).map_err(|err| StepError::File {
                path: path.clone(),
                detail: format!("{err:#}"),
            })
        }
        Action::RemoveDir(path) => {
            directories::remove_dir(path).map_err(|err| StepError::File {
                path: path.clone(),
                detail: format!("{err:#}"),
            })
        }
        Action::Custom(f) => f(ctx),
    }
}

fn first_success(alternatives: &[Action], ctx: &StepContext<'_>) -> Result<(), StepError> {
    let mut failures = Vec::new();
    for (index, alternative) in alternatives.iter().enumerate() {
        match perform(alternative, ctx) {
            Ok(()) => return Ok(()),
            Err(StepError::Cancelled) => return Err(StepError::Cancelled),
            Err(err) => {
                if index + 1 < alternatives.len() {
                    ctx.log.warn(format!(
                        "alternative {}/{} failed, trying next: {err}",
                        index + 1,
                        alternatives.len()
                    ));
                }
                failures.push(err.to_string());
            }
        }
    }
    Err(StepError::AllAlternativesFailed(failures))
}

/// Run a command for an action: nonzero exit becomes an error.
pub fn run_command(spec: &CommandSpec, ctx: &StepContext<'_>) -> Result<ExecResult, StepError> {
    if ctx.cancel.is_cancelled() {
        return Err(StepError::Cancelled);
    }
    ctx.log.detail(&format!("$ {spec}"));
    let result = ctx
        .executor
        .run(spec, ctx.identity)
        .map_err(|source| StepError::Spawn {
            command: spec.to_string(),
            source,
        })?;
    ctx.log.detail(&result.stdout);
    ctx.log.detail(&result.stderr);

    if !result.success() {
        return Err(StepError::CommandFailed {
            command: spec.to_string(),
            exit_code: result.exit_code,
            stderr_tail: result.stderr_tail(STDERR_TAIL_LINES),
        });
    }
    Ok(result)
}

/// Run a command for a check; spawn failures read as "no answer".
fn probe(spec: &CommandSpec, ctx: &StepContext<'_>) -> Option<ExecResult> {
    ctx.executor.run(spec, ctx.identity).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{failed, ok, ScriptedExecutor};
    use crate::step::{self, TestHarness};
    use std::fs;
    use std::io;
    use tempfile::TempDir;

    #[test]
    fn test_sequence_stops_at_first_failure() {
        let harness = TestHarness::new(ScriptedExecutor::with(|spec| {
            Ok(if spec.program == "false" { failed(1, "nope") } else { ok("") })
        }));
        let action = step::sequence([
            step::run(CommandSpec::new("true", Vec::<String>::new())),
            step::run(CommandSpec::new("false", Vec::<String>::new())),
            step::run(CommandSpec::new("never", Vec::<String>::new())),
        ]);

        let err = perform(&action, &harness.ctx()).unwrap_err();

        assert!(matches!(err, StepError::CommandFailed { exit_code: 1, .. }));
        assert_eq!(harness.executor.command_lines(), vec!["true", "false"]);
    }

    #[test]
    fn test_first_success_falls_back() {
        let harness = TestHarness::new(ScriptedExecutor::with(|spec| {
            Ok(if spec.program == "apt-get" {
                failed(100, "E: Unable to locate package feroxbuster")
            } else {
                ok("")
            })
        }));
        let action = step::first_success_of([
            step::run(CommandSpec::new("apt-get", ["install", "-y", "feroxbuster"])),
            step::run(CommandSpec::new("git", ["clone", "https://example.invalid/ferox", "/opt/ferox"])),
        ]);

        perform(&action, &harness.ctx()).unwrap();

        let lines = harness.executor.command_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("git clone"));
    }

    #[test]
    fn test_first_success_reports_every_failure() {
        let harness = TestHarness::new(ScriptedExecutor::with(|_| Ok(failed(2, "broken"))));
        let action = step::first_success_of([
            step::run(CommandSpec::new("a", Vec::<String>::new())),
            step::run(CommandSpec::new("b", Vec::<String>::new())),
        ]);

        match perform(&action, &harness.ctx()).unwrap_err() {
            StepError::AllAlternativesFailed(failures) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_spawn_failure_is_reported_with_command() {
        let harness = TestHarness::new(ScriptedExecutor::with(|_| {
            Err(io::Error::new(io::ErrorKind::NotFound, "No such file"))
        }));
        let err = run_command(&CommandSpec::new("pipx", ["install", "impacket"]), &harness.ctx())
            .unwrap_err();
        assert!(err.to_string().contains("could not start `pipx install impacket`"));
    }

    #[test]
    fn test_cancelled_run_does_not_spawn() {
        let harness = TestHarness::new(ScriptedExecutor::succeeding());
        harness.cancel.cancel();

        let err = run_command(&CommandSpec::new("git", ["clone"]), &harness.ctx()).unwrap_err();

        assert!(matches!(err, StepError::Cancelled));
        assert!(harness.executor.calls().is_empty());
    }

    #[test]
    fn test_output_line_check() {
        let harness = TestHarness::new(ScriptedExecutor::with(|_| {
            Ok(ok("impacket 0.12.0\nnetexec 1.3.0\n"))
        }));
        let list = CommandSpec::new("pipx", ["list", "--short"]).as_user();
        let ctx = harness.ctx();

        assert!(satisfied(&step::output_line(list.clone(), "netexec "), &ctx));
        assert!(!satisfied(&step::output_line(list, "bloodhound "), &ctx));
    }

    #[test]
    fn test_all_check_requires_every_member() {
        let temp = TempDir::new().unwrap();
        let present = temp.path().join("present");
        fs::write(&present, "").unwrap();
        let harness = TestHarness::new(ScriptedExecutor::succeeding());
        let ctx = harness.ctx();

        assert!(satisfied(&step::all([step::path_exists(&present)]), &ctx));
        assert!(!satisfied(
            &step::all([step::path_exists(&present), step::path_exists(temp.path().join("absent"))]),
            &ctx
        ));
    }

    #[test]
    fn test_any_check_stops_at_first_satisfied_member() {
        let temp = TempDir::new().unwrap();
        let present = temp.path().join("present");
        fs::write(&present, "").unwrap();
        let harness = TestHarness::new(ScriptedExecutor::with(|_| Ok(failed(1, ""))));
        let ctx = harness.ctx();
        let dpkg = || step::succeeds(CommandSpec::new("dpkg-query", ["-W", "seclists"]));

        assert!(satisfied(&step::any([dpkg(), step::path_exists(&present)]), &ctx));
        assert!(!satisfied(&step::any([dpkg(), step::path_exists(temp.path().join("absent"))]), &ctx));
        assert!(!satisfied(&Check::Any(Vec::new()), &ctx));
        assert_eq!(harness.executor.calls().len(), 2);
    }

    #[test]
    fn test_succeeds_check_treats_spawn_error_as_unsatisfied() {
        let harness = TestHarness::new(ScriptedExecutor::with(|_| {
            Err(io::Error::new(io::ErrorKind::NotFound, "missing"))
        }));
        assert!(!satisfied(
            &step::succeeds(CommandSpec::new("snap", ["list", "code"])),
            &harness.ctx()
        ));
    }

    #[test]
    fn test_file_actions() {
        let temp = TempDir::new().unwrap();
        let harness = TestHarness::new(ScriptedExecutor::succeeding());
        let ctx = harness.ctx();
        let profile = temp.path().join(".zshrc");
        let config = temp.path().join(".config/i3/config");

        perform(&step::append_block(&profile, "aliases", "alias nse='ls /usr/share/nmap/scripts'", None), &ctx).unwrap();
        perform(&step::write_file(&config, "set $mod Mod4\n", None, None), &ctx).unwrap();

        assert!(satisfied(&Check::HasBlock { path: profile, marker: "aliases".into() }, &ctx));
        assert!(satisfied(&Check::FileMatches { path: config, content: "set $mod Mod4\n".into() }, &ctx));
    }

    #[test]
    fn test_write_into_file_path_parent_reports_path() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let harness = TestHarness::new(ScriptedExecutor::succeeding());

        let err = perform(
            &step::write_file(blocker.join("config"), "x", None, None),
            &harness.ctx(),
        )
        .unwrap_err();

        assert!(matches!(err, StepError::File { .. }));
        assert!(err.to_string().contains("blocker"));
    }
}
