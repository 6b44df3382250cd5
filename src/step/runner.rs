//! Sequential step runner.
//!
//! Steps run strictly in input order, one at a time; later steps may depend
//! on state produced by earlier ones. Each step ends in exactly one
//! [`StepStatus`]. A `FailedFatal` or `Cancelled` step ends the run; the
//! [`RunResult`] is still fully formed with everything gathered so far.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::retry::{with_retry_observed, RetryError};

use super::action::{perform, satisfied};
use super::{FailurePolicy, Step, StepContext, StepError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    SkippedAlreadySatisfied,
    FailedTolerated,
    FailedFatal,
    Cancelled,
}

impl StepStatus {
    pub fn label(self) -> &'static str {
        match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::SkippedAlreadySatisfied => "already satisfied",
            StepStatus::FailedTolerated => "failed (tolerated)",
            StepStatus::FailedFatal => "FAILED (fatal)",
            StepStatus::Cancelled => "interrupted",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of one executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step_name: String,
    pub status: StepStatus,
    pub detail: Option<String>,
    /// 0 when skipped, 1 when not retried.
    pub attempts: u32,
}

/// Outcomes of a whole run, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub outcomes: Vec<StepOutcome>,
    /// A fatal step failed.
    pub aborted: bool,
    /// The operator interrupted the run.
    pub cancelled: bool,
}

impl RunResult {
    pub fn count(&self, status: StepStatus) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status == status)
            .count()
    }

    pub fn outcome(&self, step_name: &str) -> Option<&StepOutcome> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.step_name == step_name)
    }
}

/// Dry-run view of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub name: String,
    pub satisfied: bool,
    pub touches: Vec<PathBuf>,
}

/// Execute `steps` in order.
pub fn run_all(steps: &[Step], ctx: &StepContext<'_>) -> RunResult {
    let mut result = RunResult::default();
    let total = steps.len();

    for (index, step) in steps.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            ctx.log.stop(format!(
                "interrupted before '{}'; {} step(s) not started",
                step.name,
                total - index
            ));
            result.cancelled = true;
            break;
        }

        let outcome = run_step(step, ctx, index + 1, total);
        let status = outcome.status;
        result.outcomes.push(outcome);

        match status {
            StepStatus::FailedFatal => {
                result.aborted = true;
                let remaining = total - index - 1;
                if remaining > 0 {
                    ctx.log
                        .stop(format!("fatal failure; {remaining} remaining step(s) not run"));
                }
                break;
            }
            StepStatus::Cancelled => {
                result.cancelled = true;
                break;
            }
            _ => {}
        }
    }

    result
}

/// Evaluate checks only; never runs an action.
pub fn preview(steps: &[Step], ctx: &StepContext<'_>) -> Vec<PlannedStep> {
    steps
        .iter()
        .map(|step| PlannedStep {
            name: step.name.clone(),
            satisfied: satisfied(&step.check, ctx),
            touches: step.touches.clone(),
        })
        .collect()
}

enum Failure {
    Cancelled { attempts: u32 },
    Failed { detail: String, attempts: u32 },
}

fn run_step(step: &Step, ctx: &StepContext<'_>, position: usize, total: usize) -> StepOutcome {
    let label = format!("({position}/{total}) {}", step.name);
    let outcome = |status: StepStatus, detail: Option<String>, attempts: u32| StepOutcome {
        step_name: step.name.clone(),
        status,
        detail,
        attempts,
    };

    if satisfied(&step.check, ctx) {
        ctx.log.skip(format!("{label}: already satisfied"));
        return outcome(StepStatus::SkippedAlreadySatisfied, None, 0);
    }

    ctx.log.info(format!("{label}: running"));
    match execute(step, ctx, &label) {
        Ok(attempts) => {
            if attempts > 1 {
                ctx.log.ok(format!("{label} (after {attempts} attempts)"));
            } else {
                ctx.log.ok(&label);
            }
            outcome(StepStatus::Succeeded, None, attempts)
        }
        Err(Failure::Cancelled { attempts }) => {
            ctx.log.stop(format!("{label}: interrupted by operator"));
            outcome(
                StepStatus::Cancelled,
                Some("interrupted by operator".to_string()),
                attempts,
            )
        }
        Err(Failure::Failed { detail, attempts }) => match step.policy {
            FailurePolicy::Fatal => {
                ctx.log.fail(format!("{label}: {detail}"));
                outcome(StepStatus::FailedFatal, Some(detail), attempts)
            }
            FailurePolicy::Tolerant => {
                ctx.log.fail(format!("{label}: {detail} (continuing)"));
                outcome(StepStatus::FailedTolerated, Some(detail), attempts)
            }
        },
    }
}

fn execute(step: &Step, ctx: &StepContext<'_>, label: &str) -> Result<u32, Failure> {
    if !step.retryable {
        return match perform(&step.action, ctx) {
            Ok(()) => Ok(1),
            // Ctrl-C reaches the child too; its exit is not a step failure.
            Err(_) if ctx.cancel.is_cancelled() => Err(Failure::Cancelled { attempts: 1 }),
            Err(StepError::Cancelled) => Err(Failure::Cancelled { attempts: 1 }),
            Err(err) => Err(Failure::Failed {
                detail: err.to_string(),
                attempts: 1,
            }),
        };
    }

    let max_attempts = ctx.retry.max_attempts.max(1);
    let retried = with_retry_observed(
        ctx.retry,
        ctx.sleeper,
        ctx.cancel,
        |_| perform(&step.action, ctx),
        |attempt, err, wait| {
            if let Some(wait) = wait {
                ctx.log.warn(format!(
                    "{label}: attempt {attempt}/{max_attempts} failed: {err}; retrying in {}s",
                    wait.as_secs()
                ));
            }
        },
    );

    match retried {
        Ok(done) => Ok(done.attempts),
        Err(RetryError::Cancelled { attempts }) => Err(Failure::Cancelled { attempts }),
        Err(exhausted) => Err(Failure::Failed {
            attempts: exhausted.attempts(),
            detail: exhausted.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{failed, ok, ScriptedExecutor};
    use crate::executor::CommandSpec;
    use crate::retry::RecordingSleeper;
    use crate::step::{self, TestHarness};
    use std::cell::Cell;
    use std::fs;
    use std::rc::Rc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn succeed() -> step::Action {
        step::custom(|_| Ok(()))
    }

    fn fail(msg: &'static str) -> step::Action {
        step::custom(move |_| Err(StepError::Custom(msg.to_string())))
    }

    fn satisfied_check() -> step::Check {
        step::custom_check(|_| true)
    }

    fn statuses(result: &RunResult) -> Vec<(&str, StepStatus)> {
        result
            .outcomes
            .iter()
            .map(|outcome| (outcome.step_name.as_str(), outcome.status))
            .collect()
    }

    #[test]
    fn test_mixed_policies_scenario() {
        let harness = TestHarness::new(ScriptedExecutor::succeeding());
        let e_ran = Rc::new(Cell::new(false));
        let e_flag = Rc::clone(&e_ran);

        let steps = vec![
            Step::new("A", fail("A must not run")).with_check(satisfied_check()),
            Step::new("B", fail("mirror down")),
            Step::new("C", succeed()).fatal(),
            Step::new("D", fail("disk full")).fatal(),
            Step::new(
                "E",
                step::custom(move |_| {
                    e_flag.set(true);
                    Ok(())
                }),
            ),
        ];

        let result = run_all(&steps, &harness.ctx());

        assert_eq!(
            statuses(&result),
            vec![
                ("A", StepStatus::SkippedAlreadySatisfied),
                ("B", StepStatus::FailedTolerated),
                ("C", StepStatus::Succeeded),
                ("D", StepStatus::FailedFatal),
            ]
        );
        assert!(result.outcome("E").is_none());
        assert!(!e_ran.get());
        assert!(result.aborted);
        assert!(!result.cancelled);
        assert_eq!(result.outcome("D").unwrap().detail.as_deref(), Some("disk full"));
        assert_eq!(result.outcome("A").unwrap().attempts, 0);
    }

    #[test]
    fn test_second_run_skips_every_idempotent_step() {
        let temp = TempDir::new().unwrap();
        let harness = TestHarness::new(ScriptedExecutor::succeeding());
        let profile = temp.path().join(".zshrc");
        let config = temp.path().join(".config/alacritty/alacritty.toml");
        let marker = temp.path().join("opt/tool/.built");
        let marker_for_action = marker.clone();

        let steps = vec![
            Step::new(
                "profile: aliases",
                step::append_block(&profile, "aliases", "alias ll='ls -la'", None),
            )
            .with_check(step::Check::HasBlock {
                path: profile.clone(),
                marker: "aliases".into(),
            }),
            Step::new(
                "file: alacritty",
                step::write_file(&config, "[font]\nsize = 11\n", None, None),
            )
            .with_check(step::Check::FileMatches {
                path: config.clone(),
                content: "[font]\nsize = 11\n".into(),
            }),
            Step::new(
                "build: tool",
                step::custom(move |_| {
                    fs::create_dir_all(marker_for_action.parent().unwrap()).unwrap();
                    fs::write(&marker_for_action, "").unwrap();
                    Ok(())
                }),
            )
            .with_check(step::path_exists(&marker)),
        ];

        let first = run_all(&steps, &harness.ctx());
        assert_eq!(first.count(StepStatus::Succeeded), 3);

        let second = run_all(&steps, &harness.ctx());
        assert_eq!(second.count(StepStatus::Succeeded), 0);
        assert_eq!(second.count(StepStatus::SkippedAlreadySatisfied), 3);
        assert_eq!(
            fs::read_to_string(&profile).unwrap().matches("desk-provision:aliases >>>").count(),
            1
        );
    }

    #[test]
    fn test_tolerant_failures_do_not_block_later_steps() {
        let harness = TestHarness::new(ScriptedExecutor::succeeding());
        let steps = vec![
            Step::new("one", fail("x")),
            Step::new("two", fail("y")),
            Step::new("three", succeed()),
        ];

        let result = run_all(&steps, &harness.ctx());

        assert_eq!(result.count(StepStatus::FailedTolerated), 2);
        assert_eq!(
            result.outcome("three").unwrap().status,
            StepStatus::Succeeded
        );
        assert!(!result.aborted);
    }

    #[test]
    fn test_fatal_failure_stops_immediately() {
        let harness = TestHarness::new(ScriptedExecutor::succeeding());
        let steps = vec![
            Step::new("identity-bound setup", fail("boom")).fatal(),
            Step::new("later", succeed()),
            Step::new("much later", succeed()),
        ];

        let result = run_all(&steps, &harness.ctx());

        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(result.outcomes[0].status, StepStatus::FailedFatal);
        assert!(result.aborted);
    }

    #[test]
    fn test_retryable_step_succeeds_after_transient_failures() {
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let harness = TestHarness::new(ScriptedExecutor::with(move |_| {
            counter.set(counter.get() + 1);
            Ok(if counter.get() < 3 {
                failed(100, "Temporary failure resolving 'deb.debian.org'")
            } else {
                ok("")
            })
        }));
        let steps = vec![Step::new(
            "apt: nmap",
            step::run(CommandSpec::new("apt-get", ["install", "-y", "nmap"])),
        )
        .retrying()];

        let result = run_all(&steps, &harness.ctx());

        let outcome = &result.outcomes[0];
        assert_eq!(outcome.status, StepStatus::Succeeded);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            *harness.sleeper.waits.borrow(),
            vec![Duration::from_secs(30), Duration::from_secs(60)]
        );
    }

    #[test]
    fn test_exhausted_retry_uses_step_policy() {
        let harness = TestHarness::new(ScriptedExecutor::with(|_| Ok(failed(1, "network unreachable"))));
        let steps = vec![
            Step::new(
                "pipx: netexec",
                step::run(CommandSpec::new("pipx", ["install", "netexec"]).as_user()),
            )
            .retrying(),
            Step::new("after", succeed()),
        ];

        let result = run_all(&steps, &harness.ctx());

        let outcome = &result.outcomes[0];
        assert_eq!(outcome.status, StepStatus::FailedTolerated);
        assert_eq!(outcome.attempts, 5);
        let detail = outcome.detail.as_deref().unwrap();
        assert!(detail.starts_with("gave up after 5 attempts"));
        assert!(detail.contains("pipx install netexec"));
        assert_eq!(harness.executor.calls().len(), 5);
        assert_eq!(result.outcome("after").unwrap().status, StepStatus::Succeeded);
    }

    #[test]
    fn test_cancellation_during_backoff_yields_cancelled() {
        let mut harness = TestHarness::new(ScriptedExecutor::with(|_| Ok(failed(1, "timeout"))));
        harness.sleeper = RecordingSleeper::cancelling_after(1);
        let steps = vec![
            Step::new(
                "git: SecLists",
                step::run(CommandSpec::new("git", ["clone", "https://example.invalid/SecLists"])),
            )
            .fatal()
            .retrying(),
            Step::new("after", succeed()),
        ];

        let result = run_all(&steps, &harness.ctx());

        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(result.outcomes[0].status, StepStatus::Cancelled);
        assert!(result.cancelled);
        assert!(!result.aborted);
    }

    #[test]
    fn test_child_killed_by_interrupt_is_cancelled_not_failed() {
        for retrying in [false, true] {
            let mut harness = TestHarness::new(ScriptedExecutor::succeeding());
            harness.retry.max_attempts = 1;
            let cancel = harness.cancel.clone();
            let steps = vec![
                Step::new(
                    "apt: base system",
                    step::custom(move |_| {
                        cancel.cancel();
                        Err(StepError::CommandFailed {
                            command: "apt-get install -y nmap".into(),
                            exit_code: 130,
                            stderr_tail: String::new(),
                        })
                    }),
                )
                .fatal()
                .with_retry(retrying),
                Step::new("after", succeed()),
            ];

            let result = run_all(&steps, &harness.ctx());

            assert_eq!(statuses(&result), vec![("apt: base system", StepStatus::Cancelled)]);
            assert!(result.cancelled);
            assert!(!result.aborted);
        }
    }

    #[test]
    fn test_cancel_before_step_records_nothing_further() {
        let harness = TestHarness::new(ScriptedExecutor::succeeding());
        let cancel = harness.cancel.clone();
        let steps = vec![
            Step::new(
                "first",
                step::custom(move |_| {
                    cancel.cancel();
                    Ok(())
                }),
            ),
            Step::new("second", succeed()),
        ];

        let result = run_all(&steps, &harness.ctx());

        assert_eq!(statuses(&result), vec![("first", StepStatus::Succeeded)]);
        assert!(result.cancelled);
    }

    #[test]
    fn test_preview_never_runs_actions() {
        let harness = TestHarness::new(ScriptedExecutor::succeeding());
        let steps = vec![
            Step::new("done", fail("x")).with_check(satisfied_check()),
            Step::new("todo", fail("y")).touching("/opt/desk-provision/venv"),
        ];

        let planned = preview(&steps, &harness.ctx());

        assert_eq!(planned.len(), 2);
        assert!(planned[0].satisfied);
        assert!(!planned[1].satisfied);
        assert_eq!(planned[1].touches, vec![PathBuf::from("/opt/desk-provision/venv")]);
        assert!(harness.executor.calls().is_empty());
    }
}
