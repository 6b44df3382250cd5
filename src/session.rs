//! One provisioning session: identity, plan, preflight, steps, verification.
//!
//! Everything that can refuse to start (identity, plan materialization, the
//! run lock, preflight) happens before the first step runs, so a refused
//! session leaves the system untouched.

use std::path::PathBuf;

use thiserror::Error;

use crate::cancel::CancelToken;
use crate::executor::Executor;
use crate::identity::{Identity, IdentityError};
use crate::lock::RunLock;
use crate::log::{now_utc_compact, now_utc_rfc3339, InstallLog};
use crate::plan::Plan;
use crate::preflight::{self, PreflightError};
use crate::retry::Sleeper;
use crate::run_manifest::{self, RunManifest, RunStatus};
use crate::step::{self, PlannedStep, RunResult, StepContext};
use crate::verify::{self, Verified, VerifyContext};

/// Process exit codes.
pub mod exit {
    pub const OK: i32 = 0;
    pub const FATAL_STEP: i32 = 1;
    pub const PRE_RUN: i32 = 2;
    pub const INTERRUPTED: i32 = 130;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Run the steps, then verify.
    #[default]
    Provision,
    /// Evaluate checks only.
    DryRun,
    /// Verify and report without running steps.
    VerifyOnly,
}

impl Mode {
    pub fn label(self) -> &'static str {
        match self {
            Mode::Provision => "provision",
            Mode::DryRun => "dry-run",
            Mode::VerifyOnly => "verify-only",
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("preflight failed: {0}")]
    Preflight(#[from] PreflightError),

    #[error("{0:#}")]
    Plan(anyhow::Error),

    #[error("{0:#}")]
    Lock(anyhow::Error),
}

/// Collaborators for a session. Borrowed for the whole run.
pub struct Session<'a> {
    pub plan: &'a Plan,
    pub executor: &'a dyn Executor,
    pub sleeper: &'a dyn Sleeper,
    pub cancel: &'a CancelToken,
    pub log: &'a InstallLog,
    pub mode: Mode,
    pub skip_preflight: bool,
}

/// What a finished session hands to the reporter.
#[derive(Debug)]
pub struct SessionReport {
    pub identity: Identity,
    pub mode: Mode,
    pub run: RunResult,
    pub verified: Vec<Verified>,
    /// Populated in [`Mode::DryRun`] only.
    pub planned: Vec<PlannedStep>,
    pub warnings: Vec<String>,
    pub manifest: Option<PathBuf>,
}

impl SessionReport {
    pub fn exit_code(&self) -> i32 {
        if self.run.cancelled {
            exit::INTERRUPTED
        } else if self.run.aborted {
            exit::FATAL_STEP
        } else {
            exit::OK
        }
    }
}

impl Session<'_> {
    /// Run the session. `resolve` is called exactly once, before anything else.
    pub fn run(
        &self,
        resolve: impl FnOnce() -> Result<Identity, IdentityError>,
    ) -> Result<SessionReport, SessionError> {
        let started = now_utc_rfc3339();
        let identity = resolve()?;
        self.log.info(format!(
            "target user {} (uid {}), home {}, shell {}",
            identity.username,
            identity.uid,
            identity.home.display(),
            identity.shell_name()
        ));

        let steps = self.plan.steps(&identity).map_err(SessionError::Plan)?;
        let retry = self.plan.retry_policy();
        let ctx = StepContext {
            identity: &identity,
            executor: self.executor,
            sleeper: self.sleeper,
            cancel: self.cancel,
            retry: &retry,
            log: self.log,
        };

        let mut report = SessionReport {
            identity: identity.clone(),
            mode: self.mode,
            run: RunResult::default(),
            verified: Vec::new(),
            planned: Vec::new(),
            warnings: Vec::new(),
            manifest: None,
        };

        if self.mode == Mode::DryRun {
            report.planned = step::preview(&steps, &ctx);
            return Ok(report);
        }

        let settings = self.plan.settings();
        let _lock = match self.mode {
            Mode::Provision => Some(RunLock::acquire(&settings.state_dir).map_err(SessionError::Lock)?),
            _ => None,
        };

        if self.mode == Mode::Provision {
            if self.skip_preflight {
                self.log.warn("preflight checks skipped");
            } else {
                self.log.info("preflight: network, disk space, host tools");
                let preflight = preflight::run(&settings.preflight())?;
                for warning in &preflight.warnings {
                    self.log.warn(warning);
                }
                report.warnings = preflight.warnings;
            }

            self.log.info(format!("running {} step(s) from {}", steps.len(), self.plan.origin()));
            report.run = step::run_all(&steps, &ctx);
        }

        if report.run.cancelled {
            self.log.stop("verification skipped: run interrupted");
        } else {
            let items = self.plan.verification_items(&identity);
            self.log.info(format!("verifying {} capabilities", items.len()));
            report.verified = verify::verify(
                &items,
                &VerifyContext {
                    identity: &identity,
                    executor: self.executor,
                },
            );
        }

        if self.mode == Mode::Provision {
            let run_id = now_utc_compact();
            let finished = now_utc_rfc3339();
            let manifest = RunManifest {
                run_id: &run_id,
                status: RunStatus::of(&report.run),
                mode: self.mode.label(),
                plan: self.plan.origin(),
                target_user: &identity.username,
                created_at_utc: &started,
                finished_at_utc: &finished,
                outcomes: &report.run.outcomes,
                verification: &report.verified,
            };
            match run_manifest::write(&settings.state_dir, &manifest) {
                Ok(path) => report.manifest = Some(path),
                Err(err) => {
                    let warning = format!("{err:#}");
                    self.log.warn(&warning);
                    report.warnings.push(warning);
                }
            }
        }

        Ok(report)
    }
}
