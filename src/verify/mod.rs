//! Post-run verification.
//!
//! Re-probes the system for every expected capability, independently of what
//! the step runner reported. A step can "succeed" while its tool is still
//! missing from the user's PATH; this pass is where that shows up.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;

use crate::executor::{CommandSpec, Executor};
use crate::identity::Identity;

pub type ProbeFn = Box<dyn Fn(&VerifyContext<'_>) -> Result<()>>;

/// How to decide whether a capability is present.
pub enum Probe {
    /// Executable resolvable on the target user's search path.
    Binary(String),
    /// `python -c "import module"` exits 0.
    PythonModule { python: PathBuf, module: String },
    /// Listed by `pipx list --short` for the target user.
    PipxPackage(String),
    Path(PathBuf),
    Custom(ProbeFn),
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probe::Binary(name) => write!(f, "Binary({name})"),
            Probe::PythonModule { python, module } => {
                write!(f, "PythonModule({}, {module})", python.display())
            }
            Probe::PipxPackage(name) => write!(f, "PipxPackage({name})"),
            Probe::Path(path) => write!(f, "Path({})", path.display()),
            Probe::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Probe {
    pub fn custom(f: impl Fn(&VerifyContext<'_>) -> Result<()> + 'static) -> Self {
        Probe::Custom(Box::new(f))
    }
}

#[derive(Debug)]
pub struct VerificationItem {
    pub capability_name: String,
    pub probe: Probe,
}

impl VerificationItem {
    pub fn new(capability_name: impl Into<String>, probe: Probe) -> Self {
        Self {
            capability_name: capability_name.into(),
            probe,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Present,
    Missing,
}

/// Result of probing one [`VerificationItem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verified {
    pub capability_name: String,
    pub status: Presence,
    pub detail: Option<String>,
}

impl Verified {
    pub fn is_present(&self) -> bool {
        self.status == Presence::Present
    }
}

pub struct VerifyContext<'a> {
    pub identity: &'a Identity,
    pub executor: &'a dyn Executor,
}

/// Probe every item. Never fails; a probe error or panic reads as `Missing`.
pub fn verify(items: &[VerificationItem], ctx: &VerifyContext<'_>) -> Vec<Verified> {
    items
        .iter()
        .map(|item| {
            let probed = panic::catch_unwind(AssertUnwindSafe(|| probe(&item.probe, ctx)))
                .unwrap_or_else(|payload| Err(anyhow!("probe panicked: {}", panic_message(&*payload))));
            match probed {
                Ok(()) => Verified {
                    capability_name: item.capability_name.clone(),
                    status: Presence::Present,
                    detail: None,
                },
                Err(err) => Verified {
                    capability_name: item.capability_name.clone(),
                    status: Presence::Missing,
                    detail: Some(format!("{err:#}")),
                },
            }
        })
        .collect()
}

fn probe(probe: &Probe, ctx: &VerifyContext<'_>) -> Result<()> {
    match probe {
        Probe::Binary(name) => {
            which::which_in(name, Some(ctx.identity.path_env()), &ctx.identity.home)
                .with_context(|| format!("'{}' not on {}'s PATH", name, ctx.identity.username))?;
            Ok(())
        }
        Probe::PythonModule { python, module } => {
            let spec = CommandSpec::new(
                python.to_string_lossy(),
                ["-c".to_string(), format!("import {module}")],
            );
            let result = ctx
                .executor
                .run(&spec, ctx.identity)
                .with_context(|| format!("running '{}'", python.display()))?;
            if !result.success() {
                bail!(
                    "cannot import '{}' with '{}'{}",
                    module,
                    python.display(),
                    last_line(&result.stderr)
                );
            }
            Ok(())
        }
        Probe::PipxPackage(name) => {
            let spec = CommandSpec::new("pipx", ["list", "--short"]).as_user();
            let result = ctx
                .executor
                .run(&spec, ctx.identity)
                .context("running 'pipx list --short'")?;
            if !result.success() {
                bail!("pipx list failed with status {}", result.exit_code);
            }
            let listed = result
                .stdout
                .lines()
                .any(|line| line.split_whitespace().next() == Some(name.as_str()));
            if !listed {
                bail!("'{}' is not installed for {}", name, ctx.identity.username);
            }
            Ok(())
        }
        Probe::Path(path) => {
            if !path.exists() {
                bail!("'{}' does not exist", path.display());
            }
            Ok(())
        }
        Probe::Custom(f) => f(ctx),
    }
}

fn last_line(stderr: &str) -> String {
    match stderr.lines().rev().find(|line| !line.trim().is_empty()) {
        Some(line) => format!(": {}", line.trim()),
        None => String::new(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
