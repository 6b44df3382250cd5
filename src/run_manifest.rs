//! Record of the last provisioning run.
//!
//! Written after every run for the operator and support tooling. Nothing in
//! this crate reads it back: idempotency comes from each step's check, never
//! from a record of what ran before.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::step::{RunResult, StepOutcome};
use crate::verify::Verified;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn of(run: &RunResult) -> Self {
        if run.cancelled {
            RunStatus::Interrupted
        } else if run.aborted {
            RunStatus::Failed
        } else {
            RunStatus::Success
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunManifest<'a> {
    pub run_id: &'a str,
    pub status: RunStatus,
    pub mode: &'a str,
    pub plan: &'a str,
    pub target_user: &'a str,
    pub created_at_utc: &'a str,
    pub finished_at_utc: &'a str,
    pub outcomes: &'a [StepOutcome],
    pub verification: &'a [Verified],
}

pub fn manifest_path(state_dir: &Path) -> PathBuf {
    state_dir.join(RUN_MANIFEST_FILENAME)
}

/// Replace the manifest under `state_dir`.
pub fn write(state_dir: &Path, manifest: &RunManifest<'_>) -> Result<PathBuf> {
    let path = manifest_path(state_dir);
    write_json_atomic(&path, manifest)
        .with_context(|| format!("writing run manifest '{}'", path.display()))?;
    Ok(path)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing run manifest")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepStatus;
    use crate::verify::Presence;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_written_as_json() {
        let temp = TempDir::new().unwrap();
        let run = RunResult {
            outcomes: vec![StepOutcome {
                step_name: "apt: base system".into(),
                status: StepStatus::FailedFatal,
                detail: Some("gave up after 5 attempts: x".into()),
                attempts: 5,
            }],
            aborted: true,
            cancelled: false,
        };
        let verified = vec![Verified {
            capability_name: "nmap".into(),
            status: Presence::Missing,
            detail: None,
        }];

        let path = write(
            temp.path(),
            &RunManifest {
                run_id: "20261019T081502Z",
                status: RunStatus::of(&run),
                mode: "provision",
                plan: "<built-in plan>",
                target_user: "alice",
                created_at_utc: "2026-10-19T08:15:02Z",
                finished_at_utc: "2026-10-19T08:40:11Z",
                outcomes: &run.outcomes,
                verification: &verified,
            },
        )
        .unwrap();

        let json: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["outcomes"][0]["status"], "failed_fatal");
        assert_eq!(json["outcomes"][0]["attempts"], 5);
        assert_eq!(json["verification"][0]["status"], "missing");
        assert!(!temp.path().join("run-manifest.tmp-0").exists());
    }

    #[test]
    fn test_status_precedence() {
        let mut run = RunResult::default();
        assert_eq!(RunStatus::of(&run), RunStatus::Success);
        run.aborted = true;
        assert_eq!(RunStatus::of(&run), RunStatus::Failed);
        run.cancelled = true;
        assert_eq!(RunStatus::of(&run), RunStatus::Interrupted);
    }
}
