//! Single-run lock.
//!
//! Two provisioning runs against the same host would race on apt's own lock,
//! the shell profile and the shared venv. The second one refuses to start.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fs2::FileExt;

const LOCK_FILENAME: &str = "provision.lock";

/// Held for the duration of a run; released on drop.
#[derive(Debug)]
pub struct RunLock {
    _file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the exclusive lock under `state_dir` without blocking.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("creating state directory '{}'", state_dir.display()))?;
        let path = state_dir.join(LOCK_FILENAME);

        // The file stays on disk after release: unlinking it while another
        // process waits on it would let two runs hold "the" lock at once.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening lock file '{}'", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            drop(file);
            bail!(
                "another desk-provision run holds '{}'; wait for it to finish",
                path.display()
            );
        }

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let temp = TempDir::new().unwrap();
        let first = RunLock::acquire(temp.path()).unwrap();

        let err = RunLock::acquire(temp.path()).unwrap_err();

        assert!(err.to_string().contains("another desk-provision run"));
        assert!(first.path().ends_with(LOCK_FILENAME));
    }

    #[test]
    fn test_lock_released_on_drop_and_file_kept() {
        let temp = TempDir::new().unwrap();
        let state = temp.path().join("var/lib/desk-provision");

        drop(RunLock::acquire(&state).unwrap());

        assert!(state.join(LOCK_FILENAME).exists());
        assert!(RunLock::acquire(&state).is_ok());
    }
}
