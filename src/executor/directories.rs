//! Directory primitives: reset a stale directory, clear a partial checkout.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::files::{ensure_parent, hand_over, Owner};

/// Remove `path` if present and create it empty.
pub fn recreate_dir(path: &Path, owner: Option<Owner>) -> Result<()> {
    remove_dir(path)?;
    ensure_parent(path, owner)?;
    fs::create_dir(path).with_context(|| format!("creating directory '{}'", path.display()))?;
    hand_over(path, owner)
}

/// Remove `path` and everything under it. Missing paths are fine.
pub fn remove_dir(path: &Path) -> Result<()> {
    if path.is_symlink() || path.is_file() {
        return fs::remove_file(path)
            .with_context(|| format!("removing '{}'", path.display()));
    }
    if path.exists() {
        fs::remove_dir_all(path)
            .with_context(|| format!("removing existing directory '{}'", path.display()))?;
    }
    Ok(())
}
