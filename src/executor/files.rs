//! File primitives: whole-file writes and delimited profile blocks.
//!
//! Both keep the target syntactically valid if the process dies midway.
//! Whole files are written to a sibling temp file and renamed into place;
//! profile blocks are only ever appended.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::identity::Identity;

const BLOCK_TAG: &str = "desk-provision";

/// Numeric owner handed files created under a user's home.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl From<&Identity> for Owner {
    fn from(identity: &Identity) -> Self {
        Self {
            uid: identity.uid,
            gid: identity.gid,
        }
    }
}

/// Result of [`write_file_atomic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Unchanged,
    Created,
    /// Replaced a file with different content; the old one was kept here.
    Replaced { backup: PathBuf },
}

/// Opening delimiter of a managed block.
pub fn block_start(marker: &str) -> String {
    format!("# >>> {BLOCK_TAG}:{marker} >>>")
}

/// Closing delimiter of a managed block.
pub fn block_end(marker: &str) -> String {
    format!("# <<< {BLOCK_TAG}:{marker} <<<")
}

/// Whether `path` already carries the managed block named `marker`.
pub fn has_block(path: &Path, marker: &str) -> bool {
    let start = block_start(marker);
    fs::read_to_string(path)
        .map(|content| content.lines().any(|line| line.trim_end() == start))
        .unwrap_or(false)
}

/// Whether `path` exists with exactly `content`.
pub fn file_matches(path: &Path, content: &str) -> bool {
    fs::read(path)
        .map(|existing| existing == content.as_bytes())
        .unwrap_or(false)
}

/// Append a delimited block to `path` unless it is already present.
///
/// Returns `false` when the block was already there. The file is never
/// truncated or rewritten.
pub fn append_block(path: &Path, marker: &str, content: &str, owner: Option<Owner>) -> Result<bool> {
    if has_block(path, marker) {
        return Ok(false);
    }
    ensure_parent(path, owner)?;

    let existed = path.exists();
    let needs_newline = existed
        && fs::read(path)
            .with_context(|| format!("reading '{}'", path.display()))?
            .last()
            .is_some_and(|byte| *byte != b'\n');

    let mut block = String::new();
    if needs_newline {
        block.push('\n');
    }
    block.push('\n');
    block.push_str(&block_start(marker));
    block.push('\n');
    block.push_str(content.trim_end_matches('\n'));
    block.push('\n');
    block.push_str(&block_end(marker));
    block.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening '{}' for append", path.display()))?;
    file.write_all(block.as_bytes())
        .with_context(|| format!("appending block '{marker}' to '{}'", path.display()))?;

    if !existed {
        hand_over(path, owner)?;
    }
    Ok(true)
}

/// Replace `path` with `content` via a sibling temp file and rename.
///
/// An existing file with different content is preserved as `<path>.bak`.
pub fn write_file_atomic(
    path: &Path,
    content: &str,
    mode: Option<u32>,
    owner: Option<Owner>,
) -> Result<WriteOutcome> {
    if file_matches(path, content) {
        return Ok(WriteOutcome::Unchanged);
    }
    ensure_parent(path, owner)?;

    let backup = if path.exists() {
        let backup = sibling(path, ".bak");
        fs::copy(path, &backup).with_context(|| {
            format!(
                "backing up '{}' to '{}'",
                path.display(),
                backup.display()
            )
        })?;
        hand_over(&backup, owner)?;
        Some(backup)
    } else {
        None
    };

    let tmp = sibling(path, ".desk-provision.tmp");
    fs::write(&tmp, content).with_context(|| format!("writing '{}'", tmp.display()))?;
    if let Some(mode) = mode {
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))
            .with_context(|| format!("setting mode {mode:o} on '{}'", tmp.display()))?;
    }
    hand_over(&tmp, owner)?;
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming '{}' -> '{}'", tmp.display(), path.display()))?;

    Ok(match backup {
        Some(backup) => WriteOutcome::Replaced { backup },
        None => WriteOutcome::Created,
    })
}

/// Create missing ancestors of `path`, handing each new one to `owner`.
pub fn ensure_parent(path: &Path, owner: Option<Owner>) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let mut missing = Vec::new();
    let mut cursor = Some(parent);
    while let Some(dir) = cursor {
        if dir.as_os_str().is_empty() || dir.exists() {
            break;
        }
        missing.push(dir.to_path_buf());
        cursor = dir.parent();
    }
    for dir in missing.iter().rev() {
        fs::create_dir(dir).with_context(|| format!("creating directory '{}'", dir.display()))?;
        hand_over(dir, owner)?;
    }
    Ok(())
}

/// Give `path` to `owner`. Only root can change ownership, so this is a
/// no-op when not elevated.
pub fn hand_over(path: &Path, owner: Option<Owner>) -> Result<()> {
    let Some(owner) = owner else {
        return Ok(());
    };
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } != 0 {
        return Ok(());
    }
    std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid)).with_context(|| {
        format!(
            "changing owner of '{}' to {}:{}",
            path.display(),
            owner.uid,
            owner.gid
        )
    })
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}
