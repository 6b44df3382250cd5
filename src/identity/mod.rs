//! Privilege and target-user resolution.
//!
//! The provisioner runs elevated but installs per-user tooling for the desktop
//! user who invoked it. That user is recovered from what the elevation
//! mechanism records in the environment (`SUDO_USER`, `PKEXEC_UID`) and looked
//! up in the account database. A run that cannot name a non-root target user
//! fails before any step executes.

pub mod passwd;

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use passwd::PasswdEntry;

/// System binary directories appended after the user's own `~/.local/bin`.
pub const SYSTEM_PATH: &[&str] = &[
    "/usr/local/sbin",
    "/usr/local/bin",
    "/usr/sbin",
    "/usr/bin",
    "/sbin",
    "/bin",
    "/snap/bin",
];

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("not running with root privileges (effective uid {euid}); re-run with sudo")]
    NotElevated { euid: u32 },

    #[error("no target user: {reason}")]
    NoTargetUser { reason: String },

    #[error("delegating user '{name}' has no entry in {}", .passwd.display())]
    UnknownUser { name: String, passwd: PathBuf },

    #[error("{var}={found} disagrees with passwd entry for '{user}' ({expected})")]
    Mismatch {
        var: &'static str,
        user: String,
        expected: u32,
        found: String,
    },

    #[error("reading account database: {detail}")]
    Passwd { detail: String },
}

/// Raw privilege state of the current process.
#[derive(Debug, Clone, Default)]
pub struct ProcessIdentity {
    pub euid: u32,
    pub sudo_user: Option<String>,
    pub sudo_uid: Option<String>,
    pub sudo_gid: Option<String>,
    pub pkexec_uid: Option<String>,
}

impl ProcessIdentity {
    /// Snapshot the running process.
    pub fn current() -> Self {
        // SAFETY: geteuid has no preconditions and cannot fail.
        let euid = unsafe { libc::geteuid() };
        Self {
            euid,
            sudo_user: std::env::var("SUDO_USER").ok(),
            sudo_uid: std::env::var("SUDO_UID").ok(),
            sudo_gid: std::env::var("SUDO_GID").ok(),
            pkexec_uid: std::env::var("PKEXEC_UID").ok(),
        }
    }
}

/// The non-privileged user every per-user step acts on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub username: String,
    pub home: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub shell: PathBuf,
}

impl Identity {
    /// Directories searched for executables in the user's eventual shell.
    pub fn search_path(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.home.join(".local/bin")];
        dirs.extend(SYSTEM_PATH.iter().map(PathBuf::from));
        dirs
    }

    /// [`Self::search_path`] joined for a `PATH` variable.
    pub fn path_env(&self) -> String {
        self.search_path()
            .iter()
            .map(|dir| dir.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Expand a leading `~` to the user's home directory.
    pub fn expand(&self, raw: &str) -> PathBuf {
        if raw == "~" {
            return self.home.clone();
        }
        match raw.strip_prefix("~/") {
            Some(rest) => self.home.join(rest),
            None => PathBuf::from(raw),
        }
    }

    /// Whether `path` lives inside the user's home directory.
    pub fn owns(&self, path: &Path) -> bool {
        path.starts_with(&self.home)
    }

    /// Name of the login shell binary (`zsh`, `bash`, ...).
    pub fn shell_name(&self) -> &str {
        self.shell
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("sh")
    }

    fn from_entry(entry: PasswdEntry) -> Self {
        Self {
            username: entry.name,
            home: entry.home,
            uid: entry.uid,
            gid: entry.gid,
            shell: entry.shell,
        }
    }
}

/// Resolve the target user of the running process from the system database.
pub fn resolve() -> Result<Identity, IdentityError> {
    resolve_from(&ProcessIdentity::current(), Path::new(passwd::SYSTEM_PASSWD))
}

/// Resolve the target user from an explicit process snapshot.
pub fn resolve_from(
    process: &ProcessIdentity,
    passwd_path: &Path,
) -> Result<Identity, IdentityError> {
    if process.euid != 0 {
        return Err(IdentityError::NotElevated { euid: process.euid });
    }

    let sudo_user = process
        .sudo_user
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "root");

    let entry = if let Some(name) = sudo_user {
        passwd::lookup_by_name(passwd_path, name)
            .map_err(passwd_error)?
            .ok_or_else(|| IdentityError::UnknownUser {
                name: name.to_string(),
                passwd: passwd_path.to_path_buf(),
            })?
    } else if let Some(raw) = process.pkexec_uid.as_deref() {
        let uid: u32 = raw.trim().parse().map_err(|_| IdentityError::NoTargetUser {
            reason: format!("PKEXEC_UID '{raw}' is not a numeric uid"),
        })?;
        passwd::lookup_by_uid(passwd_path, uid)
            .map_err(passwd_error)?
            .ok_or_else(|| IdentityError::UnknownUser {
                name: format!("uid {uid}"),
                passwd: passwd_path.to_path_buf(),
            })?
    } else {
        return Err(IdentityError::NoTargetUser {
            reason: "no delegating user recorded (SUDO_USER/PKEXEC_UID); \
                     run via sudo from the desktop user's session, not from a root shell"
                .to_string(),
        });
    };

    if entry.uid == 0 {
        return Err(IdentityError::NoTargetUser {
            reason: format!("delegating user '{}' is a superuser account", entry.name),
        });
    }

    check_agrees("SUDO_UID", process.sudo_uid.as_deref(), &entry.name, entry.uid)?;
    check_agrees("SUDO_GID", process.sudo_gid.as_deref(), &entry.name, entry.gid)?;

    Ok(Identity::from_entry(entry))
}

fn check_agrees(
    var: &'static str,
    recorded: Option<&str>,
    user: &str,
    expected: u32,
) -> Result<(), IdentityError> {
    let Some(raw) = recorded else {
        return Ok(());
    };
    if raw.trim().parse::<u32>().ok() == Some(expected) {
        return Ok(());
    }
    Err(IdentityError::Mismatch {
        var,
        user: user.to_string(),
        expected,
        found: raw.to_string(),
    })
}

fn passwd_error(err: anyhow::Error) -> IdentityError {
    IdentityError::Passwd {
        detail: format!("{err:#}"),
    }
}

#[cfg(test)]
pub(crate) fn test_identity(home: &Path) -> Identity {
    Identity {
        username: "alice".into(),
        home: home.to_path_buf(),
        uid: 1000,
        gid: 1000,
        shell: PathBuf::from("/usr/bin/zsh"),
    }
}
