//! Preflight checks run before any step.
//!
//! Validates that the host can complete a provisioning run: the package
//! mirrors are reachable, there is room on disk, and the package managers the
//! plan drives are installed. This prevents a run that dies halfway through
//! with a cryptic mirror error.
//!
//! # Example
//!
//! ```rust
//! use desk_provision::preflight::{command_exists, check_required_tools};
//!
//! // Check a single command
//! if !command_exists("pipx") {
//!     println!("pipx not installed");
//! }
//!
//! // Check multiple tools
//! let tools = &[("git", "git"), ("python3", "python3")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use std::ffi::CString;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const GIB: u64 = 1024 * 1024 * 1024;

/// Check if a command exists on the host system.
///
/// Uses `which` to locate the command in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools the built-in plan drives.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("apt-get", "apt"),
    ("dpkg-query", "dpkg"),
    ("python3", "python3"),
    ("git", "git"),
    ("sh", "dash"),
];

/// Check that specific tools are available.
///
/// # Arguments
///
/// * `tools` - Slice of (command, package) tuples
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools<T: AsRef<str>>(tools: &[(T, T)]) -> Result<()> {
    let missing: Vec<(&str, &str)> = tools
        .iter()
        .map(|(tool, package)| (tool.as_ref(), package.as_ref()))
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// What low disk space does to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskPolicy {
    /// Report it and continue.
    #[default]
    Warn,
    /// Refuse to start.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightConfig {
    /// `host:port` that must accept a TCP connection. `None` skips the probe.
    pub network_probe: Option<String>,
    pub network_timeout: Duration,
    /// Filesystem whose free space is checked.
    pub disk_path: PathBuf,
    pub min_free_gb: u64,
    pub disk_policy: DiskPolicy,
    /// (command, package) pairs; a missing tool is a warning.
    pub required_tools: Vec<(String, String)>,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            network_probe: Some("deb.debian.org:80".to_string()),
            network_timeout: Duration::from_secs(10),
            disk_path: PathBuf::from("/"),
            min_free_gb: 10,
            disk_policy: DiskPolicy::Warn,
            required_tools: REQUIRED_TOOLS
                .iter()
                .map(|(tool, package)| (tool.to_string(), package.to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("network unreachable: cannot connect to {target}: {detail}")]
    NoNetwork { target: String, detail: String },

    #[error("only {free_gb} GiB free on {}, at least {need_gb} GiB required", .path.display())]
    InsufficientDisk {
        path: PathBuf,
        free_gb: u64,
        need_gb: u64,
    },
}

/// Non-fatal findings, carried into the final report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    pub warnings: Vec<String>,
}

/// Run every check in `config`.
pub fn run(config: &PreflightConfig) -> Result<PreflightReport, PreflightError> {
    let mut report = PreflightReport::default();

    if let Some(target) = &config.network_probe {
        check_network(target, config.network_timeout)?;
    }

    match free_bytes(&config.disk_path) {
        Ok(free) => {
            let free_gb = free / GIB;
            if free_gb < config.min_free_gb {
                let err = PreflightError::InsufficientDisk {
                    path: config.disk_path.clone(),
                    free_gb,
                    need_gb: config.min_free_gb,
                };
                match config.disk_policy {
                    DiskPolicy::Fatal => return Err(err),
                    DiskPolicy::Warn => report.warnings.push(err.to_string()),
                }
            }
        }
        Err(err) => report.warnings.push(format!(
            "cannot determine free space on {}: {err}",
            config.disk_path.display()
        )),
    }

    if let Err(err) = check_required_tools(&config.required_tools) {
        report.warnings.push(err.to_string());
    }

    Ok(report)
}

/// Open (and drop) a TCP connection to `target`.
pub fn check_network(target: &str, timeout: Duration) -> Result<(), PreflightError> {
    let unreachable = |detail: String| PreflightError::NoNetwork {
        target: target.to_string(),
        detail,
    };
    let addrs: Vec<_> = target
        .to_socket_addrs()
        .map_err(|err| unreachable(format!("resolving: {err}")))?
        .collect();

    let mut last = String::from("no addresses");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return Ok(()),
            Err(err) => last = format!("{addr}: {err}"),
        }
    }
    Err(unreachable(last))
}

/// Bytes available to unprivileged users on the filesystem holding `path`.
#[allow(clippy::unnecessary_cast)]
pub fn free_bytes(path: &Path) -> io::Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    // SAFETY: statvfs is plain old data; the kernel fills it on success.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}
