//! Operator-facing status lines, mirrored into the install log file.
//!
//! Every event is one tagged line on the console (`[desk-provision] [ OK ] ...`)
//! and the same line, timestamped, in the log file. Captured command output
//! only goes to the file.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use console::style;
use time::OffsetDateTime;

const PREFIX: &str = "[desk-provision]";
const FALLBACK_NAME: &str = "desk-provision.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Ok,
    Skip,
    Warn,
    Fail,
    Stop,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Info => "[INFO]",
            Level::Ok => "[ OK ]",
            Level::Skip => "[SKIP]",
            Level::Warn => "[WARN]",
            Level::Fail => "[FAIL]",
            Level::Stop => "[STOP]",
        }
    }

    fn painted(self, color: bool) -> String {
        if !color {
            return self.tag().to_string();
        }
        let tag = style(self.tag());
        match self {
            Level::Info => tag.cyan(),
            Level::Ok => tag.green(),
            Level::Skip => tag.dim(),
            Level::Warn => tag.yellow(),
            Level::Fail => tag.red().bold(),
            Level::Stop => tag.magenta().bold(),
        }
        .force_styling(true)
        .to_string()
    }
}

/// Console + file sink for one run.
#[derive(Debug, Default)]
pub struct InstallLog {
    file: Option<File>,
    path: Option<PathBuf>,
    color: bool,
    echo: bool,
}

impl InstallLog {
    /// Open `preferred` for append, falling back to the temp directory.
    ///
    /// Never fails: with neither location writable the run logs to the
    /// console only.
    pub fn open(preferred: &Path, color: bool) -> Self {
        let mut log = Self {
            file: None,
            path: None,
            color,
            echo: true,
        };
        let fallback = std::env::temp_dir().join(FALLBACK_NAME);
        for candidate in [preferred, fallback.as_path()] {
            match open_append(candidate) {
                Ok(file) => {
                    log.file = Some(file);
                    log.path = Some(candidate.to_path_buf());
                    break;
                }
                Err(err) => log.warn(format!(
                    "cannot write install log '{}': {err}",
                    candidate.display()
                )),
            }
        }
        log
    }

    /// Discard everything. Used where output is irrelevant (tests, previews).
    pub fn silent() -> Self {
        Self::default()
    }

    /// File-only log, nothing echoed.
    pub fn file_only(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            file: Some(open_append(path)?),
            path: Some(path.to_path_buf()),
            color: false,
            echo: false,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn color(&self) -> bool {
        self.color
    }

    pub fn info(&self, msg: impl fmt::Display) {
        self.line(Level::Info, msg);
    }

    pub fn ok(&self, msg: impl fmt::Display) {
        self.line(Level::Ok, msg);
    }

    pub fn skip(&self, msg: impl fmt::Display) {
        self.line(Level::Skip, msg);
    }

    pub fn warn(&self, msg: impl fmt::Display) {
        self.line(Level::Warn, msg);
    }

    pub fn fail(&self, msg: impl fmt::Display) {
        self.line(Level::Fail, msg);
    }

    pub fn stop(&self, msg: impl fmt::Display) {
        self.line(Level::Stop, msg);
    }

    /// One tagged status line.
    pub fn line(&self, level: Level, msg: impl fmt::Display) {
        if self.echo {
            let text = format!("{PREFIX} {} {msg}", level.painted(self.color));
            match level {
                Level::Warn | Level::Fail | Level::Stop => eprintln!("{text}"),
                _ => println!("{text}"),
            }
        }
        self.write_file(&format!("{} {PREFIX} {} {msg}", now_utc_rfc3339(), level.tag()));
    }

    /// Multi-line detail (command output) recorded in the file only.
    pub fn detail(&self, text: &str) {
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            self.write_file(&format!("    | {line}"));
        }
    }

    fn write_file(&self, line: &str) {
        if let Some(mut file) = self.file.as_ref() {
            // A full disk must not take the run down with it.
            let _ = writeln!(file, "{line}");
        }
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// `2026-10-19T08:15:02Z`
pub fn now_utc_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// `20261019T081502Z`, used as a run id.
pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_log_records_tagged_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("install.log");
        let log = InstallLog::file_only(&path).unwrap();

        log.ok("apt: base packages");
        log.fail("pipx: netexec (exit 1)");
        log.detail("line one\n\nline two\n");

        let written = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("[desk-provision] [ OK ] apt: base packages"));
        assert!(lines[1].contains("[FAIL] pipx: netexec (exit 1)"));
        assert_eq!(lines[2], "    | line one");
        assert_eq!(lines[3], "    | line two");
    }

    #[test]
    fn test_open_falls_back_when_preferred_unwritable() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();

        let log = InstallLog::open(&blocker.join("install.log"), false);

        let expected = std::env::temp_dir().join(FALLBACK_NAME);
        assert_eq!(log.path(), Some(expected.as_path()));
    }

    #[test]
    fn test_open_appends_rather_than_truncates() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("install.log");
        fs::write(&path, "previous run\n").unwrap();

        let log = InstallLog::file_only(&path).unwrap();
        log.info("second run");

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("previous run\n"));
        assert!(written.contains("second run"));
    }

    #[test]
    fn test_plain_tags_have_no_escape_codes() {
        assert_eq!(Level::Warn.painted(false), "[WARN]");
        assert!(Level::Warn.painted(true).contains('\u{1b}'));
    }

    #[test]
    fn test_timestamp_shapes() {
        assert_eq!(now_utc_rfc3339().len(), 20);
        assert_eq!(now_utc_compact().len(), 16);
    }
}
