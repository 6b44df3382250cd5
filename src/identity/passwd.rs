//! Account lookups against a passwd-format database.
//!
//! The resolver only needs the delegating user's uid, gid, home and shell, so
//! this reads the flat file directly instead of going through NSS.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Default system account database.
pub const SYSTEM_PASSWD: &str = "/etc/passwd";

/// One account record from a passwd file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: PathBuf,
}

/// Find an account by login name.
///
/// Returns:
/// - Ok(Some(entry)) if the account is present
/// - Ok(None) if the account is absent or the file doesn't exist
/// - Err if the file exists but is unreadable or the matching record is corrupted
pub fn lookup_by_name(passwd_path: &Path, username: &str) -> Result<Option<PasswdEntry>> {
    find_entry(passwd_path, |fields| fields[0] == username)
}

/// Find an account by numeric uid. Same return contract as [`lookup_by_name`].
pub fn lookup_by_uid(passwd_path: &Path, uid: u32) -> Result<Option<PasswdEntry>> {
    let wanted = uid.to_string();
    find_entry(passwd_path, |fields| fields[2] == wanted)
}

fn find_entry(
    passwd_path: &Path,
    matches: impl Fn(&[&str]) -> bool,
) -> Result<Option<PasswdEntry>> {
    // A missing database just means the account doesn't exist
    if !passwd_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(passwd_path)
        .with_context(|| format!("reading passwd file '{}'", passwd_path.display()))?;

    for line in content.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 || !matches(&fields) {
            continue;
        }
        return parse_entry(&fields, passwd_path).map(Some);
    }
    Ok(None)
}

fn parse_entry(fields: &[&str], passwd_path: &Path) -> Result<PasswdEntry> {
    let uid: u32 = fields[2].parse().with_context(|| {
        format!(
            "corrupted passwd file: invalid UID '{}' for user '{}' at {}",
            fields[2],
            fields[0],
            passwd_path.display()
        )
    })?;
    let gid: u32 = fields[3].parse().with_context(|| {
        format!(
            "corrupted passwd file: invalid GID '{}' for user '{}' at {}",
            fields[3],
            fields[0],
            passwd_path.display()
        )
    })?;
    Ok(PasswdEntry {
        name: fields[0].to_string(),
        uid,
        gid,
        home: PathBuf::from(fields[5]),
        shell: PathBuf::from(fields[6]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_passwd(content: &str) -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("passwd");
        fs::write(&path, content).unwrap();
        (temp, path)
    }

    #[test]
    fn test_lookup_by_name() {
        let (_temp, path) = write_passwd(
            "root:x:0:0:root:/root:/bin/bash\nalice:x:1000:1000:Alice,,,:/home/alice:/usr/bin/zsh\n",
        );

        let alice = lookup_by_name(&path, "alice").unwrap().unwrap();
        assert_eq!(alice.uid, 1000);
        assert_eq!(alice.gid, 1000);
        assert_eq!(alice.home, PathBuf::from("/home/alice"));
        assert_eq!(alice.shell, PathBuf::from("/usr/bin/zsh"));

        assert_eq!(lookup_by_name(&path, "bob").unwrap(), None);
    }

    #[test]
    fn test_lookup_by_name_requires_full_match() {
        let (_temp, path) = write_passwd("alice2:x:1001:1001::/home/alice2:/bin/sh\n");
        assert_eq!(lookup_by_name(&path, "alice").unwrap(), None);
    }

    #[test]
    fn test_lookup_by_uid() {
        let (_temp, path) = write_passwd(
            "root:x:0:0:root:/root:/bin/bash\nbob:x:1002:100::/home/bob:/bin/bash\n",
        );

        let bob = lookup_by_uid(&path, 1002).unwrap().unwrap();
        assert_eq!(bob.name, "bob");
        assert_eq!(bob.gid, 100);
        assert_eq!(lookup_by_uid(&path, 4242).unwrap(), None);
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        let result = lookup_by_name(&temp.path().join("nope"), "alice").unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_corrupted_uid_fails_fast() {
        let (_temp, path) = write_passwd("alice:x:abc:1000::/home/alice:/bin/sh\n");
        let err = lookup_by_name(&path, "alice").unwrap_err();
        assert!(err.to_string().contains("invalid UID"));
    }

    #[test]
    fn test_skips_comments_and_short_lines() {
        let (_temp, path) =
            write_passwd("# managed\nbroken:x:1\ncarol:x:1003:1003::/home/carol:/bin/sh\n");
        let carol = lookup_by_name(&path, "carol").unwrap().unwrap();
        assert_eq!(carol.uid, 1003);
    }
}
