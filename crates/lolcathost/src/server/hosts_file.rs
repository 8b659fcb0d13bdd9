//! The managed region of the system hosts file, and its backups.
//!
//! Everything between the start and end marker belongs to the daemon; every
//! byte outside it is preserved across rewrites. Each rewrite snapshots the
//! whole file into the backup directory first, so any mutation can be undone
//! with a rollback.

use crate::config::Host;
use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, warn};

/// Path to the system hosts file.
pub const HOSTS_PATH: &str = "/etc/hosts";

/// Directory holding hosts-file backups.
pub const BACKUP_DIR: &str = "/var/backups/lolcathost";

/// Retention cap for the backup directory.
pub const MAX_BACKUPS: usize = 10;

const MARKER_START: &str = "# ========== LOLCATHOST MANAGED - DO NOT EDIT ==========";
const MARKER_END: &str = "# ========== END LOLCATHOST ==========";

static ENTRY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+)\s+(\S+)\s+#\s*lolcathost:(\S+)$").unwrap());

#[derive(Debug, Error)]
pub enum HostsFileError {
    #[error("failed to read hosts file: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write hosts file: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to create backup: {0}")]
    Backup(#[source] std::io::Error),

    #[error("invalid backup name: {0}")]
    InvalidBackupName(String),

    #[error("failed to read backup: {0}")]
    BackupRead(#[source] std::io::Error),

    #[error("failed to list backups: {0}")]
    BackupList(#[source] std::io::Error),
}

/// One parsed line from inside the managed region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedEntry {
    pub ip: String,
    pub domain: String,
    pub alias: String,
}

/// A snapshot in the backup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub name: String,
    pub timestamp: i64,
    pub size: u64,
}

/// Reads and rewrites the managed region; owns the backup directory.
pub struct HostsFile {
    hosts_path: PathBuf,
    backup_dir: PathBuf,
}

impl HostsFile {
    /// Manager for the system paths.
    pub fn new() -> Self {
        Self {
            hosts_path: PathBuf::from(HOSTS_PATH),
            backup_dir: PathBuf::from(BACKUP_DIR),
        }
    }

    /// Manager with custom paths, for tests.
    pub fn with_paths(hosts_path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            hosts_path: hosts_path.into(),
            backup_dir: backup_dir.into(),
        }
    }

    /// Parses the managed region. Lines that do not match the entry format
    /// are ignored.
    pub fn read_managed_entries(&self) -> Result<Vec<ManagedEntry>, HostsFileError> {
        let content = std::fs::read_to_string(&self.hosts_path).map_err(HostsFileError::Read)?;

        let mut entries = Vec::new();
        let mut in_section = false;
        for line in content.lines() {
            let line = line.trim();
            if line == MARKER_START {
                in_section = true;
                continue;
            }
            if line == MARKER_END {
                in_section = false;
                continue;
            }
            if in_section && !line.starts_with('#') && !line.is_empty() {
                if let Some(caps) = ENTRY_REGEX.captures(line) {
                    entries.push(ManagedEntry {
                        ip: caps[1].to_string(),
                        domain: caps[2].to_string(),
                        alias: caps[3].to_string(),
                    });
                }
            }
        }
        Ok(entries)
    }

    /// Rewrites the managed region to hold exactly the enabled entries, in
    /// order. Snapshots the current file into the backup directory first and
    /// replaces the hosts file atomically via rename.
    pub fn write_managed_entries(&self, entries: &[Host]) -> Result<(), HostsFileError> {
        self.create_backup()?;

        let content = std::fs::read_to_string(&self.hosts_path).map_err(HostsFileError::Read)?;
        let body = remove_managed_section(&content);
        let section = build_managed_section(entries);
        let new_content = format!("{}\n\n{}", body.trim_end_matches('\n'), section);

        self.write_atomic(&new_content)
    }

    /// Snapshots the current hosts file as `hosts.<timestamp>.bak`, creating
    /// the backup directory if needed, then rotates old backups past the
    /// retention cap. Rotation failure is logged, never fatal.
    pub fn create_backup(&self) -> Result<PathBuf, HostsFileError> {
        std::fs::create_dir_all(&self.backup_dir).map_err(HostsFileError::Backup)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(
                &self.backup_dir,
                std::fs::Permissions::from_mode(0o755),
            );
        }

        let content = std::fs::read(&self.hosts_path).map_err(HostsFileError::Read)?;
        let name = format!("hosts.{}.bak", Utc::now().format("%Y%m%d-%H%M%S"));
        let path = self.backup_dir.join(&name);
        std::fs::write(&path, content).map_err(HostsFileError::Backup)?;
        set_file_mode(&path, 0o644);
        debug!(backup = %path.display(), "hosts file backed up");

        if let Err(err) = self.rotate_backups() {
            warn!(error = %err, "failed to rotate backups");
        }
        Ok(path)
    }

    fn rotate_backups(&self) -> std::io::Result<()> {
        let mut names = self.backup_names()?;
        if names.len() <= MAX_BACKUPS {
            return Ok(());
        }
        // Name sort descending: the timestamp format makes newest-first.
        names.sort_by(|a, b| b.cmp(a));
        for name in &names[MAX_BACKUPS..] {
            let _ = std::fs::remove_file(self.backup_dir.join(name));
        }
        Ok(())
    }

    fn backup_names(&self) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("hosts.") && name.ends_with(".bak") {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Lists backups, newest first. A missing backup directory is an empty
    /// list, not an error.
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>, HostsFileError> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for name in self.backup_names().map_err(HostsFileError::BackupList)? {
            let path = self.backup_dir.join(&name);
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            let timestamp = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            backups.push(BackupRecord {
                name,
                timestamp,
                size: meta.len(),
            });
        }

        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.name.cmp(&a.name)));
        Ok(backups)
    }

    /// Restores a backup over the hosts file, taking a fresh backup of the
    /// current state first.
    pub fn restore_backup(&self, name: &str) -> Result<(), HostsFileError> {
        validate_backup_name(name)?;

        let content = std::fs::read_to_string(self.backup_dir.join(name))
            .map_err(HostsFileError::BackupRead)?;

        self.create_backup()?;
        self.write_atomic(&content)
    }

    /// Returns the raw content of a backup.
    pub fn read_backup(&self, name: &str) -> Result<String, HostsFileError> {
        validate_backup_name(name)?;
        std::fs::read_to_string(self.backup_dir.join(name)).map_err(HostsFileError::BackupRead)
    }

    fn write_atomic(&self, content: &str) -> Result<(), HostsFileError> {
        let mut tmp = self.hosts_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, content).map_err(HostsFileError::Write)?;
        set_file_mode(&tmp, 0o644);

        if let Err(err) = std::fs::rename(&tmp, &self.hosts_path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(HostsFileError::Write(err));
        }
        Ok(())
    }
}

impl Default for HostsFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Rejects anything that is not a bare `hosts.*.bak` basename.
fn validate_backup_name(name: &str) -> Result<(), HostsFileError> {
    let is_bare = Path::new(name)
        .file_name()
        .is_some_and(|base| base == name);
    if !is_bare || !name.starts_with("hosts.") || !name.ends_with(".bak") {
        return Err(HostsFileError::InvalidBackupName(name.to_string()));
    }
    Ok(())
}

/// Drops every span between any start and end marker, inclusive, then trims
/// trailing blank lines.
fn remove_managed_section(content: &str) -> String {
    let mut result: Vec<&str> = Vec::new();
    let mut in_section = false;
    for line in content.split('\n') {
        let trimmed = line.trim();
        if trimmed == MARKER_START {
            in_section = true;
            continue;
        }
        if trimmed == MARKER_END {
            in_section = false;
            continue;
        }
        if !in_section {
            result.push(line);
        }
    }
    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }
    result.join("\n")
}

fn build_managed_section(entries: &[Host]) -> String {
    let mut section = String::new();
    section.push_str(MARKER_START);
    section.push('\n');
    for entry in entries.iter().filter(|e| e.enabled) {
        section.push_str(&format!(
            "{}\t{}\t# lolcathost:{}\n",
            entry.ip, entry.domain, entry.alias
        ));
    }
    section.push_str(MARKER_END);
    section.push('\n');
    section
}

fn set_file_mode(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
}
