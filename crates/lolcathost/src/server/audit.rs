//! Append-only audit log of privileged actions.
//!
//! One JSON record per line. Opening the log is fatal at daemon startup;
//! individual write failures are dropped so auditing can never fail the
//! operation being audited.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::Path;
use tokio::sync::Mutex;

/// Path of the system audit log.
pub const AUDIT_LOG_PATH: &str = "/var/log/lolcathost/audit.log";

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub uid: u32,
    pub pid: i32,
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,

    pub success: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

pub struct AuditLog {
    file: Mutex<std::fs::File>,
}

impl AuditLog {
    /// Opens (creating if needed) the audit log, 0644 in a 0755 directory.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
            set_mode(dir, 0o755);
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        set_mode(path, 0o644);
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Appends one record. Serialization and write failures are discarded.
    pub async fn record(
        &self,
        uid: u32,
        pid: i32,
        action: &str,
        details: Option<Value>,
        success: bool,
        error: &str,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            uid,
            pid,
            action: action.to_string(),
            details,
            success,
            error: error.to_string(),
        };
        let Ok(mut line) = serde_json::to_string(&entry) else {
            return;
        };
        line.push('\n');

        let mut file = self.file.lock().await;
        let _ = file.write_all(line.as_bytes());
    }
}

fn set_mode(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
}
