//! Wire protocol between client and daemon.
//!
//! Framing is line-oriented: one JSON request document per line, one JSON
//! response document per line, strictly sequential per connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Unix socket path for daemon communication.
pub const SOCKET_PATH: &str = "/var/run/lolcathost.sock";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("no payload in request")]
    MissingPayload,

    #[error("no data in response")]
    MissingData,

    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Operation tokens recognized by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Ping,
    Status,
    List,
    Set,
    Add,
    Delete,
    Sync,
    Preset,
    Rollback,
    Backups,
    BackupContent,
    AddGroup,
    DeleteGroup,
    RenameGroup,
    ListGroups,
    AddPreset,
    DeletePreset,
    ListPresets,
}

/// Error-code alphabet carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    InvalidDomain,
    InvalidIp,
    BlockedDomain,
    RateLimited,
    Unauthorized,
    NotFound,
    Conflict,
    InternalError,
    PermissionError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::InvalidDomain => "INVALID_DOMAIN",
            ErrorCode::InvalidIp => "INVALID_IP",
            ErrorCode::BlockedDomain => "BLOCKED_DOMAIN",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::PermissionError => "PERMISSION_ERROR",
        };
        f.write_str(token)
    }
}

/// A client request to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub request_type: RequestType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Request {
    /// Build a request without a payload.
    pub fn new(request_type: RequestType) -> Self {
        Self {
            request_type,
            payload: None,
        }
    }

    /// Build a request carrying a typed payload.
    pub fn with_payload<T: Serialize>(
        request_type: RequestType,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            request_type,
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// Deserialize the payload into the expected type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        let payload = self.payload.clone().ok_or(ProtocolError::MissingPayload)?;
        Ok(serde_json::from_value(payload)?)
    }
}

/// A daemon response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl Response {
    /// Success response with typed data.
    pub fn ok<T: Serialize>(data: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            status: "ok".to_string(),
            data: Some(serde_json::to_value(data)?),
            message: None,
            code: None,
        })
    }

    /// Success response without data.
    pub fn ok_empty() -> Self {
        Self {
            status: "ok".to_string(),
            data: None,
            message: None,
            code: None,
        }
    }

    /// Error response with a code and a human-readable message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            message: Some(message.into()),
            code: Some(code),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Deserialize the data document into the expected type.
    pub fn parse_data<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        let data = self.data.clone().ok_or(ProtocolError::MissingData)?;
        Ok(serde_json::from_value(data)?)
    }
}

// Payloads

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPayload {
    pub alias: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPayload {
    pub domain: String,
    pub ip: String,
    #[serde(default)]
    pub alias: String,
    pub group: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePayload {
    pub alias: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetPayload {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPayload {
    pub backup_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupContentPayload {
    pub backup_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupPayload {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameGroupPayload {
    pub old_name: String,
    pub new_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPresetPayload {
    pub name: String,
    #[serde(default)]
    pub enable: Vec<String>,
    #[serde(default)]
    pub disable: Vec<String>,
}

// Response data

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub running: bool,
    pub version: String,
    #[serde(rename = "uptime_seconds")]
    pub uptime: i64,
    pub active_count: usize,
    pub request_count: u64,
}

/// A host entry as reported over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub domain: String,
    pub ip: String,
    pub alias: String,
    pub enabled: bool,
    pub group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListData {
    pub entries: Vec<HostEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetData {
    pub domain: String,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsData {
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetInfo {
    pub name: String,
    #[serde(default)]
    pub enable: Vec<String>,
    #[serde(default)]
    pub disable: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetsData {
    pub presets: Vec<PresetInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub name: String,
    pub timestamp: i64,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupsData {
    pub backups: Vec<BackupInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupContentData {
    pub content: String,
}
