use lolcathost_common::protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Generic failure exit code.
pub const EXIT_ERROR: u8 = 1;

/// Usage / bad-request exit code.
pub const EXIT_USAGE: u8 = 2;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("connection closed by daemon")]
    Disconnected,

    #[error("failed to reach daemon: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed response: {0}")]
    Protocol(#[from] ProtocolError),

    /// The daemon answered with an error response.
    #[error("{code}: {message}")]
    Server { code: ErrorCode, message: String },
}

impl ClientError {
    /// Maps the failure to a process exit code.
    pub fn exit_code(&self) -> u8 {
        match self {
            ClientError::Server {
                code: ErrorCode::InvalidRequest,
                ..
            } => EXIT_USAGE,
            _ => EXIT_ERROR,
        }
    }
}
