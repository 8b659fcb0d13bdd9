//! Blocking request/response client for the daemon socket.
//!
//! One connection carries one in-flight request at a time; an internal
//! mutex serializes callers. The configured timeout applies to each
//! request/response exchange via socket deadlines. A timed-out exchange
//! leaves the connection in an unknown state; callers should reconnect.

use super::error::ClientError;
use lolcathost_common::protocol::{
    AddPayload, AddPresetPayload, BackupContentData, BackupContentPayload, BackupInfo,
    BackupsData, DeletePayload, ErrorCode, GroupPayload, GroupsData, HostEntry, ListData,
    PresetInfo, PresetPayload, PresetsData, RenameGroupPayload, Request, RequestType, Response,
    RollbackPayload, SetData, SetPayload, StatusData,
};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

struct Connection {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

pub struct Client {
    socket_path: PathBuf,
    timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl Client {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self::with_timeout(socket_path, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
            conn: Mutex::new(None),
        }
    }

    /// Opens the socket, replacing any existing connection. Read and write
    /// deadlines are set to the configured timeout.
    pub fn connect(&self) -> Result<(), ClientError> {
        let stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        let reader = BufReader::new(stream.try_clone()?);

        let mut conn = self.conn.lock().expect("client mutex poisoned");
        *conn = Some(Connection { stream, reader });
        Ok(())
    }

    pub fn close(&self) {
        let mut conn = self.conn.lock().expect("client mutex poisoned");
        *conn = None;
    }

    /// One framed exchange: write the request line, read the response line.
    fn send(&self, req: &Request) -> Result<Response, ClientError> {
        let mut guard = self.conn.lock().expect("client mutex poisoned");
        let conn = guard.as_mut().ok_or(ClientError::NotConnected)?;

        let mut data = serde_json::to_vec(req)?;
        data.push(b'\n');
        conn.stream.write_all(&data)?;

        let mut line = String::new();
        conn.reader.read_line(&mut line)?;
        if line.is_empty() {
            return Err(ClientError::Disconnected);
        }
        Ok(serde_json::from_str(&line)?)
    }

    fn expect_ok(&self, req: &Request) -> Result<Response, ClientError> {
        let resp = self.send(req)?;
        if resp.is_ok() {
            Ok(resp)
        } else {
            Err(ClientError::Server {
                code: resp.code.unwrap_or(ErrorCode::InternalError),
                message: resp.message.unwrap_or_default(),
            })
        }
    }

    pub fn ping(&self) -> Result<(), ClientError> {
        self.expect_ok(&Request::new(RequestType::Ping)).map(|_| ())
    }

    pub fn status(&self) -> Result<StatusData, ClientError> {
        let resp = self.expect_ok(&Request::new(RequestType::Status))?;
        Ok(resp.parse_data()?)
    }

    pub fn list(&self) -> Result<Vec<HostEntry>, ClientError> {
        let resp = self.expect_ok(&Request::new(RequestType::List))?;
        let data: ListData = resp.parse_data()?;
        Ok(data.entries)
    }

    pub fn set(&self, alias: &str, enabled: bool, force: bool) -> Result<SetData, ClientError> {
        let req = Request::with_payload(
            RequestType::Set,
            &SetPayload {
                alias: alias.to_string(),
                enabled,
                force,
            },
        )?;
        let resp = self.expect_ok(&req)?;
        Ok(resp.parse_data()?)
    }

    pub fn enable(&self, alias: &str, force: bool) -> Result<SetData, ClientError> {
        self.set(alias, true, force)
    }

    pub fn disable(&self, alias: &str) -> Result<SetData, ClientError> {
        self.set(alias, false, false)
    }

    pub fn add(
        &self,
        domain: &str,
        ip: &str,
        alias: &str,
        group: &str,
        enabled: bool,
    ) -> Result<SetData, ClientError> {
        let req = Request::with_payload(
            RequestType::Add,
            &AddPayload {
                domain: domain.to_string(),
                ip: ip.to_string(),
                alias: alias.to_string(),
                group: group.to_string(),
                enabled,
            },
        )?;
        let resp = self.expect_ok(&req)?;
        Ok(resp.parse_data()?)
    }

    pub fn delete(&self, alias: &str) -> Result<(), ClientError> {
        let req = Request::with_payload(
            RequestType::Delete,
            &DeletePayload {
                alias: alias.to_string(),
            },
        )?;
        self.expect_ok(&req).map(|_| ())
    }

    pub fn sync(&self) -> Result<(), ClientError> {
        self.expect_ok(&Request::new(RequestType::Sync)).map(|_| ())
    }

    pub fn apply_preset(&self, name: &str) -> Result<(), ClientError> {
        let req = Request::with_payload(
            RequestType::Preset,
            &PresetPayload {
                name: name.to_string(),
            },
        )?;
        self.expect_ok(&req).map(|_| ())
    }

    pub fn rollback(&self, backup_name: &str) -> Result<(), ClientError> {
        let req = Request::with_payload(
            RequestType::Rollback,
            &RollbackPayload {
                backup_name: backup_name.to_string(),
            },
        )?;
        self.expect_ok(&req).map(|_| ())
    }

    pub fn backups(&self) -> Result<Vec<BackupInfo>, ClientError> {
        let resp = self.expect_ok(&Request::new(RequestType::Backups))?;
        let data: BackupsData = resp.parse_data()?;
        Ok(data.backups)
    }

    pub fn backup_content(&self, backup_name: &str) -> Result<String, ClientError> {
        let req = Request::with_payload(
            RequestType::BackupContent,
            &BackupContentPayload {
                backup_name: backup_name.to_string(),
            },
        )?;
        let resp = self.expect_ok(&req)?;
        let data: BackupContentData = resp.parse_data()?;
        Ok(data.content)
    }

    pub fn add_group(&self, name: &str) -> Result<(), ClientError> {
        let req = Request::with_payload(
            RequestType::AddGroup,
            &GroupPayload {
                name: name.to_string(),
            },
        )?;
        self.expect_ok(&req).map(|_| ())
    }

    pub fn delete_group(&self, name: &str) -> Result<(), ClientError> {
        let req = Request::with_payload(
            RequestType::DeleteGroup,
            &GroupPayload {
                name: name.to_string(),
            },
        )?;
        self.expect_ok(&req).map(|_| ())
    }

    pub fn rename_group(&self, old_name: &str, new_name: &str) -> Result<(), ClientError> {
        let req = Request::with_payload(
            RequestType::RenameGroup,
            &RenameGroupPayload {
                old_name: old_name.to_string(),
                new_name: new_name.to_string(),
            },
        )?;
        self.expect_ok(&req).map(|_| ())
    }

    pub fn list_groups(&self) -> Result<Vec<String>, ClientError> {
        let resp = self.expect_ok(&Request::new(RequestType::ListGroups))?;
        let data: GroupsData = resp.parse_data()?;
        Ok(data.groups)
    }

    pub fn add_preset(
        &self,
        name: &str,
        enable: Vec<String>,
        disable: Vec<String>,
    ) -> Result<(), ClientError> {
        let req = Request::with_payload(
            RequestType::AddPreset,
            &AddPresetPayload {
                name: name.to_string(),
                enable,
                disable,
            },
        )?;
        self.expect_ok(&req).map(|_| ())
    }

    pub fn delete_preset(&self, name: &str) -> Result<(), ClientError> {
        let req = Request::with_payload(
            RequestType::DeletePreset,
            &PresetPayload {
                name: name.to_string(),
            },
        )?;
        self.expect_ok(&req).map(|_| ())
    }

    pub fn list_presets(&self) -> Result<Vec<PresetInfo>, ClientError> {
        let resp = self.expect_ok(&Request::new(RequestType::ListPresets))?;
        let data: PresetsData = resp.parse_data()?;
        Ok(data.presets)
    }
}

/// Quick reachability probe: can we connect and get a pong?
pub fn is_daemon_running(socket_path: &Path) -> bool {
    let client = Client::new(socket_path);
    client.connect().is_ok() && client.ping().is_ok()
}
