//! Unix socket listener and the per-connection request loop.
//!
//! One accept task hands each connection to its own task. A connection is
//! authorized once, before its first request; an unauthorized peer gets a
//! single error response and the connection is closed.

use crate::server::audit::AuditLog;
use crate::server::handlers::RequestHandler;
use crate::server::peercred::{is_authorized, peer_credentials};
use crate::server::ratelimit::RateLimiter;
use lolcathost_common::protocol::{ErrorCode, Request, Response};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind socket at {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set socket permissions: {0}")]
    Permissions(#[source] std::io::Error),

    #[error("failed to set socket group ownership: {0}")]
    Ownership(#[source] nix::errno::Errno),
}

/// The daemon's socket front end.
pub struct SocketServer {
    socket_path: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl SocketServer {
    /// Binds the socket (replacing any stale one), applies 0660 and the
    /// service group, and spawns the accept loop.
    pub fn start(
        socket_path: PathBuf,
        service_gid: u32,
        handler: Arc<RequestHandler>,
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<AuditLog>,
    ) -> Result<Self, ServerError> {
        let listener = bind_socket(&socket_path, service_gid)?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            handler,
            rate_limiter,
            audit,
            service_gid,
            shutdown_rx,
        ));
        info!(path = %socket_path.display(), "listening on unix socket");
        Ok(Self {
            socket_path,
            shutdown_tx,
            accept_task,
        })
    }

    /// Stops accepting, closes the listener and removes the socket path.
    /// Connections in flight are closed by their next I/O error.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.accept_task.await;
        let _ = std::fs::remove_file(&self.socket_path);
        info!("socket server stopped");
    }
}

fn bind_socket(path: &Path, service_gid: u32) -> Result<UnixListener, ServerError> {
    // A stale socket from an unclean shutdown blocks bind.
    let _ = std::fs::remove_file(path);

    let listener = UnixListener::bind(path).map_err(|source| ServerError::Bind {
        path: path.to_path_buf(),
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
            .map_err(ServerError::Permissions)?;
    }
    nix::unistd::chown(path, None, Some(nix::unistd::Gid::from_raw(service_gid)))
        .map_err(ServerError::Ownership)?;

    Ok(listener)
}

async fn accept_loop(
    listener: UnixListener,
    handler: Arc<RequestHandler>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditLog>,
    service_gid: u32,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("accept loop stopping");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            handler.clone(),
                            rate_limiter.clone(),
                            audit.clone(),
                            service_gid,
                        ));
                    }
                    Err(err) => {
                        debug!(error = %err, "accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    handler: Arc<RequestHandler>,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditLog>,
    service_gid: u32,
) {
    let creds = peer_credentials(&stream);
    let (reader, mut writer) = stream.into_split();

    if !is_authorized(creds.as_ref(), service_gid) {
        let resp = Response::error(
            ErrorCode::Unauthorized,
            "unauthorized: user not in lolcathost group",
        );
        let _ = write_response(&mut writer, &resp).await;
        let (uid, pid) = creds.map(|c| (c.uid, c.pid)).unwrap_or((0, 0));
        audit
            .record(uid, pid, "connect", None, false, "unauthorized access attempt")
            .await;
        return;
    }

    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            // EOF or broken pipe: the peer is done.
            Ok(None) | Err(_) => return,
        };

        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(_) => {
                let resp = Response::error(ErrorCode::InvalidRequest, "invalid JSON");
                if write_response(&mut writer, &resp).await.is_err() {
                    return;
                }
                continue;
            }
        };

        if let Some(creds) = creds.as_ref() {
            if !rate_limiter.allow(creds.pid) {
                let resp = Response::error(ErrorCode::RateLimited, "rate limit exceeded");
                if write_response(&mut writer, &resp).await.is_err() {
                    return;
                }
                continue;
            }
        }

        handler.count_request();
        let resp = handler.handle(&req, creds.as_ref()).await;
        if write_response(&mut writer, &resp).await.is_err() {
            return;
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    resp: &Response,
) -> std::io::Result<()> {
    let mut data = serde_json::to_vec(resp)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    data.push(b'\n');
    writer.write_all(&data).await?;
    writer.flush().await
}
