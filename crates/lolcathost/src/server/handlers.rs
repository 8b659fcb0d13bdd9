//! Request routing and the reconcile sequence.
//!
//! Every mutating handler follows the same order: mutate and persist the
//! configuration under the exclusive lock, then rebuild the managed region
//! of the hosts file, then flush the resolver cache. A persist failure
//! surfaces as `INTERNAL_ERROR` while the in-memory value stays
//! authoritative; a flush failure is logged and never surfaced.

use crate::config::{ConfigError, ConfigStore, Host};
use crate::server::audit::AuditLog;
use crate::server::flush::{CacheFlusher, FlushMethod};
use crate::server::hosts_file::{HostsFile, HostsFileError};
use crate::server::peercred::PeerCredentials;
use lolcathost_common::protocol::{
    AddPayload, AddPresetPayload, BackupContentData, BackupContentPayload, BackupInfo,
    BackupsData, DeletePayload, ErrorCode, GroupPayload, GroupsData, HostEntry, ListData,
    PresetInfo, PresetPayload, PresetsData, RenameGroupPayload, Request, RequestType, Response,
    RollbackPayload, SetData, SetPayload, StatusData,
};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Daemon version reported by `status`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Routes framed requests to their handlers and owns the reconcile glue.
pub struct RequestHandler {
    store: Arc<ConfigStore>,
    hosts: HostsFile,
    audit: Arc<AuditLog>,
    started_at: Instant,
    request_count: AtomicU64,
}

impl RequestHandler {
    pub fn new(store: Arc<ConfigStore>, hosts: HostsFile, audit: Arc<AuditLog>) -> Self {
        Self {
            store,
            hosts,
            audit,
            started_at: Instant::now(),
            request_count: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Counts one admitted request toward the `status` counters.
    pub fn count_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Dispatches one request. Mutating operations are audited with the
    /// request payload as detail.
    pub async fn handle(&self, req: &Request, creds: Option<&PeerCredentials>) -> Response {
        let (uid, pid) = creds.map(|c| (c.uid, c.pid)).unwrap_or((0, 0));

        match req.request_type {
            RequestType::Ping => ok_response(&json!({"pong": "ok"})),
            RequestType::Status => self.handle_status().await,
            RequestType::List => self.handle_list().await,
            RequestType::Backups => self.handle_backups(),
            RequestType::BackupContent => self.handle_backup_content(req),
            RequestType::ListGroups => self.handle_list_groups().await,
            RequestType::ListPresets => self.handle_list_presets().await,

            RequestType::Set => {
                self.audited("set", uid, pid, req, self.handle_set(req).await)
                    .await
            }
            RequestType::Add => {
                self.audited("add", uid, pid, req, self.handle_add(req).await)
                    .await
            }
            RequestType::Delete => {
                self.audited("delete", uid, pid, req, self.handle_delete(req).await)
                    .await
            }
            RequestType::Sync => {
                self.audited("sync", uid, pid, req, self.handle_sync().await)
                    .await
            }
            RequestType::Preset => {
                self.audited("preset", uid, pid, req, self.handle_preset(req).await)
                    .await
            }
            RequestType::Rollback => {
                self.audited("rollback", uid, pid, req, self.handle_rollback(req).await)
                    .await
            }
            RequestType::AddGroup => {
                self.audited("add_group", uid, pid, req, self.handle_add_group(req).await)
                    .await
            }
            RequestType::DeleteGroup => {
                self.audited(
                    "delete_group",
                    uid,
                    pid,
                    req,
                    self.handle_delete_group(req).await,
                )
                .await
            }
            RequestType::RenameGroup => {
                self.audited(
                    "rename_group",
                    uid,
                    pid,
                    req,
                    self.handle_rename_group(req).await,
                )
                .await
            }
            RequestType::AddPreset => {
                self.audited("add_preset", uid, pid, req, self.handle_add_preset(req).await)
                    .await
            }
            RequestType::DeletePreset => {
                self.audited(
                    "delete_preset",
                    uid,
                    pid,
                    req,
                    self.handle_delete_preset(req).await,
                )
                .await
            }
        }
    }

    async fn audited(
        &self,
        action: &str,
        uid: u32,
        pid: i32,
        req: &Request,
        resp: Response,
    ) -> Response {
        self.audit
            .record(
                uid,
                pid,
                action,
                req.payload.clone(),
                resp.is_ok(),
                resp.message.as_deref().unwrap_or(""),
            )
            .await;
        resp
    }

    /// Rebuilds the managed region from the current configuration, then
    /// flushes the resolver cache. Flush failures are logged, not surfaced.
    pub async fn reconcile(&self) -> Result<(), HostsFileError> {
        let cfg = self.store.snapshot().await;
        let entries: Vec<Host> = cfg
            .groups
            .iter()
            .flat_map(|g| g.hosts.iter().cloned())
            .collect();
        self.hosts.write_managed_entries(&entries)?;

        let flusher = CacheFlusher::new(FlushMethod::parse(&cfg.settings.flush_method));
        if let Err(err) = flusher.flush().await {
            warn!(error = %err, "resolver cache flush failed");
        }
        Ok(())
    }

    async fn reconcile_or_error(&self) -> Option<Response> {
        match self.reconcile().await {
            Ok(()) => None,
            Err(err) => Some(Response::error(
                ErrorCode::InternalError,
                format!("failed to sync hosts: {err}"),
            )),
        }
    }

    async fn handle_status(&self) -> Response {
        let active_count = self.store.read().await.enabled_count();
        ok_response(&StatusData {
            running: true,
            version: VERSION.to_string(),
            uptime: self.started_at.elapsed().as_secs() as i64,
            active_count,
            request_count: self.request_count.load(Ordering::Relaxed),
        })
    }

    async fn handle_list(&self) -> Response {
        let cfg = self.store.read().await;
        let entries: Vec<HostEntry> = cfg
            .groups
            .iter()
            .flat_map(|g| {
                g.hosts.iter().map(|h| HostEntry {
                    domain: h.domain.clone(),
                    ip: h.ip.clone(),
                    alias: h.alias.clone(),
                    enabled: h.enabled,
                    group: g.name.clone(),
                })
            })
            .collect();
        ok_response(&ListData { entries })
    }

    async fn handle_set(&self, req: &Request) -> Response {
        let payload: SetPayload = match req.parse_payload() {
            Ok(p) => p,
            Err(_) => return invalid_payload(),
        };

        let result = self
            .store
            .mutate(|cfg| {
                let (host, _) = cfg
                    .find_host(&payload.alias)
                    .ok_or_else(|| ConfigError::AliasNotFound(payload.alias.clone()))?;
                let domain = host.domain.clone();

                // Enabling a domain that another alias already maps needs
                // force; the file would carry both lines.
                if payload.enabled && !payload.force {
                    if let Some(shadow) = cfg
                        .groups
                        .iter()
                        .flat_map(|g| &g.hosts)
                        .find(|h| h.alias != payload.alias && h.domain == domain && h.enabled)
                    {
                        return Err(ConfigError::DomainConflict {
                            domain: domain.clone(),
                            shadowed_by: shadow.alias.clone(),
                        });
                    }
                }

                cfg.set_host_enabled(&payload.alias, payload.enabled);
                Ok(domain)
            })
            .await;

        let domain = match result {
            Ok(domain) => domain,
            Err(err) => return error_response(&err),
        };
        if let Some(resp) = self.reconcile_or_error().await {
            return resp;
        }
        ok_response(&SetData {
            domain,
            applied: true,
        })
    }

    async fn handle_add(&self, req: &Request) -> Response {
        let payload: AddPayload = match req.parse_payload() {
            Ok(p) => p,
            Err(_) => return invalid_payload(),
        };

        if payload.domain.is_empty() {
            return Response::error(ErrorCode::InvalidDomain, "domain is required");
        }
        if payload.ip.is_empty() {
            return Response::error(ErrorCode::InvalidIp, "IP address is required");
        }
        if payload.group.is_empty() {
            return Response::error(ErrorCode::InvalidRequest, "group is required");
        }

        let result = self
            .store
            .mutate(|cfg| {
                cfg.add_host(
                    &payload.domain,
                    &payload.ip,
                    &payload.alias,
                    &payload.group,
                    payload.enabled,
                )
            })
            .await;
        if let Err(err) = result {
            return error_response(&err);
        }
        if let Some(resp) = self.reconcile_or_error().await {
            return resp;
        }
        ok_response(&SetData {
            domain: payload.domain,
            applied: true,
        })
    }

    async fn handle_delete(&self, req: &Request) -> Response {
        let payload: DeletePayload = match req.parse_payload() {
            Ok(p) => p,
            Err(_) => return invalid_payload(),
        };
        if payload.alias.is_empty() {
            return Response::error(ErrorCode::InvalidRequest, "alias is required");
        }

        let result = self
            .store
            .mutate(|cfg| {
                if cfg.delete_host(&payload.alias) {
                    Ok(())
                } else {
                    Err(ConfigError::AliasNotFound(payload.alias.clone()))
                }
            })
            .await;
        if let Err(err) = result {
            return error_response(&err);
        }
        if let Some(resp) = self.reconcile_or_error().await {
            return resp;
        }
        ok_response(&json!({"deleted": payload.alias}))
    }

    async fn handle_sync(&self) -> Response {
        if let Some(resp) = self.reconcile_or_error().await {
            return resp;
        }
        ok_response(&json!({"synced": true}))
    }

    async fn handle_preset(&self, req: &Request) -> Response {
        let payload: PresetPayload = match req.parse_payload() {
            Ok(p) => p,
            Err(_) => return invalid_payload(),
        };

        let result = self.store.mutate(|cfg| cfg.apply_preset(&payload.name)).await;
        if let Err(err) = result {
            return error_response(&err);
        }
        if let Some(resp) = self.reconcile_or_error().await {
            return resp;
        }
        ok_response(&json!({"preset": payload.name, "applied": "true"}))
    }

    async fn handle_rollback(&self, req: &Request) -> Response {
        let payload: RollbackPayload = match req.parse_payload() {
            Ok(p) => p,
            Err(_) => return invalid_payload(),
        };

        if let Err(err) = self.hosts.restore_backup(&payload.backup_name) {
            return Response::error(
                ErrorCode::InternalError,
                format!("failed to restore backup: {err}"),
            );
        }

        let method = FlushMethod::parse(&self.store.read().await.settings.flush_method);
        if let Err(err) = CacheFlusher::new(method).flush().await {
            warn!(error = %err, "resolver cache flush failed after rollback");
        }

        ok_response(&json!({"restored": payload.backup_name}))
    }

    fn handle_backups(&self) -> Response {
        match self.hosts.list_backups() {
            Ok(backups) => {
                let backups: Vec<BackupInfo> = backups
                    .into_iter()
                    .map(|b| BackupInfo {
                        name: b.name,
                        timestamp: b.timestamp,
                        size: b.size,
                    })
                    .collect();
                ok_response(&BackupsData { backups })
            }
            Err(err) => Response::error(
                ErrorCode::InternalError,
                format!("failed to list backups: {err}"),
            ),
        }
    }

    fn handle_backup_content(&self, req: &Request) -> Response {
        let payload: BackupContentPayload = match req.parse_payload() {
            Ok(p) => p,
            Err(_) => return invalid_payload(),
        };
        match self.hosts.read_backup(&payload.backup_name) {
            Ok(content) => ok_response(&BackupContentData { content }),
            Err(err) => Response::error(
                ErrorCode::InternalError,
                format!("failed to read backup: {err}"),
            ),
        }
    }

    async fn handle_add_group(&self, req: &Request) -> Response {
        let payload: GroupPayload = match req.parse_payload() {
            Ok(p) => p,
            Err(_) => return invalid_payload(),
        };
        if payload.name.is_empty() {
            return Response::error(ErrorCode::InvalidRequest, "group name is required");
        }

        let result = self.store.mutate(|cfg| cfg.add_group(&payload.name)).await;
        if let Err(err) = result {
            return error_response(&err);
        }
        if let Some(resp) = self.reconcile_or_error().await {
            return resp;
        }
        ok_response(&json!({"added": payload.name}))
    }

    async fn handle_delete_group(&self, req: &Request) -> Response {
        let payload: GroupPayload = match req.parse_payload() {
            Ok(p) => p,
            Err(_) => return invalid_payload(),
        };
        if payload.name.is_empty() {
            return Response::error(ErrorCode::InvalidRequest, "group name is required");
        }

        let result = self
            .store
            .mutate(|cfg| cfg.delete_group(&payload.name))
            .await;
        if let Err(err) = result {
            return error_response(&err);
        }
        if let Some(resp) = self.reconcile_or_error().await {
            return resp;
        }
        ok_response(&json!({"deleted": payload.name}))
    }

    async fn handle_rename_group(&self, req: &Request) -> Response {
        let payload: RenameGroupPayload = match req.parse_payload() {
            Ok(p) => p,
            Err(_) => return invalid_payload(),
        };
        if payload.old_name.is_empty() || payload.new_name.is_empty() {
            return Response::error(
                ErrorCode::InvalidRequest,
                "old_name and new_name are required",
            );
        }

        let result = self
            .store
            .mutate(|cfg| cfg.rename_group(&payload.old_name, &payload.new_name))
            .await;
        if let Err(err) = result {
            return error_response(&err);
        }
        if let Some(resp) = self.reconcile_or_error().await {
            return resp;
        }
        ok_response(&json!({"renamed": payload.new_name}))
    }

    async fn handle_list_groups(&self) -> Response {
        let groups = self.store.read().await.group_names();
        ok_response(&GroupsData { groups })
    }

    async fn handle_add_preset(&self, req: &Request) -> Response {
        let payload: AddPresetPayload = match req.parse_payload() {
            Ok(p) => p,
            Err(_) => return invalid_payload(),
        };
        if payload.name.is_empty() {
            return Response::error(ErrorCode::InvalidRequest, "preset name is required");
        }

        let result = self
            .store
            .mutate(|cfg| cfg.add_preset(&payload.name, payload.enable.clone(), payload.disable.clone()))
            .await;
        if let Err(err) = result {
            return error_response(&err);
        }
        if let Some(resp) = self.reconcile_or_error().await {
            return resp;
        }
        ok_response(&json!({"added": payload.name}))
    }

    async fn handle_delete_preset(&self, req: &Request) -> Response {
        let payload: PresetPayload = match req.parse_payload() {
            Ok(p) => p,
            Err(_) => return invalid_payload(),
        };
        if payload.name.is_empty() {
            return Response::error(ErrorCode::InvalidRequest, "preset name is required");
        }

        let result = self
            .store
            .mutate(|cfg| cfg.delete_preset(&payload.name))
            .await;
        if let Err(err) = result {
            return error_response(&err);
        }
        if let Some(resp) = self.reconcile_or_error().await {
            return resp;
        }
        ok_response(&json!({"deleted": payload.name}))
    }

    async fn handle_list_presets(&self) -> Response {
        let cfg = self.store.read().await;
        let presets: Vec<PresetInfo> = cfg
            .presets
            .iter()
            .map(|p| PresetInfo {
                name: p.name.clone(),
                enable: p.enable.clone(),
                disable: p.disable.clone(),
            })
            .collect();
        ok_response(&PresetsData { presets })
    }
}

fn ok_response<T: Serialize>(data: &T) -> Response {
    Response::ok(data)
        .unwrap_or_else(|_| Response::error(ErrorCode::InternalError, "failed to encode response"))
}

fn invalid_payload() -> Response {
    Response::error(ErrorCode::InvalidRequest, "invalid payload")
}

/// Maps configuration errors onto the wire error-code alphabet.
fn error_response(err: &ConfigError) -> Response {
    let code = match err {
        ConfigError::InvalidDomain(_) => ErrorCode::InvalidDomain,
        ConfigError::InvalidIp(_) => ErrorCode::InvalidIp,
        ConfigError::InvalidAlias(_) => ErrorCode::InvalidRequest,
        ConfigError::BlockedDomain(_) => ErrorCode::BlockedDomain,
        ConfigError::DuplicateAlias(_)
        | ConfigError::DuplicateGroup(_)
        | ConfigError::DuplicatePreset(_)
        | ConfigError::DomainConflict { .. } => ErrorCode::Conflict,
        ConfigError::AliasNotFound(_)
        | ConfigError::GroupNotFound(_)
        | ConfigError::PresetNotFound(_) => ErrorCode::NotFound,
        _ => ErrorCode::InternalError,
    };
    Response::error(code, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        handler: RequestHandler,
        _dir: tempfile::TempDir,
        hosts_path: std::path::PathBuf,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        let hosts_path = dir.path().join("hosts");
        std::fs::write(&hosts_path, "127.0.0.1\tlocalhost\n").unwrap();

        let store = Arc::new(ConfigStore::load_or_create(&config_path).unwrap());
        let hosts = HostsFile::with_paths(&hosts_path, dir.path().join("backups"));
        let audit = Arc::new(AuditLog::open(&dir.path().join("audit.log")).unwrap());
        Fixture {
            handler: RequestHandler::new(store, hosts, audit),
            _dir: dir,
            hosts_path,
        }
    }

    async fn send(fixture: &Fixture, req: Request) -> Response {
        fixture.handler.handle(&req, None).await
    }

    #[tokio::test]
    async fn ping_pongs() {
        let fx = fixture().await;
        let resp = send(&fx, Request::new(RequestType::Ping)).await;
        assert!(resp.is_ok());
        assert_eq!(resp.data.unwrap()["pong"], "ok");
    }

    #[tokio::test]
    async fn add_writes_managed_region() {
        let fx = fixture().await;
        let req = Request::with_payload(
            RequestType::Add,
            &AddPayload {
                domain: "myapp.local".into(),
                ip: "127.0.0.1".into(),
                alias: String::new(),
                group: "dev".into(),
                enabled: true,
            },
        )
        .unwrap();

        let resp = send(&fx, req).await;
        assert!(resp.is_ok(), "unexpected error: {:?}", resp.message);
        let data: SetData = resp.parse_data().unwrap();
        assert_eq!(data.domain, "myapp.local");
        assert!(data.applied);

        let content = std::fs::read_to_string(&fx.hosts_path).unwrap();
        assert!(content.contains("127.0.0.1\tmyapp.local\t# lolcathost:myapp-local"));
    }

    #[tokio::test]
    async fn add_blocked_domain_leaves_hosts_untouched() {
        let fx = fixture().await;
        let before = std::fs::read_to_string(&fx.hosts_path).unwrap();
        let req = Request::with_payload(
            RequestType::Add,
            &AddPayload {
                domain: "apple.com".into(),
                ip: "127.0.0.1".into(),
                alias: String::new(),
                group: "dev".into(),
                enabled: true,
            },
        )
        .unwrap();

        let resp = send(&fx, req).await;
        assert_eq!(resp.code, Some(ErrorCode::BlockedDomain));
        assert_eq!(std::fs::read_to_string(&fx.hosts_path).unwrap(), before);
    }

    #[tokio::test]
    async fn set_conflict_requires_force() {
        let fx = fixture().await;
        for (alias, enabled) in [("one", true), ("two", false)] {
            let req = Request::with_payload(
                RequestType::Add,
                &AddPayload {
                    domain: "shared.local".into(),
                    ip: "127.0.0.1".into(),
                    alias: alias.into(),
                    group: "dev".into(),
                    enabled,
                },
            )
            .unwrap();
            assert!(send(&fx, req).await.is_ok());
        }

        let conflict = Request::with_payload(
            RequestType::Set,
            &SetPayload {
                alias: "two".into(),
                enabled: true,
                force: false,
            },
        )
        .unwrap();
        let resp = send(&fx, conflict).await;
        assert_eq!(resp.code, Some(ErrorCode::Conflict));

        let forced = Request::with_payload(
            RequestType::Set,
            &SetPayload {
                alias: "two".into(),
                enabled: true,
                force: true,
            },
        )
        .unwrap();
        let resp = send(&fx, forced).await;
        assert!(resp.is_ok());

        // Both lines end up in the file; the resolver picks the winner.
        let content = std::fs::read_to_string(&fx.hosts_path).unwrap();
        assert_eq!(content.matches("shared.local").count(), 2);
    }

    #[tokio::test]
    async fn set_disable_removes_line() {
        let fx = fixture().await;
        let add = Request::with_payload(
            RequestType::Add,
            &AddPayload {
                domain: "myapp.local".into(),
                ip: "127.0.0.1".into(),
                alias: String::new(),
                group: "dev".into(),
                enabled: true,
            },
        )
        .unwrap();
        send(&fx, add).await;

        let off = Request::with_payload(
            RequestType::Set,
            &SetPayload {
                alias: "myapp-local".into(),
                enabled: false,
                force: false,
            },
        )
        .unwrap();
        assert!(send(&fx, off).await.is_ok());

        let content = std::fs::read_to_string(&fx.hosts_path).unwrap();
        assert!(!content.contains("myapp.local"));
    }

    #[tokio::test]
    async fn delete_unknown_alias_is_not_found() {
        let fx = fixture().await;
        let req = Request::with_payload(
            RequestType::Delete,
            &DeletePayload {
                alias: "ghost".into(),
            },
        )
        .unwrap();
        let resp = send(&fx, req).await;
        assert_eq!(resp.code, Some(ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn rollback_rejects_traversal_names() {
        let fx = fixture().await;
        let req = Request::with_payload(
            RequestType::Rollback,
            &RollbackPayload {
                backup_name: "../../etc/passwd".into(),
            },
        )
        .unwrap();
        let resp = send(&fx, req).await;
        assert_eq!(resp.code, Some(ErrorCode::InternalError));
    }

    #[tokio::test]
    async fn status_counts_enabled_entries() {
        let fx = fixture().await;
        let add = Request::with_payload(
            RequestType::Add,
            &AddPayload {
                domain: "myapp.local".into(),
                ip: "127.0.0.1".into(),
                alias: String::new(),
                group: "dev".into(),
                enabled: true,
            },
        )
        .unwrap();
        send(&fx, add).await;

        let resp = send(&fx, Request::new(RequestType::Status)).await;
        let data: StatusData = resp.parse_data().unwrap();
        assert!(data.running);
        assert_eq!(data.version, VERSION);
        // The default config ships one disabled example entry.
        assert_eq!(data.active_count, 1);
    }

    #[tokio::test]
    async fn group_and_preset_round_trip() {
        let fx = fixture().await;

        let add_group = Request::with_payload(
            RequestType::AddGroup,
            &GroupPayload { name: "qa".into() },
        )
        .unwrap();
        assert!(send(&fx, add_group.clone()).await.is_ok());
        let resp = send(&fx, add_group).await;
        assert_eq!(resp.code, Some(ErrorCode::Conflict));

        let rename = Request::with_payload(
            RequestType::RenameGroup,
            &RenameGroupPayload {
                old_name: "qa".into(),
                new_name: "quality".into(),
            },
        )
        .unwrap();
        assert!(send(&fx, rename).await.is_ok());

        let groups: GroupsData = send(&fx, Request::new(RequestType::ListGroups))
            .await
            .parse_data()
            .unwrap();
        assert!(groups.groups.contains(&"quality".to_string()));

        let add_preset = Request::with_payload(
            RequestType::AddPreset,
            &AddPresetPayload {
                name: "work".into(),
                enable: vec!["example-local".into()],
                disable: vec![],
            },
        )
        .unwrap();
        assert!(send(&fx, add_preset).await.is_ok());

        let apply = Request::with_payload(
            RequestType::Preset,
            &PresetPayload {
                name: "work".into(),
            },
        )
        .unwrap();
        let resp = send(&fx, apply).await;
        assert!(resp.is_ok());
        assert_eq!(resp.data.unwrap()["applied"], "true");

        let missing = Request::with_payload(
            RequestType::Preset,
            &PresetPayload {
                name: "ghost".into(),
            },
        )
        .unwrap();
        assert_eq!(
            send(&fx, missing).await.code,
            Some(ErrorCode::NotFound)
        );
    }
}
