//! End-to-end tests: a real daemon on a temp socket, driven through the
//! blocking client.
//!
//! Every test gets its own daemon with its own config, hosts file, backup
//! directory and audit log. The service group is set to the test process's
//! own gid so the peer-credential check authorizes us without root.

use lolcathost::client::{Client, ClientError};
use lolcathost::server::{Daemon, DaemonOptions};
use lolcathost_common::protocol::ErrorCode;
use std::path::PathBuf;
use std::time::Duration;

const INITIAL_HOSTS: &str = "127.0.0.1\tlocalhost\n::1\tlocalhost\n";

struct TestDaemon {
    daemon: Option<Daemon>,
    _dir: tempfile::TempDir,
    socket_path: PathBuf,
    hosts_path: PathBuf,
    config_path: PathBuf,
    audit_path: PathBuf,
    backup_dir: PathBuf,
}

impl TestDaemon {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(adjust: impl FnOnce(&mut DaemonOptions)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let hosts_path = dir.path().join("hosts");
        std::fs::write(&hosts_path, INITIAL_HOSTS).unwrap();

        let mut options = DaemonOptions {
            config_path: dir.path().join("config.yaml"),
            socket_path: dir.path().join("lolcathost.sock"),
            hosts_path: hosts_path.clone(),
            backup_dir: dir.path().join("backups"),
            audit_log_path: dir.path().join("audit.log"),
            service_gid: nix::unistd::getgid().as_raw(),
            rate_limit: 100,
            rate_limit_window: Duration::from_secs(60),
        };
        adjust(&mut options);

        let daemon = Daemon::start(options.clone()).await.unwrap();
        Self {
            daemon: Some(daemon),
            socket_path: options.socket_path,
            hosts_path,
            config_path: options.config_path,
            audit_path: options.audit_log_path,
            backup_dir: options.backup_dir,
            _dir: dir,
        }
    }

    fn connect(&self) -> Client {
        let client = Client::new(&self.socket_path);
        client.connect().unwrap();
        client
    }

    fn hosts_content(&self) -> String {
        std::fs::read_to_string(&self.hosts_path).unwrap()
    }

    async fn stop(mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.shutdown().await;
        }
    }
}

/// Runs blocking client work off the runtime threads.
async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_and_status() {
    let td = TestDaemon::start().await;
    let client = td.connect();

    blocking(move || {
        client.ping().unwrap();
        let status = client.status().unwrap();
        assert!(status.running);
        assert!(!status.version.is_empty());
        // ping + status have been counted by now
        assert!(status.request_count >= 2);
    })
    .await;

    td.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_enable_disable_cycle() {
    let td = TestDaemon::start().await;
    let client = td.connect();

    let client = blocking(move || {
        let data = client.add("myapp.local", "127.0.0.1", "", "dev", true).unwrap();
        assert_eq!(data.domain, "myapp.local");
        assert!(data.applied);
        client
    })
    .await;

    let content = td.hosts_content();
    assert!(content.contains("127.0.0.1\tmyapp.local\t# lolcathost:myapp-local"));
    // Bytes outside the managed region are preserved.
    assert!(content.starts_with(INITIAL_HOSTS.trim_end_matches('\n')));

    let client = blocking(move || {
        client.disable("myapp-local").unwrap();
        client
    })
    .await;
    assert!(!td.hosts_content().contains("myapp.local"));

    // The entry is still in the configuration, just disabled.
    blocking(move || {
        let entries = client.list().unwrap();
        let entry = entries.iter().find(|e| e.alias == "myapp-local").unwrap();
        assert!(!entry.enabled);
        assert_eq!(entry.group, "dev");
    })
    .await;

    td.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocked_domain_is_rejected() {
    let td = TestDaemon::start().await;
    let client = td.connect();
    let before = td.hosts_content();

    blocking(move || {
        let err = client
            .add("apple.com", "127.0.0.1", "", "dev", true)
            .unwrap_err();
        match err {
            ClientError::Server { code, .. } => assert_eq!(code, ErrorCode::BlockedDomain),
            other => panic!("expected server error, got {other:?}"),
        }
    })
    .await;

    assert_eq!(td.hosts_content(), before);
    td.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn explicit_alias_conflict() {
    let td = TestDaemon::start().await;
    let client = td.connect();

    blocking(move || {
        client.add("one.local", "127.0.0.1", "x", "dev", true).unwrap();
        let err = client
            .add("other.local", "1.1.1.1", "x", "dev", true)
            .unwrap_err();
        match err {
            ClientError::Server { code, .. } => assert_eq!(code, ErrorCode::Conflict),
            other => panic!("expected server error, got {other:?}"),
        }
    })
    .await;

    let content = td.hosts_content();
    assert!(content.contains("one.local"));
    assert!(!content.contains("other.local"));
    td.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rollback_restores_previous_bytes() {
    let td = TestDaemon::start().await;
    let client = td.connect();
    let h0 = td.hosts_content();

    let (client, backup_name) = blocking(move || {
        client.add("myapp.local", "127.0.0.1", "", "dev", true).unwrap();
        let backups = client.backups().unwrap();
        assert_eq!(backups.len(), 1);
        let name = backups[0].name.clone();
        assert!(name.starts_with("hosts."));
        assert!(name.ends_with(".bak"));
        (client, name)
    })
    .await;

    assert_ne!(td.hosts_content(), h0);

    let h0_for_client = h0.clone();
    blocking(move || {
        // The snapshot taken before the mutation holds the original bytes.
        assert_eq!(client.backup_content(&backup_name).unwrap(), h0_for_client);
        client.rollback(&backup_name).unwrap();
    })
    .await;

    assert_eq!(td.hosts_content(), h0);
    td.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rollback_rejects_path_traversal() {
    let td = TestDaemon::start().await;
    let client = td.connect();
    let before = td.hosts_content();

    blocking(move || {
        for name in ["../config.yaml", "/etc/passwd", "hosts.x.bak/../../y.bak"] {
            let err = client.rollback(name).unwrap_err();
            assert!(matches!(err, ClientError::Server { .. }), "{name} accepted");
            assert!(client.backup_content(name).is_err());
        }
    })
    .await;

    assert_eq!(td.hosts_content(), before);
    assert!(!td.backup_dir.join("y.bak").exists());
    td.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_is_idempotent_and_backups_stay_capped() {
    let td = TestDaemon::start().await;
    let client = td.connect();

    let client = blocking(move || {
        client.add("myapp.local", "127.0.0.1", "", "dev", true).unwrap();
        client.sync().unwrap();
        client
    })
    .await;
    let first = td.hosts_content();

    let client = blocking(move || {
        for _ in 0..12 {
            client.sync().unwrap();
        }
        client
    })
    .await;
    assert_eq!(td.hosts_content(), first);

    blocking(move || {
        let backups = client.backups().unwrap();
        assert!(!backups.is_empty());
        assert!(backups.len() <= 10, "retention exceeded: {}", backups.len());
    })
    .await;

    td.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn preset_toggles_listed_aliases() {
    let td = TestDaemon::start().await;
    let client = td.connect();

    blocking(move || {
        client.add("a.local", "127.0.0.1", "a", "dev", false).unwrap();
        client.add("b.local", "127.0.0.2", "b", "dev", true).unwrap();
        client
            .add_preset(
                "flip",
                vec!["a".to_string(), "missing".to_string()],
                vec!["b".to_string()],
            )
            .unwrap();
        client.apply_preset("flip").unwrap();

        let entries = client.list().unwrap();
        let enabled = |alias: &str| entries.iter().find(|e| e.alias == alias).unwrap().enabled;
        assert!(enabled("a"));
        assert!(!enabled("b"));
    })
    .await;

    let content = td.hosts_content();
    assert!(content.contains("a.local"));
    assert!(!content.contains("b.local"));
    td.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rate_limit_burst_then_recovery() {
    let td = TestDaemon::start_with(|options| {
        options.rate_limit = 5;
        options.rate_limit_window = Duration::from_millis(400);
    })
    .await;
    let client = td.connect();

    blocking(move || {
        for _ in 0..5 {
            client.ping().unwrap();
        }
        for _ in 0..3 {
            let err = client.ping().unwrap_err();
            match err {
                ClientError::Server { code, .. } => assert_eq!(code, ErrorCode::RateLimited),
                other => panic!("expected rate limit, got {other:?}"),
            }
        }

        std::thread::sleep(Duration::from_millis(500));
        client.ping().unwrap();
    })
    .await;

    td.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unauthorized_peer_gets_one_error_then_close() {
    // Root passes the uid check no matter the service group.
    if nix::unistd::geteuid().is_root() {
        return;
    }

    let td = TestDaemon::start_with(|options| {
        // A gid this process does not hold.
        options.service_gid = 59999;
    })
    .await;
    let client = td.connect();

    blocking(move || {
        let err = client.ping().unwrap_err();
        match err {
            ClientError::Server { code, .. } => assert_eq!(code, ErrorCode::Unauthorized),
            other => panic!("expected unauthorized, got {other:?}"),
        }
        // The daemon closed the connection after the single error.
        assert!(client.ping().is_err());
    })
    .await;

    let audit = std::fs::read_to_string(&td.audit_path).unwrap();
    assert!(audit.contains("\"connect\""));
    assert!(audit.contains("unauthorized access attempt"));
    td.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutations_are_audited() {
    let td = TestDaemon::start().await;
    let client = td.connect();

    blocking(move || {
        client.add("myapp.local", "127.0.0.1", "", "dev", true).unwrap();
        let _ = client.delete("no-such-alias");
    })
    .await;

    let audit = std::fs::read_to_string(&td.audit_path).unwrap();
    let lines: Vec<&str> = audit.lines().collect();
    assert_eq!(lines.len(), 2);

    let add: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(add["action"], "add");
    assert_eq!(add["success"], true);
    assert_eq!(add["details"]["domain"], "myapp.local");
    assert_eq!(add["pid"], std::process::id());

    let delete: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(delete["action"], "delete");
    assert_eq!(delete["success"], false);
    td.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_lifecycle_over_the_wire() {
    let td = TestDaemon::start().await;
    let client = td.connect();

    blocking(move || {
        client.add_group("qa").unwrap();
        client.add("qa.local", "127.0.0.1", "", "qa", true).unwrap();
        client.rename_group("qa", "quality").unwrap();

        let groups = client.list_groups().unwrap();
        assert!(groups.contains(&"quality".to_string()));
        assert!(!groups.contains(&"qa".to_string()));

        client.delete_group("quality").unwrap();
        assert!(client.list().unwrap().iter().all(|e| e.group != "quality"));
    })
    .await;

    // Deleting the group removed its enabled host from the managed region.
    assert!(!td.hosts_content().contains("qa.local"));
    td.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn out_of_band_config_edit_triggers_reconcile() {
    let td = TestDaemon::start().await;

    // Rewrite the config file the way an editor would: full new content,
    // including a newly enabled host.
    let raw = std::fs::read_to_string(&td.config_path).unwrap();
    let mut cfg: serde_yaml::Value = serde_yaml::from_str(&raw).unwrap();
    let groups = cfg["groups"].as_sequence_mut().unwrap();
    groups.push(serde_yaml::from_str("{name: edited, hosts: [{domain: edited.local, ip: 127.0.0.1, alias: edited-local, enabled: true}]}").unwrap());
    std::fs::write(&td.config_path, serde_yaml::to_string(&cfg).unwrap()).unwrap();

    // The watcher picks the change up asynchronously; poll for the effect.
    let mut reconciled = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if td.hosts_content().contains("edited.local") {
            reconciled = true;
            break;
        }
    }
    assert!(reconciled, "watcher never reconciled the external edit");

    td.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_socket_is_replaced_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("lolcathost.sock");
    std::fs::write(&socket_path, "stale").unwrap();

    let hosts_path = dir.path().join("hosts");
    std::fs::write(&hosts_path, INITIAL_HOSTS).unwrap();

    let daemon = Daemon::start(DaemonOptions {
        config_path: dir.path().join("config.yaml"),
        socket_path: socket_path.clone(),
        hosts_path,
        backup_dir: dir.path().join("backups"),
        audit_log_path: dir.path().join("audit.log"),
        service_gid: nix::unistd::getgid().as_raw(),
        rate_limit: 100,
        rate_limit_window: Duration::from_secs(60),
    })
    .await
    .unwrap();

    let client = Client::new(&socket_path);
    client.connect().unwrap();
    blocking(move || client.ping().unwrap()).await;

    daemon.shutdown().await;
    // Shutdown removes the socket path.
    assert!(!socket_path.exists());
}
