//! The privileged daemon: startup, signal handling, periodic maintenance,
//! orderly shutdown.

pub mod audit;
pub mod flush;
pub mod handlers;
pub mod hosts_file;
pub mod peercred;
pub mod ratelimit;
pub mod socket;

use crate::config::{ConfigStore, ConfigWatcher, SYSTEM_CONFIG_PATH};
use anyhow::{Context, Result};
use audit::{AuditLog, AUDIT_LOG_PATH};
use handlers::RequestHandler;
use hosts_file::{HostsFile, BACKUP_DIR, HOSTS_PATH};
use lolcathost_common::protocol::SOCKET_PATH;
use peercred::SERVICE_GROUP_GID;
use ratelimit::{RateLimiter, RATE_LIMIT, RATE_LIMIT_WINDOW};
use socket::SocketServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// How often idle rate-limit buckets are pruned.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Everything the daemon touches, parameterized so tests can run against
/// temp paths with an unprivileged service group.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub config_path: PathBuf,
    pub socket_path: PathBuf,
    pub hosts_path: PathBuf,
    pub backup_dir: PathBuf,
    pub audit_log_path: PathBuf,
    pub service_gid: u32,
    pub rate_limit: usize,
    pub rate_limit_window: Duration,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            socket_path: PathBuf::from(SOCKET_PATH),
            hosts_path: PathBuf::from(HOSTS_PATH),
            backup_dir: PathBuf::from(BACKUP_DIR),
            audit_log_path: PathBuf::from(AUDIT_LOG_PATH),
            service_gid: SERVICE_GROUP_GID,
            rate_limit: RATE_LIMIT,
            rate_limit_window: RATE_LIMIT_WINDOW,
        }
    }
}

/// A running daemon instance.
pub struct Daemon {
    server: SocketServer,
    watcher: Option<ConfigWatcher>,
    watcher_task: tokio::task::JoinHandle<()>,
    cleanup_task: tokio::task::JoinHandle<()>,
}

impl Daemon {
    /// Loads (or synthesizes) the configuration, opens the audit log, binds
    /// the socket and spawns the background tasks. Does not install signal
    /// handlers; [`run`] does that.
    pub async fn start(options: DaemonOptions) -> Result<Self> {
        let store = Arc::new(
            ConfigStore::load_or_create(&options.config_path)
                .context("failed to load configuration")?,
        );
        if store.read().await.groups.is_empty() {
            store
                .mutate(|cfg| {
                    cfg.ensure_default_group();
                    Ok(())
                })
                .await
                .context("failed to create default group")?;
        }

        let audit = Arc::new(
            AuditLog::open(&options.audit_log_path).context("failed to open audit log")?,
        );
        let hosts = HostsFile::with_paths(&options.hosts_path, &options.backup_dir);
        let handler = Arc::new(RequestHandler::new(store.clone(), hosts, audit.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(
            options.rate_limit,
            options.rate_limit_window,
        ));

        let server = SocketServer::start(
            options.socket_path.clone(),
            options.service_gid,
            handler.clone(),
            rate_limiter.clone(),
            audit,
        )?;

        // Out-of-band config edits come in through the watcher; the store
        // has already validated and swapped the value by the time an event
        // reaches this channel.
        let (change_tx, mut change_rx) = mpsc::channel(8);
        let watcher = match ConfigWatcher::spawn(store.clone(), change_tx) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(error = %err, "failed to watch config file, hot-reload disabled");
                None
            }
        };

        let watcher_handler = handler.clone();
        let watcher_task = tokio::spawn(async move {
            while change_rx.recv().await.is_some() {
                if !watcher_handler.store().read().await.settings.auto_apply {
                    continue;
                }
                info!("configuration changed on disk, reconciling");
                if let Err(err) = watcher_handler.reconcile().await {
                    warn!(error = %err, "reconcile after config change failed");
                }
            }
        });

        let cleanup_limiter = rate_limiter.clone();
        let cleanup_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                cleanup_limiter.cleanup();
            }
        });

        Ok(Self {
            server,
            watcher,
            watcher_task,
            cleanup_task,
        })
    }

    /// Stops the watcher, the background tasks and the socket server.
    pub async fn shutdown(self) {
        if let Some(watcher) = self.watcher {
            watcher.stop();
        }
        self.watcher_task.abort();
        self.cleanup_task.abort();
        self.server.stop().await;
    }
}

/// Daemon entry point: root check, tracing setup, then block until SIGINT
/// or SIGTERM.
pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    init_tracing();

    if !nix::unistd::Uid::effective().is_root() {
        anyhow::bail!("daemon must run as root");
    }

    let mut options = DaemonOptions::default();
    if let Some(path) = config_path {
        options.config_path = path;
    }

    info!(version = handlers::VERSION, "lolcathost daemon starting");
    let daemon = Daemon::start(options).await?;

    wait_for_shutdown_signal().await?;
    daemon.shutdown().await;
    info!("daemon stopped");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,lolcathost=debug"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}
