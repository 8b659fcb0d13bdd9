//! Resolver-cache invalidation after a hosts-file change.
//!
//! Flush failures never fail the mutation that triggered them; callers log
//! and move on. Many Linux setups read the hosts file on every lookup, so a
//! missing cache daemon counts as success there.

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("{0} failed")]
    CommandFailed(&'static str),

    #[error("all resolver flush methods failed")]
    AllFailed,

    #[error("unsupported operating system")]
    Unsupported,
}

/// Flush strategy. `Auto` picks the platform-appropriate behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMethod {
    #[default]
    Auto,
    Dscacheutil,
    Killall,
    Both,
    Systemd,
    Nscd,
}

impl FlushMethod {
    /// Maps a configuration token to a method. Empty and unknown tokens fall
    /// back to `Auto`; the configuration validator already rejects unknowns.
    pub fn parse(token: &str) -> Self {
        match token {
            "dscacheutil" => Self::Dscacheutil,
            "killall" => Self::Killall,
            "both" => Self::Both,
            "systemd" => Self::Systemd,
            "nscd" => Self::Nscd,
            _ => Self::Auto,
        }
    }
}

/// Invalidates the OS resolver cache.
pub struct CacheFlusher {
    method: FlushMethod,
}

impl CacheFlusher {
    pub fn new(method: FlushMethod) -> Self {
        Self { method }
    }

    pub async fn flush(&self) -> Result<(), FlushError> {
        #[cfg(target_os = "macos")]
        {
            return self.flush_darwin().await;
        }
        #[cfg(target_os = "linux")]
        {
            return self.flush_linux().await;
        }
        #[allow(unreachable_code)]
        Err(FlushError::Unsupported)
    }

    #[cfg(target_os = "macos")]
    async fn flush_darwin(&self) -> Result<(), FlushError> {
        match self.method {
            FlushMethod::Dscacheutil => {
                if !run_command("dscacheutil", &["-flushcache"]).await {
                    return Err(FlushError::CommandFailed("dscacheutil"));
                }
                Ok(())
            }
            FlushMethod::Killall => {
                if !run_command("killall", &["-HUP", "mDNSResponder"]).await {
                    return Err(FlushError::CommandFailed("killall mDNSResponder"));
                }
                Ok(())
            }
            FlushMethod::Both | FlushMethod::Auto => {
                let cache = run_command("dscacheutil", &["-flushcache"]).await;
                let hup = run_command("killall", &["-HUP", "mDNSResponder"]).await;
                if !cache && !hup {
                    return Err(FlushError::AllFailed);
                }
                Ok(())
            }
            // Linux-only tokens behave like auto here.
            _ => self.flush_darwin_auto().await,
        }
    }

    #[cfg(target_os = "macos")]
    async fn flush_darwin_auto(&self) -> Result<(), FlushError> {
        let cache = run_command("dscacheutil", &["-flushcache"]).await;
        let hup = run_command("killall", &["-HUP", "mDNSResponder"]).await;
        if !cache && !hup {
            return Err(FlushError::AllFailed);
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    async fn flush_linux(&self) -> Result<(), FlushError> {
        match self.method {
            FlushMethod::Systemd => {
                if run_command("resolvectl", &["flush-caches"]).await
                    || run_command("systemd-resolve", &["--flush-caches"]).await
                {
                    Ok(())
                } else {
                    Err(FlushError::CommandFailed("systemd resolver flush"))
                }
            }
            FlushMethod::Nscd => {
                if run_command("nscd", &["-i", "hosts"]).await
                    || run_command("service", &["nscd", "restart"]).await
                {
                    Ok(())
                } else {
                    Err(FlushError::CommandFailed("nscd"))
                }
            }
            _ => {
                // Newest systemd tool first, then its predecessor, then nscd.
                // No resolver daemon at all means the hosts file is consulted
                // directly, so that is a success.
                if run_command("resolvectl", &["flush-caches"]).await {
                    return Ok(());
                }
                if run_command("systemd-resolve", &["--flush-caches"]).await {
                    return Ok(());
                }
                if run_command("nscd", &["-i", "hosts"]).await {
                    return Ok(());
                }
                debug!("no resolver cache daemon found, nothing to flush");
                Ok(())
            }
        }
    }
}

/// Runs a flush utility, swallowing spawn failures (missing binary) into a
/// plain `false`.
async fn run_command(name: &str, args: &[&str]) -> bool {
    match Command::new(name)
        .args(args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(err) => {
            debug!(command = name, error = %err, "flush command unavailable");
            false
        }
    }
}
