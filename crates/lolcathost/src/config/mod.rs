//! Declarative configuration: the document model and its operations.
//!
//! The configuration is the authoritative description of every host override
//! the daemon manages. The hosts file is derived state; this document is what
//! users edit and what every mutation request manipulates.

mod store;
mod watcher;

pub use store::ConfigStore;
pub use watcher::ConfigWatcher;

use lolcathost_common::validation::{
    is_blocked_domain, validate_alias, validate_domain, validate_ip,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// System-wide configuration directory used by the daemon.
pub const SYSTEM_CONFIG_DIR: &str = "/etc/lolcathost";

/// System-wide configuration file path used by the daemon.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/lolcathost/config.yaml";

/// Flush-method tokens accepted in `settings.flushMethod`.
const FLUSH_METHOD_TOKENS: &[&str] = &["", "auto", "dscacheutil", "killall", "both"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("invalid IP address: {0}")]
    InvalidIp(String),

    #[error("invalid alias: {0}")]
    InvalidAlias(String),

    #[error("domain is blocked: {0}")]
    BlockedDomain(String),

    #[error("alias already exists: {0}")]
    DuplicateAlias(String),

    #[error("domain {domain} already mapped by alias {shadowed_by} (use force to override)")]
    DomainConflict { domain: String, shadowed_by: String },

    #[error("alias not found: {0}")]
    AliasNotFound(String),

    #[error("group already exists: {0}")]
    DuplicateGroup(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("preset already exists: {0}")]
    DuplicatePreset(String),

    #[error("preset not found: {0}")]
    PresetNotFound(String),

    #[error("{field}: {message}")]
    Invalid { field: String, message: String },

    #[error("failed to read config file: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write config file: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl ConfigError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Global settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "autoApply", default)]
    pub auto_apply: bool,

    #[serde(rename = "flushMethod", default)]
    pub flush_method: String,
}

/// A single host override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub domain: String,
    pub ip: String,
    pub alias: String,
    pub enabled: bool,
}

/// A named collection of hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<Host>,
}

/// A named batch that toggles the enabled state of listed aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enable: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disable: Vec<String>,
}

/// The root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsConfig {
    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub groups: Vec<Group>,

    #[serde(default)]
    pub presets: Vec<Preset>,
}

impl HostsConfig {
    /// Finds a host and the name of the group holding it.
    pub fn find_host(&self, alias: &str) -> Option<(&Host, &str)> {
        self.groups.iter().find_map(|g| {
            g.hosts
                .iter()
                .find(|h| h.alias == alias)
                .map(|h| (h, g.name.as_str()))
        })
    }

    /// Sets the enabled flag of a host. Returns whether the alias existed.
    pub fn set_host_enabled(&mut self, alias: &str, enabled: bool) -> bool {
        for group in &mut self.groups {
            if let Some(host) = group.hosts.iter_mut().find(|h| h.alias == alias) {
                host.enabled = enabled;
                return true;
            }
        }
        false
    }

    /// Derives a unique alias from a domain: `.` and `_` become `-`, the
    /// result is lowercased, and `-2`, `-3`, ... is appended until unique.
    pub fn generate_alias(&self, domain: &str) -> String {
        let base = domain.replace(['.', '_'], "-").to_ascii_lowercase();
        let mut alias = base.clone();
        let mut counter = 1u32;
        while self.find_host(&alias).is_some() {
            counter += 1;
            alias = format!("{base}-{counter}");
        }
        alias
    }

    /// Adds a host, creating the target group if missing.
    ///
    /// An empty `alias` is derived from the domain. Returns the final alias.
    pub fn add_host(
        &mut self,
        domain: &str,
        ip: &str,
        alias: &str,
        group_name: &str,
        enabled: bool,
    ) -> Result<String, ConfigError> {
        validate_domain(domain).map_err(|_| ConfigError::InvalidDomain(domain.to_string()))?;
        if is_blocked_domain(domain) {
            return Err(ConfigError::BlockedDomain(domain.to_string()));
        }
        validate_ip(ip).map_err(|_| ConfigError::InvalidIp(ip.to_string()))?;

        let alias = if alias.is_empty() {
            self.generate_alias(domain)
        } else {
            validate_alias(alias).map_err(|_| ConfigError::InvalidAlias(alias.to_string()))?;
            if self.find_host(alias).is_some() {
                return Err(ConfigError::DuplicateAlias(alias.to_string()));
            }
            alias.to_string()
        };

        let host = Host {
            domain: domain.to_string(),
            ip: ip.to_string(),
            alias: alias.clone(),
            enabled,
        };

        match self.groups.iter_mut().find(|g| g.name == group_name) {
            Some(group) => group.hosts.push(host),
            None => self.groups.push(Group {
                name: group_name.to_string(),
                hosts: vec![host],
            }),
        }
        Ok(alias)
    }

    /// Removes a host by alias. Returns whether a removal occurred.
    pub fn delete_host(&mut self, alias: &str) -> bool {
        for group in &mut self.groups {
            if let Some(idx) = group.hosts.iter().position(|h| h.alias == alias) {
                group.hosts.remove(idx);
                return true;
            }
        }
        false
    }

    /// Rewrites a host in place, moving it to `group_name` if that differs
    /// from its current group. The enabled flag is preserved.
    pub fn update_host(
        &mut self,
        old_alias: &str,
        domain: &str,
        ip: &str,
        new_alias: &str,
        group_name: &str,
    ) -> Result<(), ConfigError> {
        validate_domain(domain).map_err(|_| ConfigError::InvalidDomain(domain.to_string()))?;
        if is_blocked_domain(domain) {
            return Err(ConfigError::BlockedDomain(domain.to_string()));
        }
        validate_ip(ip).map_err(|_| ConfigError::InvalidIp(ip.to_string()))?;
        validate_alias(new_alias)
            .map_err(|_| ConfigError::InvalidAlias(new_alias.to_string()))?;

        let (group_idx, host_idx) = self
            .groups
            .iter()
            .enumerate()
            .find_map(|(gi, g)| {
                g.hosts
                    .iter()
                    .position(|h| h.alias == old_alias)
                    .map(|hi| (gi, hi))
            })
            .ok_or_else(|| ConfigError::AliasNotFound(old_alias.to_string()))?;

        if old_alias != new_alias && self.find_host(new_alias).is_some() {
            return Err(ConfigError::DuplicateAlias(new_alias.to_string()));
        }

        let enabled = self.groups[group_idx].hosts[host_idx].enabled;

        if self.groups[group_idx].name != group_name {
            self.groups[group_idx].hosts.remove(host_idx);
            let host = Host {
                domain: domain.to_string(),
                ip: ip.to_string(),
                alias: new_alias.to_string(),
                enabled,
            };
            match self.groups.iter_mut().find(|g| g.name == group_name) {
                Some(group) => group.hosts.push(host),
                None => self.groups.push(Group {
                    name: group_name.to_string(),
                    hosts: vec![host],
                }),
            }
        } else {
            let host = &mut self.groups[group_idx].hosts[host_idx];
            host.domain = domain.to_string();
            host.ip = ip.to_string();
            host.alias = new_alias.to_string();
        }
        Ok(())
    }

    /// Adds an empty group.
    pub fn add_group(&mut self, name: &str) -> Result<(), ConfigError> {
        if self.groups.iter().any(|g| g.name == name) {
            return Err(ConfigError::DuplicateGroup(name.to_string()));
        }
        self.groups.push(Group {
            name: name.to_string(),
            hosts: Vec::new(),
        });
        Ok(())
    }

    /// Removes a group and all hosts in it.
    pub fn delete_group(&mut self, name: &str) -> Result<(), ConfigError> {
        match self.groups.iter().position(|g| g.name == name) {
            Some(idx) => {
                self.groups.remove(idx);
                Ok(())
            }
            None => Err(ConfigError::GroupNotFound(name.to_string())),
        }
    }

    /// Renames a group.
    pub fn rename_group(&mut self, old_name: &str, new_name: &str) -> Result<(), ConfigError> {
        if self.groups.iter().any(|g| g.name == new_name) {
            return Err(ConfigError::DuplicateGroup(new_name.to_string()));
        }
        match self.groups.iter_mut().find(|g| g.name == old_name) {
            Some(group) => {
                group.name = new_name.to_string();
                Ok(())
            }
            None => Err(ConfigError::GroupNotFound(old_name.to_string())),
        }
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name.clone()).collect()
    }

    pub fn find_preset(&self, name: &str) -> Option<&Preset> {
        self.presets.iter().find(|p| p.name == name)
    }

    /// Applies a preset: the enable list first, then the disable list, so an
    /// alias appearing in both ends up disabled. Unknown aliases are skipped,
    /// which lets presets outlive the hosts they reference.
    pub fn apply_preset(&mut self, name: &str) -> Result<(), ConfigError> {
        let preset = self
            .find_preset(name)
            .ok_or_else(|| ConfigError::PresetNotFound(name.to_string()))?
            .clone();

        for alias in &preset.enable {
            self.set_host_enabled(alias, true);
        }
        for alias in &preset.disable {
            self.set_host_enabled(alias, false);
        }
        Ok(())
    }

    pub fn add_preset(
        &mut self,
        name: &str,
        enable: Vec<String>,
        disable: Vec<String>,
    ) -> Result<(), ConfigError> {
        if self.presets.iter().any(|p| p.name == name) {
            return Err(ConfigError::DuplicatePreset(name.to_string()));
        }
        self.presets.push(Preset {
            name: name.to_string(),
            enable,
            disable,
        });
        Ok(())
    }

    pub fn delete_preset(&mut self, name: &str) -> Result<(), ConfigError> {
        match self.presets.iter().position(|p| p.name == name) {
            Some(idx) => {
                self.presets.remove(idx);
                Ok(())
            }
            None => Err(ConfigError::PresetNotFound(name.to_string())),
        }
    }

    /// Guarantees at least one group. Returns whether `default` was added.
    pub fn ensure_default_group(&mut self) -> bool {
        if self.groups.is_empty() {
            self.groups.push(Group {
                name: "default".to_string(),
                hosts: Vec::new(),
            });
            true
        } else {
            false
        }
    }

    /// Number of enabled host entries across all groups.
    pub fn enabled_count(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|g| &g.hosts)
            .filter(|h| h.enabled)
            .count()
    }

    /// Validates the whole document: every host has a valid, unblocked
    /// domain, a valid IP and a unique valid alias; group and preset names
    /// are non-empty; the flush-method token is recognized.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !FLUSH_METHOD_TOKENS.contains(&self.settings.flush_method.as_str()) {
            return Err(ConfigError::invalid(
                "settings.flushMethod",
                format!("invalid flush method: {}", self.settings.flush_method),
            ));
        }

        let mut aliases = HashSet::new();
        for (gi, group) in self.groups.iter().enumerate() {
            if group.name.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("groups[{gi}].name"),
                    "group name is required",
                ));
            }
            for (hi, host) in group.hosts.iter().enumerate() {
                let field = format!("groups[{gi}].hosts[{hi}]");
                validate_domain(&host.domain).map_err(|_| {
                    ConfigError::invalid(
                        format!("{field}.domain"),
                        format!("invalid domain: {}", host.domain),
                    )
                })?;
                if is_blocked_domain(&host.domain) {
                    return Err(ConfigError::invalid(
                        format!("{field}.domain"),
                        format!("domain is blocked: {}", host.domain),
                    ));
                }
                validate_ip(&host.ip).map_err(|_| {
                    ConfigError::invalid(
                        format!("{field}.ip"),
                        format!("invalid IP address: {}", host.ip),
                    )
                })?;
                validate_alias(&host.alias).map_err(|_| {
                    ConfigError::invalid(
                        format!("{field}.alias"),
                        format!("invalid alias: {}", host.alias),
                    )
                })?;
                if !aliases.insert(host.alias.clone()) {
                    return Err(ConfigError::invalid(
                        format!("{field}.alias"),
                        format!("duplicate alias: {}", host.alias),
                    ));
                }
            }
        }

        for (pi, preset) in self.presets.iter().enumerate() {
            if preset.name.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("presets[{pi}].name"),
                    "preset name is required",
                ));
            }
            // Aliases listed in presets are deliberately not checked against
            // the host set: unknown aliases are skipped at apply time.
        }

        Ok(())
    }
}

/// The configuration written when none exists yet.
pub fn default_config() -> HostsConfig {
    HostsConfig {
        settings: Settings {
            auto_apply: true,
            flush_method: "auto".to_string(),
        },
        groups: vec![Group {
            name: "development".to_string(),
            hosts: vec![Host {
                domain: "example.local".to_string(),
                ip: "127.0.0.1".to_string(),
                alias: "example-local".to_string(),
                enabled: false,
            }],
        }],
        presets: vec![
            Preset {
                name: "local".to_string(),
                enable: vec!["example-local".to_string()],
                disable: vec![],
            },
            Preset {
                name: "clear".to_string(),
                enable: vec![],
                disable: vec!["example-local".to_string()],
            },
        ],
    }
}
