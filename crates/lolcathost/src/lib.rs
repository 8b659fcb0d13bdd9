//! lolcathost: a privileged daemon that reconciles a declarative YAML
//! configuration into a marker-delimited region of the system hosts file,
//! plus the unix-socket protocol and CLI used to drive it.

pub mod client;
pub mod config;
pub mod server;
