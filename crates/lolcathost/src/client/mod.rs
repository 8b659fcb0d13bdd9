//! Command-line front-end speaking the daemon protocol.
//!
//! Every subcommand except `daemon` maps to one request type and talks to
//! the daemon over the unix socket with the blocking [`Client`].

mod error;
mod output;
mod socket;

pub use error::{ClientError, EXIT_ERROR, EXIT_USAGE};
pub use socket::{is_daemon_running, Client};

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use lolcathost_common::protocol::SOCKET_PATH;
use output::print_items;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Parser)]
#[command(name = "lolcathost")]
#[command(version, about = "Declarative host-name overrides for the system hosts file", long_about = None)]
pub struct Cli {
    /// Daemon socket path
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    /// Output format for list-style commands
    #[arg(long, global = true, default_value = "table")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the privileged daemon (requires root)
    Daemon {
        /// Path to the configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// List all host entries
    List,
    /// Show daemon status
    Status,
    /// Enable an entry by alias
    On {
        alias: String,
        /// Proceed even if another enabled alias maps the same domain
        #[arg(long)]
        force: bool,
    },
    /// Disable an entry by alias
    Off { alias: String },
    /// Add a host entry
    Add {
        /// Domain to map
        #[arg(long)]
        domain: String,
        /// IPv4 or IPv6 address
        #[arg(long)]
        ip: String,
        /// Alias slug; derived from the domain when omitted
        #[arg(long)]
        alias: Option<String>,
        /// Target group; created if missing
        #[arg(long, default_value = "default")]
        group: String,
        /// Add the entry without enabling it
        #[arg(long)]
        disabled: bool,
    },
    /// Delete a host entry by alias
    Delete { alias: String },
    /// Rewrite the managed hosts region from the configuration
    Sync,
    /// Apply a named preset
    Preset { name: String },
    /// List hosts-file backups
    Backups,
    /// Restore a backup by name
    Rollback { backup_name: String },
    /// Print the raw content of a backup
    BackupContent { backup_name: String },
    /// Manage groups
    Group(GroupArgs),
    /// Manage presets
    Presets(PresetArgs),
}

#[derive(Args)]
pub struct GroupArgs {
    #[command(subcommand)]
    pub command: GroupCommand,
}

#[derive(Subcommand)]
pub enum GroupCommand {
    /// List group names
    List,
    /// Add an empty group
    Add { name: String },
    /// Delete a group and every host in it
    Delete { name: String },
    /// Rename a group
    Rename { old_name: String, new_name: String },
}

#[derive(Args)]
pub struct PresetArgs {
    #[command(subcommand)]
    pub command: PresetCommand,
}

#[derive(Subcommand)]
pub enum PresetCommand {
    /// List presets
    List,
    /// Add a preset
    Add {
        name: String,
        /// Alias to enable when applied (repeatable)
        #[arg(long = "enable")]
        enable: Vec<String>,
        /// Alias to disable when applied (repeatable)
        #[arg(long = "disable")]
        disable: Vec<String>,
    },
    /// Delete a preset
    Delete { name: String },
}

/// Runs a client subcommand. `Commands::Daemon` is handled in `main`.
pub fn run(cli: Cli) -> Result<ExitCode> {
    let socket_path = cli
        .socket
        .unwrap_or_else(|| PathBuf::from(SOCKET_PATH));

    let client = Client::new(&socket_path);
    if let Err(err) = client.connect() {
        eprintln!(
            "daemon is not running (socket {}): {err}",
            socket_path.display()
        );
        eprintln!("start it with: sudo lolcathost daemon");
        return Ok(ExitCode::from(EXIT_ERROR));
    }

    match dispatch(&client, cli.command, cli.format) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            eprintln!("{err}");
            Ok(ExitCode::from(err.exit_code()))
        }
    }
}

fn dispatch(client: &Client, command: Commands, format: OutputFormat) -> Result<(), ClientError> {
    match command {
        Commands::Daemon { .. } => unreachable!("daemon mode is handled in main"),

        Commands::List => {
            let entries = client.list()?;
            if entries.is_empty() {
                println!("no host entries configured");
            } else {
                print_items(&entries, format);
            }
            Ok(())
        }
        Commands::Status => {
            let status = client.status()?;
            println!("running:  {}", status.running);
            println!("version:  {}", status.version);
            println!("uptime:   {}s", status.uptime);
            println!("active:   {}", status.active_count);
            println!("requests: {}", status.request_count);
            Ok(())
        }
        Commands::On { alias, force } => {
            let data = client.enable(&alias, force)?;
            println!("enabled {} ({alias})", data.domain);
            Ok(())
        }
        Commands::Off { alias } => {
            let data = client.disable(&alias)?;
            println!("disabled {} ({alias})", data.domain);
            Ok(())
        }
        Commands::Add {
            domain,
            ip,
            alias,
            group,
            disabled,
        } => {
            let data = client.add(
                &domain,
                &ip,
                alias.as_deref().unwrap_or(""),
                &group,
                !disabled,
            )?;
            println!("added {}", data.domain);
            Ok(())
        }
        Commands::Delete { alias } => {
            client.delete(&alias)?;
            println!("deleted {alias}");
            Ok(())
        }
        Commands::Sync => {
            client.sync()?;
            println!("hosts file synchronized");
            Ok(())
        }
        Commands::Preset { name } => {
            client.apply_preset(&name)?;
            println!("applied preset {name}");
            Ok(())
        }
        Commands::Backups => {
            let backups = client.backups()?;
            if backups.is_empty() {
                println!("no backups");
            } else {
                print_items(&backups, format);
            }
            Ok(())
        }
        Commands::Rollback { backup_name } => {
            client.rollback(&backup_name)?;
            println!("restored {backup_name}");
            Ok(())
        }
        Commands::BackupContent { backup_name } => {
            print!("{}", client.backup_content(&backup_name)?);
            Ok(())
        }
        Commands::Group(args) => match args.command {
            GroupCommand::List => {
                for name in client.list_groups()? {
                    println!("{name}");
                }
                Ok(())
            }
            GroupCommand::Add { name } => {
                client.add_group(&name)?;
                println!("added group {name}");
                Ok(())
            }
            GroupCommand::Delete { name } => {
                client.delete_group(&name)?;
                println!("deleted group {name}");
                Ok(())
            }
            GroupCommand::Rename { old_name, new_name } => {
                client.rename_group(&old_name, &new_name)?;
                println!("renamed group {old_name} to {new_name}");
                Ok(())
            }
        },
        Commands::Presets(args) => match args.command {
            PresetCommand::List => {
                let presets = client.list_presets()?;
                if presets.is_empty() {
                    println!("no presets");
                } else {
                    print_items(&presets, format);
                }
                Ok(())
            }
            PresetCommand::Add {
                name,
                enable,
                disable,
            } => {
                client.add_preset(&name, enable, disable)?;
                println!("added preset {name}");
                Ok(())
            }
            PresetCommand::Delete { name } => {
                client.delete_preset(&name)?;
                println!("deleted preset {name}");
                Ok(())
            }
        },
    }
}
