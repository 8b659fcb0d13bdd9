use clap::Parser;
use lolcathost::client::{self, Cli, Commands};
use lolcathost::server;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { ref config } => {
            let config = config.clone();
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    eprintln!("failed to start runtime: {err}");
                    return ExitCode::FAILURE;
                }
            };
            match runtime.block_on(server::run(config)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    eprintln!("lolcathost daemon: {err:#}");
                    ExitCode::FAILURE
                }
            }
        }
        _ => match client::run(cli) {
            Ok(code) => code,
            Err(err) => {
                eprintln!("Error: {err}");
                ExitCode::FAILURE
            }
        },
    }
}
