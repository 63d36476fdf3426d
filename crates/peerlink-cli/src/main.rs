//! peerlink CLI: run a node, resolve services, manage the config file.

mod cli;
mod cmd;
mod ui;

use crate::cli::*;
use clap::Parser;
use peerlink_kernel::config::{default_config_path, read_config};
use std::path::Path;

/// Log level for the subscriber: `RUST_LOG` wins, then the config file's
/// `log_level`, then "info".
fn init_tracing_stderr(config: Option<&Path>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let path = config
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);
        let level = read_config(&path)
            .map(|c| c.log_level)
            .unwrap_or_else(|_| "info".to_string());
        tracing_subscriber::EnvFilter::try_new(&level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr(cli.config.as_deref());

    match cli.command {
        Commands::Init { force } => cmd::cmd_init(cli.config, force),
        Commands::Start => cmd::cmd_start(cli.config),
        Commands::Resolve { service, timeout } => {
            cmd::cmd_resolve(cli.config, &service, timeout)
        }
        Commands::Config(ConfigCommands::Show) => cmd::cmd_config_show(cli.config),
        Commands::Config(ConfigCommands::Path) => cmd::cmd_config_path(cli.config),
        Commands::Completion { shell } => cmd::cmd_completion(shell),
    }
}
