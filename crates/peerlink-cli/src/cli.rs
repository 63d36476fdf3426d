//! Clap CLI definitions for peerlink.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  peerlink init                 Write a default ~/.peerlink/config.toml
  peerlink start                Run a node until Ctrl+C
  peerlink resolve svc1         Find a provider of svc1 and connect to it
  peerlink config show          Print the effective configuration";

/// peerlink: service discovery and connection multiplexing over a peer network.
#[derive(Parser)]
#[command(name = "peerlink", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default config file.
    Init {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },
    /// Boot a node and serve connections until interrupted.
    Start,
    /// Resolve a service and print the address of the connection obtained.
    Resolve {
        /// Service name, e.g. "svc1".
        service: String,
        /// Per-dial timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Inspect the configuration [*].
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Generate shell completion scripts.
    Completion {
        /// Shell to generate completions for.
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the configuration after includes are merged.
    Show,
    /// Print the config file path.
    Path,
}
