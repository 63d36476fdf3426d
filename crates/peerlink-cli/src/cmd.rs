//! Subcommand implementations.

use crate::cli::Cli;
use crate::ui;
use peerlink_kernel::config::{default_config_path, load_config, write_config};
use peerlink_kernel::{KernelError, Node};
use peerlink_types::config::NodeConfig;
use peerlink_wire::scheduler::{Task, TaskScheduler};
use peerlink_wire::{Conn, Mux, TransportError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        ui::error(&format!("Failed to start the async runtime: {e}"));
        std::process::exit(1);
    })
}

fn boot_error(e: &KernelError) -> ! {
    match e {
        KernelError::Peerlink(inner) => {
            ui::error_with_fix(&inner.to_string(), "Check ~/.peerlink/config.toml")
        }
        KernelError::Host(inner) => ui::error_with_fix(
            &format!("Peer host failed to start: {inner}"),
            "Is another node already bound to p2p.listen_addr?",
        ),
        other => ui::error(&format!("Boot failed: {other}")),
    }
    std::process::exit(1);
}

pub fn cmd_init(config: Option<PathBuf>, force: bool) {
    let path = config.unwrap_or_else(default_config_path);
    match write_config(&path, &NodeConfig::default(), force) {
        Ok(()) => {
            ui::success(&format!("Created: {}", path.display()));
            ui::hint("Edit the file, then run `peerlink start`");
        }
        Err(e) => {
            ui::error(&format!("Failed to write config: {e}"));
            std::process::exit(1);
        }
    }
}

pub fn cmd_start(config: Option<PathBuf>) {
    let cfg = load_config(config.as_deref());
    let rt = runtime();
    rt.block_on(async {
        let node = match Node::boot(cfg).await {
            Ok(node) => node,
            Err(e) => boot_error(&e),
        };

        let echo = Arc::clone(node.mux());
        if let Err(e) = node
            .scheduler()
            .go("Echo server", Task::new(move |cancel| serve_echo(echo, cancel)))
        {
            ui::error(&format!("Failed to start the echo server: {e}"));
        }

        ui::banner();
        ui::blank();
        match node.peer_addr() {
            Some(addr) => ui::kv("Peer", &addr.to_string()),
            None => ui::kv("Peer", "disabled"),
        }
        for (tag, state) in node.mux().status() {
            ui::kv("Listener", &format!("{tag} ({state})"));
        }
        ui::kv("Services", &node.config().services.join(", "));
        ui::blank();
        ui::hint("Press Ctrl+C to stop the node");

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C, shutting down");
        }
        info!("Shutdown requested");
        debug!(status = %node.status_snapshot(), "Final status");
        if let Err(e) = node.shutdown().await {
            ui::error(&format!("Shutdown finished with errors: {e}"));
            std::process::exit(1);
        }
        ui::blank();
        println!("  peerlink node stopped.");
    });
}

/// Serve every accepted RPC connection by echoing its bytes back.
async fn serve_echo(mux: Arc<Mux>, cancel: peerlink_wire::CancelToken) -> Result<(), TransportError> {
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = mux.accept() => match accepted {
                Ok(conn) => conn,
                Err(TransportError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            },
        };
        tokio::spawn(echo(conn));
    }
}

async fn echo(conn: Conn) {
    let remote = conn.remote_addr().to_string();
    let (mut reader, mut writer) = tokio::io::split(conn);
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => debug!(%remote, bytes, "Echo connection finished"),
        Err(e) => debug!(%remote, error = %e, "Echo connection failed"),
    }
}

/// The configuration of a short-lived resolving node: no RPC listeners of its
/// own, nothing advertised, a fresh identity on an ephemeral port.
pub fn client_config(mut config: NodeConfig) -> NodeConfig {
    config.rpc.tcp_listen = None;
    config.rpc.unix_socket = None;
    config.services.clear();
    config.p2p.node_id = None;
    config.p2p.listen_addr = SocketAddr::new(config.p2p.listen_addr.ip(), 0);
    config
}

pub fn cmd_resolve(config: Option<PathBuf>, service: &str, timeout: Option<u64>) {
    let cfg = client_config(load_config(config.as_deref()));
    let rt = runtime();
    let code = rt.block_on(async {
        let node = match Node::boot(cfg).await {
            Ok(node) => node,
            Err(e) => boot_error(&e),
        };
        let code = match node.resolve(service, timeout.map(Duration::from_secs)).await {
            Ok(conn) => {
                ui::success(&format!("{service} -> {}", conn.remote_addr()));
                0
            }
            Err(e) => {
                ui::error_with_fix(
                    &format!("Could not resolve {service}: {e}"),
                    "Check static_addresses or that a provider is advertising it",
                );
                1
            }
        };
        if let Err(e) = node.shutdown().await {
            warn!(error = %e, "Transient node shutdown reported errors");
        }
        code
    });
    std::process::exit(code);
}

pub fn cmd_config_show(config: Option<PathBuf>) {
    let cfg = load_config(config.as_deref());
    match toml::to_string_pretty(&cfg) {
        Ok(text) => print!("{text}"),
        Err(e) => {
            ui::error(&format!("Failed to render config: {e}"));
            std::process::exit(1);
        }
    }
}

pub fn cmd_config_path(config: Option<PathBuf>) {
    println!("{}", config.unwrap_or_else(default_config_path).display());
}

pub fn cmd_completion(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "peerlink", &mut std::io::stdout());
}
