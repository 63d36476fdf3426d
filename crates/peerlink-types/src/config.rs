//! Node configuration model.
//!
//! Every section carries `#[serde(default)]` so a partial TOML file (or none
//! at all) yields a usable configuration.

use crate::error::PeerlinkError;
use crate::peer::{PeerAddr, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default TTL requested for each advertisement (15 minutes).
pub const DEFAULT_ADVERTISE_TTL_SECS: u64 = 15 * 60;

/// Default wait after a failed advertisement round (2 minutes).
pub const DEFAULT_RETRY_BACKOFF_SECS: u64 = 2 * 60;

/// Default bound on a single discovery search.
pub const DEFAULT_FIND_TIMEOUT_SECS: u64 = 10;

/// Default bound on a single connection attempt.
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 5;

/// Service name used when none is configured.
pub const DEFAULT_SERVICE_NAME: &str = "peerlink";

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Log filter used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Service names served (and advertised) by this node.
    pub services: Vec<String>,
    /// Listener configuration for the RPC mux.
    pub rpc: RpcConfig,
    /// Peer host configuration.
    pub p2p: P2pConfig,
    /// Advertisement and lookup tuning.
    pub discovery: DiscoveryConfig,
    /// Fixed service -> address table (`host:port` or a Unix socket path).
    pub static_addresses: BTreeMap<String, String>,
    /// Background task pool.
    pub scheduler: SchedulerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            services: vec![DEFAULT_SERVICE_NAME.to_string()],
            rpc: RpcConfig::default(),
            p2p: P2pConfig::default(),
            discovery: DiscoveryConfig::default(),
            static_addresses: BTreeMap::new(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), PeerlinkError> {
        if self.rpc.tcp_listen.is_none() && self.rpc.unix_socket.is_none() && !self.rpc.use_p2p {
            return Err(PeerlinkError::Config(
                "no RPC listener configured: set rpc.tcp_listen, rpc.unix_socket or rpc.use_p2p"
                    .into(),
            ));
        }
        if self.services.iter().any(|s| s.trim().is_empty()) {
            return Err(PeerlinkError::Config("service names must not be empty".into()));
        }
        if self.discovery.advertise_ttl_secs == 0 {
            return Err(PeerlinkError::Config(
                "discovery.advertise_ttl_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Which listeners feed the RPC mux.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// TCP listen address, e.g. `0.0.0.0:7400`.
    pub tcp_listen: Option<SocketAddr>,
    /// Unix domain socket path.
    pub unix_socket: Option<PathBuf>,
    /// Accept RPC connections over the peer transport.
    pub use_p2p: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            tcp_listen: Some(SocketAddr::from(([127, 0, 0, 1], 7400))),
            unix_socket: None,
            use_p2p: true,
        }
    }
}

/// Peer host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Address the peer host binds to.
    pub listen_addr: SocketAddr,
    /// This node's identifier. Generated at boot when absent.
    pub node_id: Option<PeerId>,
    /// Pre-shared key for stream authentication. Empty disables HMAC checks.
    pub shared_secret: String,
    /// Peers to connect to at boot.
    pub bootstrap: Vec<PeerAddr>,
    /// Run the peer-exchange protocol.
    pub enable_mesher: bool,
    /// Where advertisements are registered.
    pub rendezvous: RendezvousMode,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7401)),
            node_id: None,
            shared_secret: String::new(),
            bootstrap: Vec::new(),
            enable_mesher: true,
            rendezvous: RendezvousMode::SelfHosted,
        }
    }
}

/// Rendezvous point selection.
///
/// Serialized as `"off"`, `"self"` or a peer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RendezvousMode {
    /// No discovery backend; the resolver falls back to static addresses.
    Off,
    /// This node serves the registration table itself.
    SelfHosted,
    /// Register with and query the given peer.
    Peer(PeerId),
}

impl TryFrom<String> for RendezvousMode {
    type Error = PeerlinkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim() {
            "off" | "" => Ok(Self::Off),
            "self" => Ok(Self::SelfHosted),
            other => Ok(Self::Peer(other.parse()?)),
        }
    }
}

impl From<RendezvousMode> for String {
    fn from(value: RendezvousMode) -> Self {
        match value {
            RendezvousMode::Off => "off".to_string(),
            RendezvousMode::SelfHosted => "self".to_string(),
            RendezvousMode::Peer(id) => id.to_string(),
        }
    }
}

/// Advertisement and lookup tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub advertise_ttl_secs: u64,
    pub retry_backoff_secs: u64,
    pub find_timeout_secs: u64,
    pub dial_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            advertise_ttl_secs: DEFAULT_ADVERTISE_TTL_SECS,
            retry_backoff_secs: DEFAULT_RETRY_BACKOFF_SECS,
            find_timeout_secs: DEFAULT_FIND_TIMEOUT_SECS,
            dial_timeout_secs: DEFAULT_DIAL_TIMEOUT_SECS,
        }
    }
}

impl DiscoveryConfig {
    pub fn advertise_ttl(&self) -> Duration {
        Duration::from_secs(self.advertise_ttl_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn find_timeout(&self) -> Duration {
        Duration::from_secs(self.find_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

/// Background task pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum concurrently running tasks. 0 means unbounded.
    pub max_workers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.services, vec!["peerlink".to_string()]);
        assert_eq!(config.discovery.advertise_ttl(), Duration::from_secs(900));
        assert_eq!(config.discovery.retry_backoff(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            services = ["svc1", "svc2"]

            [rpc]
            use_p2p = false
            unix_socket = "/tmp/peerlink.sock"

            [static_addresses]
            svc3 = "localhost:10081"
        "#,
        )
        .unwrap();
        assert_eq!(config.services.len(), 2);
        assert!(!config.rpc.use_p2p);
        assert!(config.rpc.tcp_listen.is_none());
        assert_eq!(config.rpc.unix_socket, Some(PathBuf::from("/tmp/peerlink.sock")));
        assert_eq!(config.static_addresses["svc3"], "localhost:10081");
        assert_eq!(config.log_level, "info");
        assert!(config.p2p.enable_mesher);
    }

    #[test]
    fn test_rendezvous_mode_serde() {
        let config: NodeConfig = toml::from_str(
            r#"
            [p2p]
            rendezvous = "node-b"
            bootstrap = [{ id = "node-b", addrs = ["127.0.0.1:7401"] }]
        "#,
        )
        .unwrap();
        assert_eq!(config.p2p.rendezvous, RendezvousMode::Peer(PeerId::new("node-b")));
        assert_eq!(config.p2p.bootstrap[0].id.as_str(), "node-b");

        let off: RendezvousMode = RendezvousMode::try_from("off".to_string()).unwrap();
        assert_eq!(off, RendezvousMode::Off);
        assert_eq!(String::from(RendezvousMode::SelfHosted), "self");
    }

    #[test]
    fn test_validate_rejects_no_listeners() {
        let mut config = NodeConfig::default();
        config.rpc.tcp_listen = None;
        config.rpc.use_p2p = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let mut config = NodeConfig::default();
        config.discovery.advertise_ttl_secs = 0;
        assert!(config.validate().is_err());
    }
}
