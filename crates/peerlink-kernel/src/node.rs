//! The peerlink node: builds every component from a [`NodeConfig`], owns
//! them for the node's lifetime and tears them down in reverse order.

use crate::error::{KernelError, KernelResult};
use crate::status::{Status, StatusManager};
use crate::supervisor::Supervisor;
use peerlink_types::config::{NodeConfig, RendezvousMode};
use peerlink_types::PeerAddr;
use peerlink_wire::discovery::{Advertiser, DiscoveryProvider, Registrations};
use peerlink_wire::host::{PeerHost, TcpHostConfig, TcpPeerHost};
use peerlink_wire::mesher::Mesher;
use peerlink_wire::mux::{ErrorReporter, Mux};
use peerlink_wire::p2p::P2pListener;
use peerlink_wire::protocols::ProtocolsService;
use peerlink_wire::rendezvous::Rendezvous;
use peerlink_wire::resolver::{ChainResolver, ClientResolver, PeerResolver, StaticResolver};
use peerlink_wire::scheduler::{TaskScheduler, TokioScheduler};
use peerlink_wire::transport::{DialOptions, TaggedListener};
use peerlink_wire::{CancelToken, Conn, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long shutdown waits for background tasks before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Node {
    config: NodeConfig,
    lifetime: CancelToken,
    supervisor: Arc<Supervisor>,
    status: Arc<StatusManager>,
    scheduler: TokioScheduler,
    host: Option<Arc<TcpPeerHost>>,
    protocols: Option<Arc<ProtocolsService>>,
    mesher: Option<Arc<Mesher>>,
    rendezvous: Option<Arc<Rendezvous>>,
    mux: Arc<Mux>,
    advertiser: Option<Arc<Advertiser>>,
    resolver: Option<Arc<dyn ClientResolver>>,
}

impl Node {
    /// Build and start a node.
    pub async fn boot(config: NodeConfig) -> KernelResult<Self> {
        config.validate()?;
        info!("Booting peerlink node");

        let lifetime = CancelToken::new();
        let supervisor = Arc::new(Supervisor::new());
        let status = Arc::new(StatusManager::new());
        let scheduler = TokioScheduler::new(config.scheduler.max_workers);

        // --- Peer host and protocols ---
        let mut host = None;
        let mut protocols = None;
        let mut mesher = None;
        let mut rendezvous = None;
        if config.rpc.use_p2p {
            let tcp_host = TcpPeerHost::start(TcpHostConfig::from(&config.p2p)).await?;
            let dyn_host: Arc<dyn PeerHost> = tcp_host.clone();
            let service = Arc::new(ProtocolsService::new(Arc::clone(&dyn_host)));

            if config.p2p.enable_mesher {
                mesher = Some(Mesher::start(&service, Arc::clone(&dyn_host), &scheduler)?);
            }

            let point = match &config.p2p.rendezvous {
                RendezvousMode::Off => None,
                RendezvousMode::SelfHosted => Some(None),
                RendezvousMode::Peer(id) => Some(Some(id.clone())),
            };
            if let Some(point) = point {
                rendezvous = Some(Rendezvous::start(
                    &service,
                    Arc::clone(&dyn_host),
                    Arc::new(Registrations::new()),
                    point,
                    lifetime.child(),
                ));
            }

            for peer in &config.p2p.bootstrap {
                if let Err(e) = tcp_host.connect(peer).await {
                    warn!(%peer, error = %e, "Bootstrap peer unreachable");
                }
            }

            host = Some(tcp_host);
            protocols = Some(service);
        }

        // --- RPC listeners ---
        let mut listeners = Vec::new();
        if let Some(addr) = config.rpc.tcp_listen {
            listeners.push(TaggedListener::tcp(addr));
        }
        if let Some(path) = &config.rpc.unix_socket {
            #[cfg(unix)]
            listeners.push(TaggedListener::unix(path.clone()));
            #[cfg(not(unix))]
            warn!(path = %path.display(), "Unix sockets are not supported on this platform");
        }
        if let Some(h) = &host {
            listeners.push(P2pListener::tagged(h.clone()));
        }

        let reporter: ErrorReporter = {
            let supervisor = Arc::clone(&supervisor);
            let status = Arc::clone(&status);
            Arc::new(move |tag: &str, err: &TransportError| {
                supervisor.record_failure(tag, &err.to_string());
                status.report("RPC Listeners", Status::map([(tag, format!("failed: {err}"))]));
            })
        };
        let mux = Arc::new(
            Mux::new(&lifetime, listeners, Arc::new(scheduler.clone()))?.with_error_reporter(reporter),
        );
        mux.start(&lifetime).await?;

        // --- Advertiser ---
        let mut advertiser = None;
        if let Some(rv) = &rendezvous {
            if !config.services.is_empty() {
                let backend: Arc<dyn DiscoveryProvider> = rv.clone();
                let adv = Arc::new(
                    Advertiser::new(backend, config.services.clone())
                        .with_ttl(config.discovery.advertise_ttl())
                        .with_backoff(config.discovery.retry_backoff()),
                );
                scheduler.go("Advertiser", Arc::clone(&adv).into_task())?;
                advertiser = Some(adv);
            }
        }

        // --- Client resolver ---
        let mut chain: Vec<Arc<dyn ClientResolver>> = Vec::new();
        if !config.static_addresses.is_empty() {
            chain.push(Arc::new(StaticResolver::new(config.static_addresses.clone())));
        }
        if let (Some(h), Some(rv)) = (&host, &rendezvous) {
            let discovery: Arc<dyn DiscoveryProvider> = rv.clone();
            chain.push(Arc::new(
                PeerResolver::new(h.clone(), discovery, config.services.clone())
                    .with_timeouts(config.discovery.find_timeout(), config.discovery.dial_timeout()),
            ));
        }
        let resolver: Option<Arc<dyn ClientResolver>> = match chain.len() {
            0 => None,
            1 => chain.pop(),
            _ => Some(Arc::new(ChainResolver::new(chain))),
        };

        let node = Self {
            config,
            lifetime,
            supervisor,
            status,
            scheduler,
            host,
            protocols,
            mesher,
            rendezvous,
            mux,
            advertiser,
            resolver,
        };
        node.report_status();
        if let Some(addr) = node.peer_addr() {
            info!(peer = %addr, "Node ready");
        } else {
            info!("Node ready (peer transport disabled)");
        }
        Ok(node)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn scheduler(&self) -> &TokioScheduler {
        &self.scheduler
    }

    pub fn mux(&self) -> &Arc<Mux> {
        &self.mux
    }

    pub fn host(&self) -> KernelResult<&Arc<TcpPeerHost>> {
        self.host.as_ref().ok_or(KernelError::NotConfigured("peer host"))
    }

    pub fn protocols(&self) -> KernelResult<&Arc<ProtocolsService>> {
        self.protocols
            .as_ref()
            .ok_or(KernelError::NotConfigured("protocols service"))
    }

    pub fn mesher(&self) -> KernelResult<&Arc<Mesher>> {
        self.mesher.as_ref().ok_or(KernelError::NotConfigured("mesher"))
    }

    pub fn rendezvous(&self) -> KernelResult<&Arc<Rendezvous>> {
        self.rendezvous
            .as_ref()
            .ok_or(KernelError::NotConfigured("rendezvous discovery"))
    }

    pub fn advertiser(&self) -> KernelResult<&Arc<Advertiser>> {
        self.advertiser
            .as_ref()
            .ok_or(KernelError::NotConfigured("advertiser"))
    }

    pub fn resolver(&self) -> KernelResult<&Arc<dyn ClientResolver>> {
        self.resolver
            .as_ref()
            .ok_or(KernelError::NotConfigured("client resolver"))
    }

    /// This node's peer id and dialable addresses, if the peer host runs.
    pub fn peer_addr(&self) -> Option<PeerAddr> {
        self.host.as_ref().map(|h| h.addr_info())
    }

    /// Resolve `service` to a connection through the configured resolver.
    pub async fn resolve(&self, service: &str, timeout: Option<Duration>) -> KernelResult<Conn> {
        let resolver = self.resolver()?;
        let options = DialOptions { timeout };
        Ok(resolver.get(&self.lifetime.child(), service, &options).await?)
    }

    /// Refresh the status entries from the live components.
    pub fn report_status(&self) {
        let listeners = self.mux.status();
        self.status.report(
            "RPC Listeners",
            Status::map(listeners.iter().map(|(tag, state)| (tag.clone(), state.to_string()))),
        );
        let advertiser = match &self.advertiser {
            Some(adv) => adv.status().to_string(),
            None => "disabled".to_string(),
        };
        self.status.report("Advertiser", Status::text(advertiser));
        let tasks = self.scheduler.status();
        self.status.report(
            "Task Manager",
            Status::text(format!("{} running: {}", tasks.len(), tasks.join(", "))),
        );
    }

    /// JSON view of every component's status.
    pub fn status_snapshot(&self) -> serde_json::Value {
        self.report_status();
        self.status.snapshot()
    }

    /// Close the mux, stop background tasks and the peer host. Safe to call
    /// more than once.
    pub async fn shutdown(&self) -> KernelResult<()> {
        if self.supervisor.is_shutting_down() {
            return Ok(());
        }
        self.supervisor.shutdown();

        let closed = self.mux.close().await;
        if let Err(e) = &closed {
            warn!(error = %e, "Errors while closing RPC listeners");
        }
        self.lifetime.cancel();

        let aborted = self.scheduler.shutdown(SHUTDOWN_GRACE).await;
        if aborted > 0 {
            warn!(aborted, "Background tasks aborted at shutdown");
        }
        if let Some(host) = &self.host {
            host.shutdown();
        }
        info!("Node stopped");
        closed.map_err(KernelError::from)
    }
}
