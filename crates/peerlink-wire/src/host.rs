//! Peer host: opens and accepts protocol streams between peers.
//!
//! [`PeerHost`] is the networking collaborator everything above it is
//! written against. [`TcpPeerHost`] implements it with one TCP connection per
//! stream: the opener sends a [`StreamHeader`], the acceptor verifies it
//! (version, HMAC, registered protocol) and replies with a [`StreamAck`],
//! then hands the raw connection to the protocol's stream handler.

use crate::cancel::CancelToken;
use crate::conn::IoStream;
use crate::error::HostError;
use crate::message::*;
use crate::registry::PeerRegistry;

use async_trait::async_trait;
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use peerlink_types::config::P2pConfig;
use peerlink_types::{PeerAddr, PeerId};
use sha2::Sha256;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Protocol used by [`PeerHost::connect`] to complete a bare handshake.
pub const IDENTIFY_PROTOCOL_ID: &str = "/peerlink/id/1.0.0";

/// Upper bound on reading a handshake frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Generate HMAC-SHA256 signature for stream authentication.
fn hmac_sign(secret: &str, data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify HMAC-SHA256 signature using constant-time comparison.
fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    let expected = hmac_sign(secret, data);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}

/// Callback invoked for every accepted stream of one protocol.
pub type StreamHandler = Arc<dyn Fn(PeerStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Build a [`StreamHandler`] from an async closure.
pub fn stream_handler<F, Fut>(f: F) -> StreamHandler
where
    F: Fn(PeerStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |stream: PeerStream| -> BoxFuture<'static, ()> { Box::pin(f(stream)) })
}

/// An established stream to a peer under one protocol.
pub struct PeerStream {
    io: Box<dyn IoStream>,
    protocol: String,
    local_peer: PeerId,
    remote_peer: PeerId,
    local_socket: Option<SocketAddr>,
    remote_socket: Option<SocketAddr>,
}

impl PeerStream {
    pub fn new(
        io: impl IoStream,
        protocol: impl Into<String>,
        local_peer: PeerId,
        remote_peer: PeerId,
    ) -> Self {
        Self {
            io: Box::new(io),
            protocol: protocol.into(),
            local_peer,
            remote_peer,
            local_socket: None,
            remote_socket: None,
        }
    }

    fn over_tcp(stream: TcpStream, protocol: &str, local_peer: PeerId, remote_peer: PeerId) -> Self {
        let local_socket = stream.local_addr().ok();
        let remote_socket = stream.peer_addr().ok();
        let mut s = Self::new(stream, protocol, local_peer, remote_peer);
        s.local_socket = local_socket;
        s.remote_socket = remote_socket;
        s
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    pub fn local_socket(&self) -> Option<SocketAddr> {
        self.local_socket
    }

    pub fn remote_socket(&self) -> Option<SocketAddr> {
        self.remote_socket
    }

    pub(crate) fn into_io(self) -> Box<dyn IoStream> {
        self.io
    }

    /// Abort the stream so the remote side observes a reset.
    pub fn reset(self) {
        let mut io = self.io;
        io.abort();
    }
}

impl std::fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStream")
            .field("protocol", &self.protocol)
            .field("remote_peer", &self.remote_peer)
            .finish_non_exhaustive()
    }
}

/// A peer networking host capable of opening and accepting streams by
/// protocol identifier.
#[async_trait]
pub trait PeerHost: Send + Sync + 'static {
    /// This host's identity.
    fn id(&self) -> &PeerId;

    /// Addresses other peers can dial.
    fn listen_addrs(&self) -> Vec<SocketAddr>;

    fn addr_info(&self) -> PeerAddr {
        PeerAddr::new(self.id().clone(), self.listen_addrs())
    }

    /// Make sure `peer` is reachable, learning its addresses.
    async fn connect(&self, peer: &PeerAddr) -> Result<(), HostError>;

    /// Open a new stream to a known peer. Unknown peers fail with
    /// [`HostError::NoRoute`].
    async fn new_stream(&self, peer: &PeerId, protocol: &str) -> Result<PeerStream, HostError>;

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler);

    fn remove_stream_handler(&self, protocol: &str);

    fn is_connected(&self, peer: &PeerId) -> bool;

    /// Currently connected peers with their addresses.
    fn peers(&self) -> Vec<PeerAddr>;

    /// Notifications for peers that just became connected.
    fn subscribe_connected(&self) -> broadcast::Receiver<PeerAddr>;
}

/// Configuration for a [`TcpPeerHost`].
#[derive(Debug, Clone)]
pub struct TcpHostConfig {
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    /// This node's unique ID.
    pub node_id: PeerId,
    /// Pre-shared key for HMAC-SHA256 authentication. Empty disables it.
    pub shared_secret: String,
}

impl Default for TcpHostConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            node_id: PeerId::random(),
            shared_secret: String::new(),
        }
    }
}

impl From<&P2pConfig> for TcpHostConfig {
    fn from(config: &P2pConfig) -> Self {
        Self {
            listen_addr: config.listen_addr,
            node_id: config.node_id.clone().unwrap_or_else(PeerId::random),
            shared_secret: config.shared_secret.clone(),
        }
    }
}

/// TCP implementation of [`PeerHost`].
pub struct TcpPeerHost {
    config: TcpHostConfig,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
    registry: PeerRegistry,
    handlers: RwLock<HashMap<String, StreamHandler>>,
    connected_tx: broadcast::Sender<PeerAddr>,
    shutdown: CancelToken,
}

impl TcpPeerHost {
    /// Bind the listener and start accepting streams.
    pub async fn start(config: TcpHostConfig) -> Result<Arc<Self>, HostError> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        if config.shared_secret.is_empty() {
            warn!("P2P: no shared_secret configured, streams are unauthenticated");
        }
        info!(
            "P2P: listening on {} (node_id={})",
            local_addr, config.node_id
        );

        let (connected_tx, _) = broadcast::channel(64);
        let host = Arc::new(Self {
            config,
            local_addr,
            registry: PeerRegistry::new(),
            handlers: RwLock::new(HashMap::new()),
            connected_tx,
            shutdown: CancelToken::new(),
        });

        // Identify streams carry nothing past the handshake.
        host.set_stream_handler(IDENTIFY_PROTOCOL_ID, stream_handler(|_stream| async {}));

        let accept_host = Arc::clone(&host);
        tokio::spawn(async move {
            Self::accept_loop(listener, accept_host).await;
        });

        Ok(host)
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Stop accepting streams and drop every registered handler.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("P2P: shutting down host {}", self.config.node_id);
        self.shutdown.cancel();
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn credentials(&self) -> (String, String) {
        let nonce = uuid::Uuid::new_v4().to_string();
        if self.config.shared_secret.is_empty() {
            return (nonce, String::new());
        }
        let auth_data = format!("{}{}", nonce, self.config.node_id);
        let auth_hmac = hmac_sign(&self.config.shared_secret, auth_data.as_bytes());
        (nonce, auth_hmac)
    }

    fn verify(&self, nonce: &str, node_id: &PeerId, auth_hmac: &str) -> bool {
        if self.config.shared_secret.is_empty() {
            return true;
        }
        let expected_data = format!("{}{}", nonce, node_id);
        hmac_verify(&self.config.shared_secret, expected_data.as_bytes(), auth_hmac)
    }

    fn announce(&self, peer: &PeerId) {
        if !self.registry.mark_connected(peer) {
            return;
        }
        let info = self
            .registry
            .get_peer(peer)
            .map(|p| p.addr_info())
            .unwrap_or_else(|| PeerAddr::new(peer.clone(), Vec::new()));
        info!("P2P: connected to {}", info);
        // No subscribers is fine.
        let _ = self.connected_tx.send(info);
    }

    /// Internal accept loop, runs in a spawned task.
    async fn accept_loop(listener: TcpListener, host: Arc<TcpPeerHost>) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = host.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!("P2P: accepted connection from {}", addr);
                    let host = Arc::clone(&host);
                    tokio::spawn(async move {
                        if let Err(e) = host.handle_inbound(stream, addr).await {
                            debug!("P2P: inbound stream from {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("P2P: accept error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        debug!("P2P: accept loop stopped");
    }

    /// Verify an inbound handshake and dispatch the stream to its handler.
    async fn handle_inbound(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<(), HostError> {
        let header: StreamHeader = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame::<_, StreamHeader>(&mut stream))
            .await
            .map_err(|_| HostError::HandshakeFailed("timed out waiting for stream header".into()))??;

        if header.protocol_version != PROTOCOL_VERSION {
            let reject = StreamAck::Rejected {
                code: RejectCode::VersionMismatch,
                message: format!(
                    "Protocol version mismatch: expected {}, got {}",
                    PROTOCOL_VERSION, header.protocol_version
                ),
            };
            write_frame(&mut stream, &reject).await?;
            return Err(HostError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: header.protocol_version,
            });
        }

        // SECURITY: Verify the incoming HMAC before looking at the protocol
        if !self.verify(&header.nonce, &header.node_id, &header.auth_hmac) {
            warn!(
                "P2P: rejected stream from {} ({}): HMAC verification failed",
                header.node_id, addr
            );
            let reject = StreamAck::Rejected {
                code: RejectCode::Unauthorized,
                message: "HMAC authentication failed".to_string(),
            };
            write_frame(&mut stream, &reject).await?;
            return Err(HostError::AuthFailed(format!(
                "stream header from {} did not verify",
                header.node_id
            )));
        }

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&header.protocol)
            .cloned();
        let Some(handler) = handler else {
            let reject = StreamAck::Rejected {
                code: RejectCode::UnknownProtocol,
                message: format!("no handler for {}", header.protocol),
            };
            write_frame(&mut stream, &reject).await?;
            return Err(HostError::ProtocolNotSupported(header.protocol));
        };

        let (nonce, auth_hmac) = self.credentials();
        let ack = StreamAck::Accepted {
            node_id: self.config.node_id.clone(),
            listen_addrs: self.listen_addrs(),
            protocol_version: PROTOCOL_VERSION,
            nonce,
            auth_hmac,
        };
        write_frame(&mut stream, &ack).await?;

        if header.node_id != self.config.node_id {
            self.registry.add_addrs(&header.node_id, &header.listen_addrs);
            self.announce(&header.node_id);
        }
        debug!(
            "P2P: stream {} from {} ({})",
            header.protocol, header.node_id, addr
        );

        let peer_stream = PeerStream::over_tcp(
            stream,
            &header.protocol,
            self.config.node_id.clone(),
            header.node_id,
        );
        handler(peer_stream).await;
        Ok(())
    }

    /// Dial `peer` and complete the stream handshake for `protocol`.
    async fn open(&self, peer: &PeerId, protocol: &str) -> Result<PeerStream, HostError> {
        if self.shutdown.is_cancelled() {
            return Err(HostError::Shutdown);
        }
        let addrs = if *peer == self.config.node_id {
            vec![self.local_addr]
        } else {
            self.registry
                .get_peer(peer)
                .map(|p| p.addrs)
                .filter(|a| !a.is_empty())
                .ok_or_else(|| HostError::NoRoute(peer.clone()))?
        };

        let mut stream = None;
        let mut last_err = String::new();
        for addr in &addrs {
            match TcpStream::connect(addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!("P2P: dial {} at {} failed: {}", peer, addr, e);
                    last_err = format!("{addr}: {e}");
                }
            }
        }
        let Some(mut stream) = stream else {
            self.registry.mark_disconnected(peer);
            return Err(HostError::Unreachable {
                peer: peer.clone(),
                reason: last_err,
            });
        };

        let (nonce, auth_hmac) = self.credentials();
        let header = StreamHeader {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: self.config.node_id.clone(),
            listen_addrs: self.listen_addrs(),
            protocol: protocol.to_string(),
            protocol_version: PROTOCOL_VERSION,
            nonce,
            auth_hmac,
        };
        write_frame(&mut stream, &header).await?;

        let ack: StreamAck = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame::<_, StreamAck>(&mut stream))
            .await
            .map_err(|_| HostError::HandshakeFailed("timed out waiting for stream ack".into()))??;
        match ack {
            StreamAck::Accepted {
                node_id,
                listen_addrs,
                protocol_version,
                nonce,
                auth_hmac,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(HostError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }
                // SECURITY: Verify the ack HMAC
                if !self.verify(&nonce, &node_id, &auth_hmac) {
                    return Err(HostError::AuthFailed(
                        "HMAC verification failed on stream ack".into(),
                    ));
                }
                if node_id != *peer {
                    return Err(HostError::HandshakeFailed(format!(
                        "expected peer {peer}, reached {node_id}"
                    )));
                }
                if *peer != self.config.node_id {
                    self.registry.add_addrs(peer, &listen_addrs);
                    self.announce(peer);
                }
                Ok(PeerStream::over_tcp(
                    stream,
                    protocol,
                    self.config.node_id.clone(),
                    node_id,
                ))
            }
            StreamAck::Rejected { code, message } => {
                Err(StreamAck::into_error(code, message, protocol))
            }
        }
    }
}

#[async_trait]
impl PeerHost for TcpPeerHost {
    fn id(&self) -> &PeerId {
        &self.config.node_id
    }

    fn listen_addrs(&self) -> Vec<SocketAddr> {
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        vec![addr]
    }

    async fn connect(&self, peer: &PeerAddr) -> Result<(), HostError> {
        if peer.id == self.config.node_id {
            return Ok(());
        }
        self.registry.add_addrs(&peer.id, &peer.addrs);
        if self.registry.is_connected(&peer.id) {
            return Ok(());
        }
        info!("P2P: connecting to {}", peer);
        self.open(&peer.id, IDENTIFY_PROTOCOL_ID).await?;
        Ok(())
    }

    async fn new_stream(&self, peer: &PeerId, protocol: &str) -> Result<PeerStream, HostError> {
        self.open(peer, protocol).await
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.insert(protocol.to_string(), handler).is_some() {
            debug!("P2P: replaced stream handler for {}", protocol);
        }
    }

    fn remove_stream_handler(&self, protocol: &str) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(protocol);
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.registry.is_connected(peer)
    }

    fn peers(&self) -> Vec<PeerAddr> {
        self.registry
            .connected_peers()
            .iter()
            .map(|p| p.addr_info())
            .collect()
    }

    fn subscribe_connected(&self) -> broadcast::Receiver<PeerAddr> {
        self.connected_tx.subscribe()
    }
}
