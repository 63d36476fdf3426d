//! Rendezvous discovery: one peer keeps the registration table, everybody
//! else registers with it and queries it.
//!
//! A node whose rendezvous point is itself answers from its own table without
//! touching the network.

use crate::cancel::CancelToken;
use crate::discovery::{DiscoveryProvider, Registrations};
use crate::error::{DiscoveryError, ProtocolError};
use crate::framing::Json;
use crate::host::PeerHost;
use crate::protocols::{Protocol, ProtocolsService, Sender};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use peerlink_types::{PeerAddr, PeerId};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const RENDEZVOUS_PROTOCOL_ID: &str = "/peerlink/rendezvous/1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RendezvousRequest {
    Register {
        service: String,
        peer: PeerAddr,
        ttl_secs: u64,
    },
    Discover {
        service: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RendezvousResponse {
    Registered { ttl_secs: u64 },
    Peers { peers: Vec<PeerAddr> },
    Error { message: String },
}

/// Rendezvous client and server in one.
pub struct Rendezvous {
    host: Arc<dyn PeerHost>,
    table: Arc<Registrations>,
    /// `None` when this node is its own rendezvous point.
    point: Option<PeerId>,
    lifetime: CancelToken,
    sender: OnceLock<Sender<Rendezvous>>,
}

impl Rendezvous {
    pub fn new(
        host: Arc<dyn PeerHost>,
        table: Arc<Registrations>,
        point: Option<PeerId>,
        lifetime: CancelToken,
    ) -> Arc<Self> {
        let point = point.filter(|p| p != host.id());
        Arc::new(Self {
            host,
            table,
            point,
            lifetime,
            sender: OnceLock::new(),
        })
    }

    /// Build and register on `protocols`, so this node can also serve its
    /// table to others.
    pub fn start(
        protocols: &ProtocolsService,
        host: Arc<dyn PeerHost>,
        table: Arc<Registrations>,
        point: Option<PeerId>,
        lifetime: CancelToken,
    ) -> Arc<Self> {
        let rendezvous = Self::new(host, table, point, lifetime);
        protocols.register(Arc::clone(&rendezvous));
        match &rendezvous.point {
            Some(point) => info!(%point, "Rendezvous: using remote point"),
            None => info!("Rendezvous: serving locally"),
        }
        rendezvous
    }

    pub fn is_local(&self) -> bool {
        self.point.is_none()
    }

    pub fn table(&self) -> &Arc<Registrations> {
        &self.table
    }

    async fn request(&self, point: &PeerId, req: RendezvousRequest) -> Result<RendezvousResponse, DiscoveryError> {
        let sender = self.sender.get().ok_or_else(|| {
            DiscoveryError::Backend(format!("{RENDEZVOUS_PROTOCOL_ID} is not registered"))
        })?;
        match sender.send(&self.lifetime, point, &Json(req)).await {
            Ok(resp) => match resp.into_inner() {
                RendezvousResponse::Error { message } => Err(DiscoveryError::Backend(message)),
                other => Ok(other),
            },
            Err(ProtocolError::Host(e)) => Err(DiscoveryError::Host(e)),
            Err(ProtocolError::Cancelled) => Err(DiscoveryError::Cancelled),
            Err(e) => Err(DiscoveryError::Backend(e.to_string())),
        }
    }
}

fn unexpected(resp: RendezvousResponse) -> DiscoveryError {
    DiscoveryError::Backend(format!("unexpected rendezvous response: {resp:?}"))
}

#[async_trait]
impl DiscoveryProvider for Rendezvous {
    async fn advertise(&self, service: &str, ttl: Duration) -> Result<Duration, DiscoveryError> {
        let me = self.host.addr_info();
        let Some(point) = &self.point else {
            return Ok(self.table.register(service, me, ttl));
        };
        let req = RendezvousRequest::Register {
            service: service.to_string(),
            peer: me,
            ttl_secs: ttl.as_secs(),
        };
        match self.request(point, req).await? {
            RendezvousResponse::Registered { ttl_secs } => Ok(Duration::from_secs(ttl_secs)),
            other => Err(unexpected(other)),
        }
    }

    async fn find_peers(&self, service: &str) -> Result<BoxStream<'static, PeerAddr>, DiscoveryError> {
        let Some(point) = &self.point else {
            return Ok(stream::iter(self.table.discover(service)).boxed());
        };
        let req = RendezvousRequest::Discover {
            service: service.to_string(),
        };
        match self.request(point, req).await? {
            RendezvousResponse::Peers { peers } => Ok(stream::iter(peers).boxed()),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl Protocol for Rendezvous {
    type Request = Json<RendezvousRequest>;
    type Response = Json<RendezvousResponse>;

    fn id(&self) -> &str {
        RENDEZVOUS_PROTOCOL_ID
    }

    fn new_request() -> Self::Request {
        Json(RendezvousRequest::Discover {
            service: String::new(),
        })
    }

    fn new_response() -> Self::Response {
        Json(RendezvousResponse::Peers { peers: Vec::new() })
    }

    async fn handle_msg(&self, req: Self::Request, from: &PeerId) -> Result<Self::Response, ProtocolError> {
        let resp = match req.into_inner() {
            RendezvousRequest::Register { service, peer, ttl_secs } => {
                if peer.id != *from {
                    warn!(%from, claimed = %peer.id, "Rendezvous: refused registration for another peer");
                    RendezvousResponse::Error {
                        message: format!("{from} cannot register {}", peer.id),
                    }
                } else {
                    let granted = self.table.register(&service, peer, Duration::from_secs(ttl_secs));
                    debug!(%service, %from, ttl = ?granted, "Rendezvous: registered");
                    RendezvousResponse::Registered {
                        ttl_secs: granted.as_secs(),
                    }
                }
            }
            RendezvousRequest::Discover { service } => RendezvousResponse::Peers {
                peers: self.table.discover(&service),
            },
        };
        Ok(Json(resp))
    }

    fn set_sender(&self, sender: Sender<Self>) {
        let _ = self.sender.set(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DEFAULT_ADVERTISE_TTL, MAX_TTL};
    use crate::host::{TcpHostConfig, TcpPeerHost};

    async fn host(id: &str) -> Arc<TcpPeerHost> {
        TcpPeerHost::start(TcpHostConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            node_id: PeerId::new(id),
            shared_secret: String::new(),
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_request_wire_format() {
        let req = RendezvousRequest::Discover {
            service: "svc".into(),
        };
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"type":"discover","service":"svc"}"#
        );
    }

    #[tokio::test]
    async fn test_self_hosted_answers_locally() {
        let h = host("solo").await;
        let protocols = ProtocolsService::new(h.clone());
        let rv = Rendezvous::start(
            &protocols,
            h.clone(),
            Arc::new(Registrations::new()),
            Some(PeerId::new("solo")),
            CancelToken::new(),
        );
        assert!(rv.is_local());

        let granted = rv.advertise("svc", Duration::from_secs(30)).await.unwrap();
        assert_eq!(granted, Duration::from_secs(30));
        let peers: Vec<PeerAddr> = rv.find_peers("svc").await.unwrap().collect().await;
        assert_eq!(peers, vec![h.addr_info()]);
    }

    #[tokio::test]
    async fn test_remote_register_and_discover() {
        let server = host("point").await;
        let client = host("client").await;
        client.connect(&server.addr_info()).await.unwrap();

        let server_protocols = ProtocolsService::new(server.clone());
        let client_protocols = ProtocolsService::new(client.clone());
        let table = Arc::new(Registrations::new());
        let server_rv = Rendezvous::start(
            &server_protocols,
            server.clone(),
            Arc::clone(&table),
            None,
            CancelToken::new(),
        );
        let client_rv = Rendezvous::start(
            &client_protocols,
            client.clone(),
            Arc::new(Registrations::new()),
            Some(server.id().clone()),
            CancelToken::new(),
        );
        assert!(!client_rv.is_local());

        let granted = client_rv
            .advertise("svc", Duration::from_secs(3 * 60 * 60))
            .await
            .unwrap();
        assert_eq!(granted, MAX_TTL);
        assert_eq!(table.discover("svc"), vec![client.addr_info()]);

        let found: Vec<PeerAddr> = client_rv.find_peers("svc").await.unwrap().collect().await;
        assert_eq!(found, vec![client.addr_info()]);
        let found: Vec<PeerAddr> = server_rv.find_peers("svc").await.unwrap().collect().await;
        assert_eq!(found, vec![client.addr_info()]);
    }

    #[tokio::test]
    async fn test_registration_for_other_peer_refused() {
        let h = host("point").await;
        let rv = Rendezvous::new(h.clone(), Arc::new(Registrations::new()), None, CancelToken::new());
        let req = Json(RendezvousRequest::Register {
            service: "svc".into(),
            peer: PeerAddr::new(PeerId::new("victim"), Vec::new()),
            ttl_secs: DEFAULT_ADVERTISE_TTL.as_secs(),
        });
        let resp = rv.handle_msg(req, &PeerId::new("mallory")).await.unwrap();
        assert!(matches!(resp.into_inner(), RendezvousResponse::Error { .. }));
        assert!(rv.table().discover("svc").is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_point_is_host_error() {
        let client = host("client").await;
        let protocols = ProtocolsService::new(client.clone());
        let rv = Rendezvous::start(
            &protocols,
            client.clone(),
            Arc::new(Registrations::new()),
            Some(PeerId::new("nowhere")),
            CancelToken::new(),
        );
        let err = rv.advertise("svc", DEFAULT_ADVERTISE_TTL).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Host(_)), "got {err:?}");
    }
}
