//! Mesher: every time a peer connects, tell it about the other peers this
//! node is connected to, so the network converges towards a full mesh.

use crate::cancel::CancelToken;
use crate::error::{ProtocolError, SchedulerError};
use crate::framing::Json;
use crate::host::PeerHost;
use crate::protocols::{Protocol, ProtocolsService, Sender};
use crate::scheduler::{Task, TaskScheduler};
use async_trait::async_trait;
use peerlink_types::{PeerAddr, PeerId};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const MESHER_PROTOCOL_ID: &str = "/peerlink/mesher/1.0.0";

/// JSON list of peers, used as both request and response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerList(pub Vec<PeerAddr>);

pub struct Mesher {
    host: Arc<dyn PeerHost>,
    sender: OnceLock<Sender<Mesher>>,
}

impl Mesher {
    pub fn new(host: Arc<dyn PeerHost>) -> Arc<Self> {
        Arc::new(Self {
            host,
            sender: OnceLock::new(),
        })
    }

    /// Register the protocol and launch the broadcaster.
    pub fn start(
        protocols: &ProtocolsService,
        host: Arc<dyn PeerHost>,
        scheduler: &dyn TaskScheduler,
    ) -> Result<Arc<Self>, SchedulerError> {
        let mesher = Self::new(host);
        protocols.register(Arc::clone(&mesher));

        // Subscribe before the task runs so no connection is missed.
        let events = mesher.host.subscribe_connected();
        let name = format!("Mesher broadcaster {}", mesher.host.id());
        let worker = Arc::clone(&mesher);
        scheduler.go(
            &name,
            Task::new(move |cancel| async move { worker.broadcaster(cancel, events).await }),
        )?;
        Ok(mesher)
    }

    /// Connected peers other than `peer` and this node that have addresses.
    fn peers_for(&self, peer: &PeerId) -> PeerList {
        PeerList(
            self.host
                .peers()
                .into_iter()
                .filter(|p| p.id != *peer && p.id != *self.host.id() && !p.addrs.is_empty())
                .collect(),
        )
    }

    /// Connect to every listed peer not yet connected. Returns the peers
    /// that are connected afterwards.
    async fn check_and_add(&self, peers: Vec<PeerAddr>) -> PeerList {
        let mut reached = Vec::with_capacity(peers.len());
        for peer in peers {
            if peer.id == *self.host.id() {
                continue;
            }
            if self.host.is_connected(&peer.id) {
                debug!(%peer, "Mesher: already connected");
                reached.push(peer);
                continue;
            }
            match self.host.connect(&peer).await {
                Ok(()) => {
                    debug!(%peer, "Mesher: connected");
                    reached.push(peer);
                }
                Err(e) => warn!(%peer, error = %e, "Mesher: could not connect to peer"),
            }
        }
        PeerList(reached)
    }

    /// Send `peer` the list of other connected peers.
    pub async fn broadcast_peers(&self, cancel: &CancelToken, peer: &PeerId) -> Result<(), ProtocolError> {
        let list = self.peers_for(peer);
        if list.0.is_empty() {
            warn!(%peer, "Mesher: no peers to broadcast");
            return Ok(());
        }
        let sender = self
            .sender
            .get()
            .ok_or_else(|| ProtocolError::NotRegistered(MESHER_PROTOCOL_ID.to_string()))?;
        let reached = sender.send(cancel, peer, &Json(list)).await?;
        debug!(%peer, reached = reached.0 .0.len(), "Mesher: broadcast delivered");
        Ok(())
    }

    async fn broadcaster(
        &self,
        cancel: CancelToken,
        mut events: broadcast::Receiver<PeerAddr>,
    ) -> Result<(), ProtocolError> {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                event = events.recv() => event,
            };
            match event {
                Ok(peer) => {
                    if let Err(e) = self.broadcast_peers(&cancel, &peer.id).await {
                        warn!(peer = %peer.id, error = %e, "Mesher: failed broadcasting peers");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Mesher: connection events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl Protocol for Mesher {
    type Request = Json<PeerList>;
    type Response = Json<PeerList>;

    fn id(&self) -> &str {
        MESHER_PROTOCOL_ID
    }

    fn new_request() -> Self::Request {
        Json::default()
    }

    fn new_response() -> Self::Response {
        Json::default()
    }

    async fn handle_msg(&self, req: Self::Request, from: &PeerId) -> Result<Self::Response, ProtocolError> {
        debug!(%from, count = req.0 .0.len(), "Mesher: received peer list");
        Ok(Json(self.check_and_add(req.into_inner().0).await))
    }

    fn set_sender(&self, sender: Sender<Self>) {
        if self.sender.set(sender).is_err() {
            debug!("Mesher: sender already set");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{TcpHostConfig, TcpPeerHost};
    use crate::scheduler::TokioScheduler;
    use std::time::Duration;

    async fn host(id: &str) -> Arc<TcpPeerHost> {
        TcpPeerHost::start(TcpHostConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            node_id: PeerId::new(id),
            shared_secret: "mesh".to_string(),
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_peer_list_is_bare_json_array() {
        let list = PeerList(vec![PeerAddr::new(
            PeerId::new("p"),
            vec!["127.0.0.1:1".parse().unwrap()],
        )]);
        let json = serde_json::to_string(&list).unwrap();
        assert_eq!(json, r#"[{"id":"p","addrs":["127.0.0.1:1"]}]"#);
    }

    #[tokio::test]
    async fn test_handle_msg_reports_reached_peers() {
        let a = host("a").await;
        let b = host("b").await;
        let mesher = Mesher::new(a.clone());

        let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let req = Json(PeerList(vec![
            b.addr_info(),
            PeerAddr::new(PeerId::new("ghost"), vec![dead_addr]),
            a.addr_info(),
        ]));
        let resp = mesher.handle_msg(req, &PeerId::new("x")).await.unwrap();
        assert_eq!(resp.0 .0, vec![b.addr_info()]);
        assert!(a.is_connected(b.id()));
    }

    #[tokio::test]
    async fn test_new_peer_learns_existing_peers() {
        let hub = host("hub").await;
        let old = host("old").await;
        let new = host("new").await;

        let scheduler = TokioScheduler::new(0);
        let mut services = Vec::new();
        for h in [&hub, &old, &new] {
            let svc = ProtocolsService::new(h.clone());
            Mesher::start(&svc, h.clone(), &scheduler).unwrap();
            services.push(svc);
        }

        old.connect(&hub.addr_info()).await.unwrap();
        new.connect(&hub.addr_info()).await.unwrap();

        let meshed = async {
            while !new.is_connected(old.id()) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), meshed)
            .await
            .expect("new peer should be told about old peer");

        scheduler.shutdown(Duration::from_secs(1)).await;
    }
}
