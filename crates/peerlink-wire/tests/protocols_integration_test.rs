//! Integration tests for framed protocols between two real peer hosts.

use async_trait::async_trait;
use peerlink_types::PeerId;
use peerlink_wire::{
    CancelToken, Json, PeerHost, Protocol, ProtocolError, ProtocolsService, Sender,
    TcpHostConfig, TcpPeerHost,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct EchoMsg {
    #[serde(rename = "Msg")]
    msg: String,
}

/// Echoes every request and records who sent it.
#[derive(Default)]
struct EchoProtocol {
    calls: AtomicUsize,
    senders: Mutex<Vec<PeerId>>,
    sender: OnceLock<Sender<EchoProtocol>>,
}

#[async_trait]
impl Protocol for EchoProtocol {
    type Request = Json<EchoMsg>;
    type Response = Json<EchoMsg>;

    fn id(&self) -> &str {
        "/peerlink/echo/1.0.0"
    }

    fn new_request() -> Self::Request {
        Json::default()
    }

    fn new_response() -> Self::Response {
        Json::default()
    }

    async fn handle_msg(
        &self,
        req: Self::Request,
        from: &PeerId,
    ) -> Result<Self::Response, ProtocolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.senders.lock().unwrap().push(from.clone());
        Ok(req)
    }

    fn set_sender(&self, sender: Sender<Self>) {
        let _ = self.sender.set(sender);
    }
}

async fn start_host(id: &str) -> Arc<TcpPeerHost> {
    TcpPeerHost::start(TcpHostConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        node_id: PeerId::new(id),
        shared_secret: "integration".to_string(),
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_two_hosts_echo_exchange() {
    let alice = start_host("alice").await;
    let bob = start_host("bob").await;
    alice.connect(&bob.addr_info()).await.unwrap();

    let alice_protocols = ProtocolsService::new(alice.clone());
    let bob_protocols = ProtocolsService::new(bob.clone());
    let alice_echo = Arc::new(EchoProtocol::default());
    let bob_echo = Arc::new(EchoProtocol::default());
    alice_protocols.register(Arc::clone(&alice_echo));
    bob_protocols.register(Arc::clone(&bob_echo));

    let resp = alice_echo
        .sender
        .get()
        .unwrap()
        .send(
            &CancelToken::new(),
            bob.id(),
            &Json(EchoMsg {
                msg: "hello".to_string(),
            }),
        )
        .await
        .unwrap();

    assert_eq!(resp.msg, "hello");
    assert_eq!(bob_echo.calls.load(Ordering::SeqCst), 1);
    assert_eq!(alice_echo.calls.load(Ordering::SeqCst), 0);
    assert_eq!(*bob_echo.senders.lock().unwrap(), vec![PeerId::new("alice")]);

    // The reverse direction works over the same registration.
    let resp = bob_echo
        .sender
        .get()
        .unwrap()
        .send(
            &CancelToken::new(),
            alice.id(),
            &Json(EchoMsg {
                msg: "back".to_string(),
            }),
        )
        .await
        .unwrap();
    assert_eq!(resp.msg, "back");
    assert_eq!(alice_echo.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unregistered_remote_is_rejected() {
    let alice = start_host("alice").await;
    let bob = start_host("bob").await;
    alice.connect(&bob.addr_info()).await.unwrap();

    let alice_protocols = ProtocolsService::new(alice.clone());
    let alice_echo = Arc::new(EchoProtocol::default());
    alice_protocols.register(Arc::clone(&alice_echo));

    let err = alice_echo
        .sender
        .get()
        .unwrap()
        .send(&CancelToken::new(), bob.id(), &Json(EchoMsg::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Host(_)), "got {err:?}");
}
