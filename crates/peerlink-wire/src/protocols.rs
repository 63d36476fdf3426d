//! Request/response protocols over peer streams.
//!
//! A [`Protocol`] defines its message types and a handler. Registering it on
//! a [`ProtocolsService`] installs a stream handler on the host (one framed
//! request in, one framed response out per stream) and hands the protocol a
//! [`Sender`] so it can start exchanges of its own.

use crate::cancel::CancelToken;
use crate::conn::Conn;
use crate::error::ProtocolError;
use crate::framing::{read_msg, write_msg, Message};
use crate::host::{stream_handler, PeerHost, PeerStream};
use async_trait::async_trait;
use peerlink_types::PeerId;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, error};

/// Round-trip deadline applied to every exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// A peer-to-peer request/response protocol.
#[async_trait]
pub trait Protocol: Send + Sync + Sized + 'static {
    type Request: Message + Sync;
    type Response: Message + Sync;

    /// Path-like identifier, e.g. `/peerlink/mesher/1.0.0`.
    fn id(&self) -> &str;

    /// Empty request to read an inbound message into.
    fn new_request() -> Self::Request;

    /// Empty response to read a reply into.
    fn new_response() -> Self::Response;

    async fn handle_msg(
        &self,
        req: Self::Request,
        from: &PeerId,
    ) -> Result<Self::Response, ProtocolError>;

    /// Called once at registration.
    fn set_sender(&self, sender: Sender<Self>);
}

/// Sends requests of protocol `P` to other peers.
pub struct Sender<P> {
    host: Arc<dyn PeerHost>,
    protocol_id: String,
    timeout: Duration,
    _protocol: PhantomData<fn() -> P>,
}

impl<P> Clone for Sender<P> {
    fn clone(&self) -> Self {
        Self {
            host: Arc::clone(&self.host),
            protocol_id: self.protocol_id.clone(),
            timeout: self.timeout,
            _protocol: PhantomData,
        }
    }
}

impl<P: Protocol> Sender<P> {
    pub fn new(host: Arc<dyn PeerHost>, protocol_id: &str, timeout: Duration) -> Self {
        Self {
            host,
            protocol_id: protocol_id.to_string(),
            timeout,
            _protocol: PhantomData,
        }
    }

    /// Open a stream to `peer`, write `req` and read one response.
    pub async fn send(
        &self,
        cancel: &CancelToken,
        peer: &PeerId,
        req: &P::Request,
    ) -> Result<P::Response, ProtocolError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
            res = tokio::time::timeout(self.timeout, self.exchange(peer, req)) => {
                res.unwrap_or(Err(ProtocolError::TimedOut(self.timeout)))
            }
        }
    }

    async fn exchange(&self, peer: &PeerId, req: &P::Request) -> Result<P::Response, ProtocolError> {
        let stream = self.host.new_stream(peer, &self.protocol_id).await?;
        let mut conn = Conn::from(stream);
        conn.set_deadline(Some(Instant::now() + self.timeout));

        let result = async {
            write_msg(&mut conn, req).await?;
            let mut resp = P::new_response();
            read_msg(&mut conn, &mut resp).await?;
            Ok::<_, ProtocolError>(resp)
        }
        .await;

        match result {
            Ok(resp) => {
                let _ = conn.shutdown().await;
                Ok(resp)
            }
            Err(e) => {
                error!(protocol = %self.protocol_id, %peer, error = %e, "failed exchanging message");
                conn.abort();
                Err(e)
            }
        }
    }

    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }
}

/// Registers protocols on a peer host.
pub struct ProtocolsService {
    host: Arc<dyn PeerHost>,
    timeout: Duration,
    registered: Mutex<Vec<String>>,
}

impl ProtocolsService {
    pub fn new(host: Arc<dyn PeerHost>) -> Self {
        Self::with_timeout(host, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(host: Arc<dyn PeerHost>, timeout: Duration) -> Self {
        Self {
            host,
            timeout,
            registered: Mutex::new(Vec::new()),
        }
    }

    /// Install `protocol`'s stream handler and give it a sender.
    pub fn register<P: Protocol>(&self, protocol: Arc<P>) {
        let id = protocol.id().to_string();
        let timeout = self.timeout;
        let handler_protocol = Arc::clone(&protocol);
        self.host.set_stream_handler(
            &id,
            stream_handler(move |stream: PeerStream| {
                let protocol = Arc::clone(&handler_protocol);
                async move { serve_stream(protocol, stream, timeout).await }
            }),
        );
        protocol.set_sender(Sender::new(Arc::clone(&self.host), &id, timeout));

        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        if !registered.contains(&id) {
            registered.push(id.clone());
        }
        debug!(protocol = %id, "Registered protocol");
    }

    pub fn unregister(&self, id: &str) {
        self.host.remove_stream_handler(id);
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|p| p != id);
    }

    /// Identifiers of registered protocols, in registration order.
    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Serve one inbound stream. Any failure resets the stream.
async fn serve_stream<P: Protocol>(protocol: Arc<P>, stream: PeerStream, timeout: Duration) {
    let from = stream.remote_peer().clone();
    let mut conn = Conn::from(stream);
    conn.set_deadline(Some(Instant::now() + timeout));

    let result = async {
        let mut req = P::new_request();
        read_msg(&mut conn, &mut req).await?;
        let resp = protocol.handle_msg(req, &from).await?;
        write_msg(&mut conn, &resp).await?;
        Ok::<_, ProtocolError>(())
    }
    .await;

    match result {
        Ok(()) => {
            let _ = conn.shutdown().await;
        }
        Err(e) => {
            error!(protocol = %protocol.id(), peer = %from, error = %e, "failed serving stream");
            conn.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::Json;
    use crate::host::{TcpHostConfig, TcpPeerHost};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Echo {
        #[serde(rename = "Msg")]
        msg: String,
    }

    #[derive(Default)]
    struct SlowProtocol {
        sender: OnceLock<Sender<SlowProtocol>>,
    }

    #[async_trait]
    impl Protocol for SlowProtocol {
        type Request = Json<Echo>;
        type Response = Json<Echo>;

        fn id(&self) -> &str {
            "/test/slow/1.0.0"
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
            _from: &PeerId,
        ) -> Result<Self::Response, ProtocolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(req)
        }

        fn set_sender(&self, sender: Sender<Self>) {
            let _ = self.sender.set(sender);
        }
    }

    #[derive(Default)]
    struct FailingProtocol {
        calls: AtomicUsize,
        sender: OnceLock<Sender<FailingProtocol>>,
    }

    #[async_trait]
    impl Protocol for FailingProtocol {
        type Request = Json<Echo>;
        type Response = Json<Echo>;

        fn id(&self) -> &str {
            "/test/failing/1.0.0"
        }

        fn new_request() -> Self::Request {
            Json::default()
        }

        fn new_response() -> Self::Response {
            Json::default()
        }

        async fn handle_msg(
            &self,
            _req: Self::Request,
            _from: &PeerId,
        ) -> Result<Self::Response, ProtocolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProtocolError::handler("refused"))
        }

        fn set_sender(&self, sender: Sender<Self>) {
            let _ = self.sender.set(sender);
        }
    }

    async fn host(id: &str) -> Arc<TcpPeerHost> {
        TcpPeerHost::start(TcpHostConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            node_id: PeerId::new(id),
            shared_secret: String::new(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_handler_error_resets_stream() {
        let a = host("a").await;
        let b = host("b").await;
        a.connect(&b.addr_info()).await.unwrap();

        let svc_a = ProtocolsService::new(a.clone());
        let svc_b = ProtocolsService::new(b.clone());
        let proto_a = Arc::new(FailingProtocol::default());
        let proto_b = Arc::new(FailingProtocol::default());
        svc_a.register(proto_a.clone());
        svc_b.register(proto_b.clone());
        assert_eq!(svc_a.registered(), vec!["/test/failing/1.0.0".to_string()]);

        let sender = proto_a.sender.get().unwrap();
        let err = sender
            .send(&CancelToken::new(), b.id(), &Json(Echo { msg: "x".into() }))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Framing(_)), "got {err:?}");
        assert_eq!(proto_b.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exchange_times_out() {
        let a = host("a").await;
        let b = host("b").await;
        a.connect(&b.addr_info()).await.unwrap();

        let svc_a = ProtocolsService::with_timeout(a.clone(), Duration::from_secs(1));
        let svc_b = ProtocolsService::with_timeout(b.clone(), Duration::from_secs(1));
        let proto_a = Arc::new(SlowProtocol::default());
        svc_a.register(proto_a.clone());
        svc_b.register(Arc::new(SlowProtocol::default()));

        let err = proto_a
            .sender
            .get()
            .unwrap()
            .send(&CancelToken::new(), b.id(), &Json(Echo { msg: "x".into() }))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ProtocolError::TimedOut(_) | ProtocolError::Framing(_)),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_cancelled_send() {
        let a = host("a").await;
        let svc = ProtocolsService::new(a.clone());
        let proto = Arc::new(SlowProtocol::default());
        svc.register(proto.clone());

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = proto
            .sender
            .get()
            .unwrap()
            .send(&cancel, a.id(), &Json(Echo::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Cancelled));
    }

    #[tokio::test]
    async fn test_unregister_removes_handler() {
        let a = host("a").await;
        let svc = ProtocolsService::new(a.clone());
        let proto = Arc::new(FailingProtocol::default());
        svc.register(proto.clone());
        svc.unregister("/test/failing/1.0.0");
        assert!(svc.registered().is_empty());

        let err = proto
            .sender
            .get()
            .unwrap()
            .send(&CancelToken::new(), a.id(), &Json(Echo::default()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Host(crate::error::HostError::ProtocolNotSupported(_))
        ));
        assert_eq!(proto.calls.load(Ordering::SeqCst), 0);
    }
}
