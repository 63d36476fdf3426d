//! Peer transport: peer streams presented as a listener and a dialer, so an
//! RPC server or client built for sockets runs unchanged over the peer host.

use crate::cancel::CancelToken;
use crate::conn::{Conn, ConnAddr};
use crate::error::TransportError;
use crate::host::{stream_handler, PeerHost, PeerStream};
use crate::transport::{DialOptions, Listener, TaggedListener};
use async_trait::async_trait;
use peerlink_types::PeerId;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Protocol identifier RPC traffic is carried under.
pub const RPC_PROTOCOL_ID: &str = "/peerlink/rpc/1.0.0";

/// Inbound streams buffered between the host and `accept`.
const STREAM_QUEUE: usize = 16;

/// Listener whose `accept` yields each inbound stream opened under one
/// protocol.
pub struct P2pListener {
    host: Arc<dyn PeerHost>,
    protocol: String,
    streams: Mutex<mpsc::Receiver<PeerStream>>,
    closed: CancelToken,
}

impl P2pListener {
    /// Register a stream handler for `protocol` that feeds this listener.
    pub fn listen(host: Arc<dyn PeerHost>, protocol: &str) -> Self {
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        let closed = CancelToken::new();
        let handler_closed = closed.clone();
        host.set_stream_handler(
            protocol,
            stream_handler(move |stream: PeerStream| {
                let tx = tx.clone();
                let closed = handler_closed.clone();
                async move {
                    let queued = tokio::select! {
                        biased;
                        _ = closed.cancelled() => Err(None),
                        sent = tx.send(stream) => sent.map_err(|e| Some(e.0)),
                    };
                    if let Err(stream) = queued {
                        debug!("P2P listener closed, resetting inbound stream");
                        if let Some(stream) = stream {
                            stream.reset();
                        }
                    }
                }
            }),
        );
        debug!(protocol, "P2P listener registered");
        Self {
            host,
            protocol: protocol.to_string(),
            streams: Mutex::new(rx),
            closed,
        }
    }

    /// A mux entry tagged `P2P` that listens under [`RPC_PROTOCOL_ID`].
    pub fn tagged(host: Arc<dyn PeerHost>) -> TaggedListener {
        TaggedListener::new("P2P", move || async move {
            Ok(Arc::new(P2pListener::listen(host, RPC_PROTOCOL_ID)) as Arc<dyn Listener>)
        })
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }
}

#[async_trait]
impl Listener for P2pListener {
    async fn accept(&self) -> Result<Conn, TransportError> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            stream = async { self.streams.lock().await.recv().await } => {
                stream.map(Conn::from).ok_or(TransportError::Closed)
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        self.host.remove_stream_handler(&self.protocol);
        let mut streams = self.streams.lock().await;
        streams.close();
        while let Ok(stream) = streams.try_recv() {
            stream.reset();
        }
        debug!(protocol = %self.protocol, "P2P listener closed");
        Ok(())
    }

    fn local_addr(&self) -> ConnAddr {
        ConnAddr::Peer {
            peer: self.host.id().clone(),
            addr: self.host.listen_addrs().first().copied(),
        }
    }
}

/// Opens peer streams and wraps them as connections.
#[derive(Clone)]
pub struct P2pDialer {
    host: Arc<dyn PeerHost>,
    protocol: String,
}

impl P2pDialer {
    /// Dialer for [`RPC_PROTOCOL_ID`].
    pub fn new(host: Arc<dyn PeerHost>) -> Self {
        Self::with_protocol(host, RPC_PROTOCOL_ID)
    }

    pub fn with_protocol(host: Arc<dyn PeerHost>, protocol: &str) -> Self {
        Self {
            host,
            protocol: protocol.to_string(),
        }
    }

    /// Open a stream to `peer`. An unroutable or unreachable peer is a
    /// connection error (see [`TransportError::is_connection_error`]).
    pub async fn dial(
        &self,
        cancel: &CancelToken,
        peer: &PeerId,
        options: &DialOptions,
    ) -> Result<Conn, TransportError> {
        let open = self.host.new_stream(peer, &self.protocol);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            opened = async {
                match options.timeout {
                    Some(limit) => tokio::time::timeout(limit, open)
                        .await
                        .map_err(|_| TransportError::TimedOut(format!("dialing {peer}")))?
                        .map_err(TransportError::from),
                    None => open.await.map_err(TransportError::from),
                }
            } => opened,
        };
        Ok(Conn::from(opened?))
    }
}
