//! Listener abstraction and the socket listeners fed into the mux.

use crate::cancel::CancelToken;
use crate::conn::{Conn, ConnAddr};
use crate::error::TransportError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// A source of inbound connections.
///
/// `accept` takes `&self` so that `close` can run concurrently with a
/// pending accept; closing must unblock it with [`TransportError::Closed`].
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<Conn, TransportError>;

    /// Stop accepting. Calling it more than once is harmless.
    async fn close(&self) -> Result<(), TransportError>;

    fn local_addr(&self) -> ConnAddr;
}

/// Options for an outbound connection attempt.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Upper bound on the attempt; `None` leaves it to the resolver default.
    pub timeout: Option<Duration>,
}

impl DialOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

type StartFn =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<Arc<dyn Listener>, TransportError>> + Send>;

/// A listener that has not been started yet, with the tag it reports under.
pub struct TaggedListener {
    tag: String,
    start: StartFn,
}

impl TaggedListener {
    pub fn new<F, Fut>(tag: impl Into<String>, start: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Arc<dyn Listener>, TransportError>> + Send + 'static,
    {
        Self {
            tag: tag.into(),
            start: Box::new(move || Box::pin(start())),
        }
    }

    /// Wrap a listener that is already bound.
    pub fn ready(tag: impl Into<String>, listener: Arc<dyn Listener>) -> Self {
        Self::new(tag, move || async move { Ok(listener) })
    }

    /// Bind a TCP listener on start, tagged `TCP <addr>`.
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new(format!("TCP {addr}"), move || async move {
            let listener = TcpTransportListener::bind(addr).await?;
            Ok(Arc::new(listener) as Arc<dyn Listener>)
        })
    }

    /// Bind a Unix socket listener on start, tagged `Unix <path>`.
    #[cfg(unix)]
    pub fn unix(path: std::path::PathBuf) -> Self {
        Self::new(format!("Unix {}", path.display()), move || async move {
            let listener = UnixTransportListener::bind(path)?;
            Ok(Arc::new(listener) as Arc<dyn Listener>)
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub(crate) async fn start(self) -> Result<Arc<dyn Listener>, TransportError> {
        (self.start)().await
    }
}

impl std::fmt::Debug for TaggedListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedListener")
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// TCP socket listener.
pub struct TcpTransportListener {
    socket: Mutex<Option<Arc<tokio::net::TcpListener>>>,
    closed: CancelToken,
    addr: SocketAddr,
}

impl TcpTransportListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = tokio::net::TcpListener::bind(addr).await?;
        let addr = socket.local_addr()?;
        debug!(%addr, "TCP listener bound");
        Ok(Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            closed: CancelToken::new(),
            addr,
        })
    }

    /// Actual bound address (useful when binding to port 0).
    pub fn bound_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Listener for TcpTransportListener {
    async fn accept(&self) -> Result<Conn, TransportError> {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(TransportError::Closed)?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            accepted = socket.accept() => {
                let (stream, _) = accepted?;
                Ok(Conn::tcp(stream)?)
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        let socket = self.socket.lock().unwrap_or_else(|e| e.into_inner()).take();
        if socket.is_some() {
            debug!(addr = %self.addr, "TCP listener closed");
        }
        Ok(())
    }

    fn local_addr(&self) -> ConnAddr {
        ConnAddr::Tcp(self.addr)
    }
}

// ---------------------------------------------------------------------------
// Unix
// ---------------------------------------------------------------------------

/// Unix domain socket listener. The socket file is removed on close.
#[cfg(unix)]
pub struct UnixTransportListener {
    socket: Mutex<Option<Arc<tokio::net::UnixListener>>>,
    closed: CancelToken,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl UnixTransportListener {
    pub fn bind(path: std::path::PathBuf) -> Result<Self, TransportError> {
        let socket = tokio::net::UnixListener::bind(&path)?;
        debug!(path = %path.display(), "Unix listener bound");
        Ok(Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            closed: CancelToken::new(),
            path,
        })
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for UnixTransportListener {
    async fn accept(&self) -> Result<Conn, TransportError> {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(TransportError::Closed)?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            accepted = socket.accept() => {
                let (stream, _) = accepted?;
                Ok(Conn::unix(stream).with_local_addr(ConnAddr::Unix(self.path.clone())))
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        let socket = self.socket.lock().unwrap_or_else(|e| e.into_inner()).take();
        if socket.is_some() {
            let _ = std::fs::remove_file(&self.path);
            debug!(path = %self.path.display(), "Unix listener closed");
        }
        Ok(())
    }

    fn local_addr(&self) -> ConnAddr {
        ConnAddr::Unix(self.path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_accept_and_close() {
        let listener = Arc::new(
            TcpTransportListener::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let addr = listener.bound_addr();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        let pending = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("close must unblock accept")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));

        // Second close is a no-op, later accepts see end-of-stream.
        listener.close().await.unwrap();
        assert!(matches!(listener.accept().await, Err(TransportError::Closed)));
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_accept_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpc.sock");
        let listener = UnixTransportListener::bind(path.clone()).unwrap();

        let client = Conn::connect_unix(&path).await.unwrap();
        let server = listener.accept().await.unwrap();
        assert_eq!(client.remote_addr(), &ConnAddr::Unix(path.clone()));
        assert_eq!(server.local_addr(), &ConnAddr::Unix(path.clone()));

        listener.close().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_tagged_tcp_start() {
        let tagged = TaggedListener::tcp("127.0.0.1:0".parse().unwrap());
        assert_eq!(tagged.tag(), "TCP 127.0.0.1:0");
        let listener = tagged.start().await.unwrap();
        assert!(matches!(listener.local_addr(), ConnAddr::Tcp(a) if a.port() != 0));
        listener.close().await.unwrap();
    }
}
