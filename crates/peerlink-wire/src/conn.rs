//! Generic byte-stream connection.
//!
//! [`Conn`] is what every listener yields and every dialer returns, whether
//! the bytes travel over TCP, a Unix socket or a peer stream. RPC code layered
//! on top only sees `AsyncRead + AsyncWrite`, two addresses and deadlines.

use crate::host::PeerStream;
use peerlink_types::PeerId;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};

/// Transport-specific stream underneath a [`Conn`].
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Tear the stream down abruptly so the remote sees a reset rather than
    /// a clean end-of-stream. The default does nothing beyond the drop.
    fn abort(&mut self) {}
}

impl IoStream for TcpStream {
    #[allow(deprecated)]
    fn abort(&mut self) {
        // Zero linger turns the close into an RST.
        let _ = self.set_linger(Some(Duration::ZERO));
    }
}

#[cfg(unix)]
impl IoStream for tokio::net::UnixStream {}

impl IoStream for tokio::io::DuplexStream {}

/// Address of one end of a [`Conn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
    /// A peer, optionally with the socket address the stream runs over.
    Peer {
        peer: PeerId,
        addr: Option<SocketAddr>,
    },
}

impl std::fmt::Display for ConnAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnAddr::Tcp(addr) => write!(f, "tcp://{addr}"),
            ConnAddr::Unix(path) => write!(f, "unix://{}", path.display()),
            ConnAddr::Peer {
                peer,
                addr: Some(addr),
            } => write!(f, "peer://{peer}@{addr}"),
            ConnAddr::Peer { peer, addr: None } => write!(f, "peer://{peer}"),
        }
    }
}

/// A connected byte stream with addresses and optional deadlines.
///
/// A deadline is an absolute instant; once it passes, pending and future
/// reads (or writes) fail with [`io::ErrorKind::TimedOut`] until the deadline
/// is moved or cleared.
pub struct Conn {
    io: Box<dyn IoStream>,
    local: ConnAddr,
    remote: ConnAddr,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl Conn {
    pub fn new(io: impl IoStream, local: ConnAddr, remote: ConnAddr) -> Self {
        Self {
            io: Box::new(io),
            local,
            remote,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Wrap an accepted or connected TCP stream.
    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        let local = ConnAddr::Tcp(stream.local_addr()?);
        let remote = ConnAddr::Tcp(stream.peer_addr()?);
        let _ = stream.set_nodelay(true);
        Ok(Self::new(stream, local, remote))
    }

    /// Wrap a Unix socket stream. Unnamed ends report an empty path.
    #[cfg(unix)]
    pub fn unix(stream: tokio::net::UnixStream) -> Self {
        let path_of = |addr: io::Result<tokio::net::unix::SocketAddr>| {
            addr.ok()
                .and_then(|a| a.as_pathname().map(PathBuf::from))
                .unwrap_or_default()
        };
        let local = ConnAddr::Unix(path_of(stream.local_addr()));
        let remote = ConnAddr::Unix(path_of(stream.peer_addr()));
        Self::new(stream, local, remote)
    }

    /// Open a TCP connection to `addr` (`host:port`).
    pub async fn connect_tcp(addr: &str) -> io::Result<Self> {
        Self::tcp(TcpStream::connect(addr).await?)
    }

    /// Open a Unix socket connection to `path`.
    #[cfg(unix)]
    pub async fn connect_unix(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let stream = tokio::net::UnixStream::connect(path).await?;
        let mut conn = Self::unix(stream);
        conn.remote = ConnAddr::Unix(path.to_path_buf());
        Ok(conn)
    }

    /// Override the reported local address.
    pub fn with_local_addr(mut self, local: ConnAddr) -> Self {
        self.local = local;
        self
    }

    pub fn local_addr(&self) -> &ConnAddr {
        &self.local
    }

    pub fn remote_addr(&self) -> &ConnAddr {
        &self.remote
    }

    /// Set both read and write deadlines. `None` clears them.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    /// Drop the connection abruptly (TCP reset where supported).
    pub fn abort(mut self) {
        self.io.abort();
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

fn deadline_passed(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match deadline {
        Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
        None => false,
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if deadline_passed(&mut this.read_deadline, cx) {
            return Poll::Ready(Err(timed_out()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if deadline_passed(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out()));
        }
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if deadline_passed(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out()));
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl From<PeerStream> for Conn {
    fn from(stream: PeerStream) -> Self {
        let local = ConnAddr::Peer {
            peer: stream.local_peer().clone(),
            addr: stream.local_socket(),
        };
        let remote = ConnAddr::Peer {
            peer: stream.remote_peer().clone(),
            addr: stream.remote_socket(),
        };
        Conn {
            io: stream.into_io(),
            local,
            remote,
            read_deadline: None,
            write_deadline: None,
        }
    }
}
