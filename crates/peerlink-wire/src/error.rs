//! Error types for the transport and discovery layer.
//!
//! Each layer has its own enum so callers can tell apart "not configured",
//! "no peer found", "connection refused", "timed out" and "cancelled" without
//! string matching.

use peerlink_types::PeerId;
use std::time::Duration;
use thiserror::Error;

/// Errors from the peer host (stream setup, handshake, routing).
#[derive(Debug, Error)]
pub enum HostError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
    #[error("No route to peer {0}")]
    NoRoute(PeerId),
    #[error("Peer {peer} unreachable: {reason}")]
    Unreachable { peer: PeerId, reason: String },
    #[error("Protocol not supported by remote: {0}")]
    ProtocolNotSupported(String),
    #[error("Header too large: {size} bytes (max {max})")]
    HeaderTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Host is shut down")]
    Shutdown,
}

impl HostError {
    /// Whether the failure happened while reaching the peer, as opposed to
    /// the peer rejecting the exchange.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            HostError::Io(_)
                | HostError::NoRoute(_)
                | HostError::Unreachable { .. }
                | HostError::ConnectionClosed
                | HostError::Shutdown
        )
    }
}

/// Errors from listeners, the mux and the peer transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// End of stream: the listener (or mux) has been closed.
    #[error("Listener closed")]
    Closed,
    #[error("Mux not started")]
    NotStarted,
    #[error("Mux already started")]
    AlreadyStarted,
    #[error("Duplicate listener tag: {0}")]
    DuplicateTag(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    #[error("Timed out: {0}")]
    TimedOut(String),
    #[error("Peer host error: {0}")]
    Host(#[from] HostError),
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Listeners did not stop within {0:?}")]
    StopTimeout(Duration),
    #[error("Multiple errors: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<TransportError>),
}

impl TransportError {
    /// Whether the peer or address could not be reached at all.
    pub fn is_connection_error(&self) -> bool {
        match self {
            TransportError::Io(_) | TransportError::ConnectionRefused(_) => true,
            TransportError::Host(e) => e.is_connection_error(),
            _ => false,
        }
    }

    /// Fold a list of errors into a single result.
    pub fn aggregate(mut errors: Vec<TransportError>) -> Result<(), TransportError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(TransportError::Multiple(errors)),
        }
    }
}

/// Errors from the length-prefixed message framing.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The stream ended before a length prefix was read.
    #[error("Connection closed")]
    ConnectionClosed,
    /// The stream ended before the declared payload length was satisfied.
    #[error("Truncated frame: expected {expected} payload bytes")]
    Truncated { expected: usize },
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Marshal failed: {0}")]
    Marshal(String),
    #[error("Unmarshal failed: {0}")]
    Unmarshal(String),
}

/// Errors from a discovery backend or the advertiser.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Discovery backend error: {0}")]
    Backend(String),
    #[error("Discovery cancelled")]
    Cancelled,
    #[error("Peer host error: {0}")]
    Host(#[from] HostError),
}

/// Errors returned by a client resolver.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No static address exists for the service.
    #[error("Service not configured: {0}")]
    NotConfigured(String),
    /// Discovery succeeded but no candidate could be reached.
    #[error("No usable peer for service {0}")]
    NoPeer(String),
    #[error("Connection to {target} refused: {reason}")]
    ConnectionRefused { target: String, reason: String },
    #[error("Timed out resolving {0}")]
    TimedOut(String),
    #[error("Resolve cancelled")]
    Cancelled,
    #[error("Unsupported address for {service}: {addr}")]
    Unsupported { service: String, addr: String },
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

impl ResolveError {
    /// Whether a caller may reasonably try another resolver.
    pub fn is_fallthrough(&self) -> bool {
        matches!(
            self,
            ResolveError::NotConfigured(_)
                | ResolveError::NoPeer(_)
                | ResolveError::ConnectionRefused { .. }
                | ResolveError::Unsupported { .. }
        )
    }
}

/// Errors from a framed request/response exchange.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Peer host error: {0}")]
    Host(#[from] HostError),
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("Exchange timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Handler failed: {0}")]
    Handler(String),
    #[error("Protocol not registered: {0}")]
    NotRegistered(String),
    #[error("Exchange cancelled")]
    Cancelled,
}

impl ProtocolError {
    /// Build a handler error from anything displayable.
    pub fn handler(e: impl std::fmt::Display) -> Self {
        ProtocolError::Handler(e.to_string())
    }
}

/// Errors from the task scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler is stopped")]
    Stopped,
}
