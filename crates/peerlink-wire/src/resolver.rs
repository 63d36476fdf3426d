//! Client resolvers: turn a service name into a connection.
//!
//! [`StaticResolver`] looks the name up in a fixed address table.
//! [`PeerResolver`] asks a discovery backend for peers serving the name and
//! dials the first reachable one over the peer transport. [`ChainResolver`]
//! tries several resolvers in order.

use crate::cancel::CancelToken;
use crate::conn::Conn;
use crate::discovery::DiscoveryProvider;
use crate::error::{ResolveError, TransportError};
use crate::host::PeerHost;
use crate::p2p::P2pDialer;
use crate::transport::DialOptions;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long [`PeerResolver`] searches for a usable peer.
pub const DEFAULT_FIND_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-candidate connect timeout used by [`PeerResolver`].
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves a service name to an open connection.
#[async_trait]
pub trait ClientResolver: Send + Sync {
    async fn get(
        &self,
        cancel: &CancelToken,
        service: &str,
        options: &DialOptions,
    ) -> Result<Conn, ResolveError>;
}

// ---------------------------------------------------------------------------
// Static addresses
// ---------------------------------------------------------------------------

/// Resolver backed by a `service -> address` table.
///
/// `host:port` entries are dialed over TCP; entries starting with `/` or `.`
/// are Unix socket paths. There is no retry.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    addresses: BTreeMap<String, String>,
}

impl StaticResolver {
    pub fn new(addresses: BTreeMap<String, String>) -> Self {
        Self { addresses }
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    async fn connect(&self, service: &str, addr: &str) -> Result<Conn, ResolveError> {
        let refused = |e: io::Error| ResolveError::ConnectionRefused {
            target: addr.to_string(),
            reason: e.to_string(),
        };

        if addr.starts_with('/') || addr.starts_with('.') {
            #[cfg(unix)]
            return Conn::connect_unix(addr).await.map_err(refused);
            #[cfg(not(unix))]
            return Err(ResolveError::Unsupported {
                service: service.to_string(),
                addr: addr.to_string(),
            });
        }

        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Conn::connect_tcp(addr).await.map_err(refused)
            }
            _ => Err(ResolveError::Unsupported {
                service: service.to_string(),
                addr: addr.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ClientResolver for StaticResolver {
    async fn get(
        &self,
        cancel: &CancelToken,
        service: &str,
        options: &DialOptions,
    ) -> Result<Conn, ResolveError> {
        let addr = self
            .addresses
            .get(service)
            .ok_or_else(|| ResolveError::NotConfigured(service.to_string()))?;
        debug!(%service, %addr, "Resolving from static address");
        bounded(cancel, options.timeout, service, self.connect(service, addr)).await
    }
}

// ---------------------------------------------------------------------------
// Discovery-backed
// ---------------------------------------------------------------------------

/// Cancels the discovery query when the lookup ends, however it ends.
struct QueryGuard(CancelToken);

impl Drop for QueryGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Resolver that finds service providers through discovery and dials them
/// over the peer transport.
pub struct PeerResolver {
    host: Arc<dyn PeerHost>,
    discovery: Arc<dyn DiscoveryProvider>,
    local_services: HashSet<String>,
    dialer: P2pDialer,
    find_timeout: Duration,
    dial_timeout: Duration,
}

impl PeerResolver {
    pub fn new(
        host: Arc<dyn PeerHost>,
        discovery: Arc<dyn DiscoveryProvider>,
        local_services: impl IntoIterator<Item = String>,
    ) -> Self {
        let dialer = P2pDialer::new(Arc::clone(&host));
        Self {
            host,
            discovery,
            local_services: local_services.into_iter().collect(),
            dialer,
            find_timeout: DEFAULT_FIND_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, find_timeout: Duration, dial_timeout: Duration) -> Self {
        self.find_timeout = find_timeout;
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn with_dialer(mut self, dialer: P2pDialer) -> Self {
        self.dialer = dialer;
        self
    }

    async fn find_and_dial(
        &self,
        query: &CancelToken,
        service: &str,
        options: &DialOptions,
    ) -> Result<Conn, ResolveError> {
        let mut candidates = self.discovery.find_peers(service).await?;
        let dial_options = DialOptions::with_timeout(options.timeout.unwrap_or(self.dial_timeout));

        while let Some(peer) = candidates.next().await {
            if peer.id == *self.host.id() {
                continue;
            }
            match tokio::time::timeout(self.dial_timeout, self.host.connect(&peer)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(%service, %peer, error = %e, "Candidate unreachable");
                    continue;
                }
                Err(_) => {
                    debug!(%service, %peer, "Candidate connect timed out");
                    continue;
                }
            }
            match self.dialer.dial(query, &peer.id, &dial_options).await {
                Ok(conn) => {
                    info!(%service, peer = %peer.id, "Connected to peer for service");
                    return Ok(conn);
                }
                Err(TransportError::Cancelled) => return Err(ResolveError::Cancelled),
                Err(e) => debug!(%service, peer = %peer.id, error = %e, "Dial failed"),
            }
        }
        Err(ResolveError::NoPeer(service.to_string()))
    }
}

#[async_trait]
impl ClientResolver for PeerResolver {
    async fn get(
        &self,
        cancel: &CancelToken,
        service: &str,
        options: &DialOptions,
    ) -> Result<Conn, ResolveError> {
        if self.local_services.contains(service) {
            debug!(%service, "Service is served locally");
            return self
                .dialer
                .dial(cancel, self.host.id(), options)
                .await
                .map_err(|e| transport_to_resolve(service, e));
        }

        let guard = QueryGuard(cancel.child());
        bounded(
            cancel,
            Some(self.find_timeout),
            service,
            self.find_and_dial(&guard.0, service, options),
        )
        .await
    }
}

fn transport_to_resolve(service: &str, e: TransportError) -> ResolveError {
    match e {
        TransportError::Cancelled => ResolveError::Cancelled,
        TransportError::TimedOut(_) => ResolveError::TimedOut(service.to_string()),
        other => ResolveError::ConnectionRefused {
            target: service.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Race `fut` against cancellation and an optional timeout.
async fn bounded<F>(
    cancel: &CancelToken,
    timeout: Option<Duration>,
    service: &str,
    fut: F,
) -> Result<Conn, ResolveError>
where
    F: Future<Output = Result<Conn, ResolveError>>,
{
    let limited = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or_else(|_| Err(ResolveError::TimedOut(service.to_string()))),
            None => fut.await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ResolveError::Cancelled),
        res = limited => res,
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// Tries each resolver in order. Falls through on errors that another
/// resolver might fix and stops on cancellation or timeout.
#[derive(Clone, Default)]
pub struct ChainResolver {
    resolvers: Vec<Arc<dyn ClientResolver>>,
}

impl ChainResolver {
    pub fn new(resolvers: Vec<Arc<dyn ClientResolver>>) -> Self {
        Self { resolvers }
    }

    pub fn push(&mut self, resolver: Arc<dyn ClientResolver>) {
        self.resolvers.push(resolver);
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

#[async_trait]
impl ClientResolver for ChainResolver {
    async fn get(
        &self,
        cancel: &CancelToken,
        service: &str,
        options: &DialOptions,
    ) -> Result<Conn, ResolveError> {
        let mut last = None;
        for resolver in &self.resolvers {
            match resolver.get(cancel, service, options).await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_fallthrough() => {
                    debug!(%service, error = %e, "Resolver fell through");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| ResolveError::NotConfigured(service.to_string())))
    }
}
