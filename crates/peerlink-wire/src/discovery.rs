//! Service discovery: the backend trait, an in-process registration table
//! and the advertiser loop that keeps this node's services announced.

use crate::cancel::CancelToken;
use crate::error::DiscoveryError;
use crate::scheduler::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use peerlink_types::{PeerAddr, PeerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// TTL requested for every advertisement.
pub const DEFAULT_ADVERTISE_TTL: Duration = Duration::from_secs(15 * 60);

/// Wait before retrying a failed advertisement batch.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2 * 60);

/// Longest TTL a registration table grants.
pub const MAX_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// A service discovery backend.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Announce that this node serves `service`. Returns the TTL the backend
    /// actually granted.
    async fn advertise(&self, service: &str, ttl: Duration) -> Result<Duration, DiscoveryError>;

    /// Peers currently serving `service`. The stream is lazy; dropping it
    /// releases the query.
    async fn find_peers(&self, service: &str) -> Result<BoxStream<'static, PeerAddr>, DiscoveryError>;
}

// ---------------------------------------------------------------------------
// Registration table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Registration {
    peer: PeerAddr,
    expires: Instant,
}

/// Service registrations with expiry, shared by the in-memory backend and
/// the rendezvous server.
#[derive(Debug, Default)]
pub struct Registrations {
    services: RwLock<HashMap<String, Vec<Registration>>>,
}

impl Registrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `peer` as serving `service`. A zero TTL or one above
    /// [`MAX_TTL`] is clamped to [`MAX_TTL`]. Re-registering refreshes the
    /// entry in place.
    pub fn register(&self, service: &str, peer: PeerAddr, ttl: Duration) -> Duration {
        let ttl = if ttl.is_zero() { MAX_TTL } else { ttl.min(MAX_TTL) };
        let expires = Instant::now() + ttl;
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        let entries = services.entry(service.to_string()).or_default();
        match entries.iter_mut().find(|r| r.peer.id == peer.id) {
            Some(existing) => {
                existing.peer = peer;
                existing.expires = expires;
            }
            None => entries.push(Registration { peer, expires }),
        }
        ttl
    }

    pub fn unregister(&self, service: &str, peer: &PeerId) {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = services.get_mut(service) {
            entries.retain(|r| r.peer.id != *peer);
            if entries.is_empty() {
                services.remove(service);
            }
        }
    }

    /// Live registrations for `service` in registration order. Expired
    /// entries are pruned on the way.
    pub fn discover(&self, service: &str) -> Vec<PeerAddr> {
        let now = Instant::now();
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = services.get_mut(service) else {
            return Vec::new();
        };
        entries.retain(|r| r.expires > now);
        let live: Vec<PeerAddr> = entries.iter().map(|r| r.peer.clone()).collect();
        if entries.is_empty() {
            services.remove(service);
        }
        live
    }

    /// Number of services with at least one registration (expired or not).
    pub fn service_count(&self) -> usize {
        self.services.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// In-process [`DiscoveryProvider`]. Nodes that share one table see each
/// other's advertisements.
#[derive(Clone)]
pub struct MemoryDiscovery {
    table: Arc<Registrations>,
    local: PeerAddr,
}

impl MemoryDiscovery {
    pub fn new(table: Arc<Registrations>, local: PeerAddr) -> Self {
        Self { table, local }
    }

    pub fn table(&self) -> &Arc<Registrations> {
        &self.table
    }
}

#[async_trait]
impl DiscoveryProvider for MemoryDiscovery {
    async fn advertise(&self, service: &str, ttl: Duration) -> Result<Duration, DiscoveryError> {
        Ok(self.table.register(service, self.local.clone(), ttl))
    }

    async fn find_peers(&self, service: &str) -> Result<BoxStream<'static, PeerAddr>, DiscoveryError> {
        Ok(stream::iter(self.table.discover(service)).boxed())
    }
}

// ---------------------------------------------------------------------------
// Advertiser
// ---------------------------------------------------------------------------

/// Snapshot of the advertiser's progress.
#[derive(Debug, Clone, Default)]
pub struct AdvertiserStatus {
    pub services: Vec<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub rounds: u64,
}

impl std::fmt::Display for AdvertiserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.last_error, &self.last_success) {
            (Some(err), _) => write!(f, "retrying: {err}"),
            (None, Some(at)) => write!(
                f,
                "advertising {} service(s), last renewed {}",
                self.services.len(),
                at.to_rfc3339()
            ),
            (None, None) => f.write_str("not started"),
        }
    }
}

/// Keeps every configured service advertised on a discovery backend.
///
/// Each round advertises all services in order. A clean round sleeps 7/8 of
/// the first service's granted TTL; any failure abandons the round, waits
/// the backoff and starts over.
pub struct Advertiser {
    backend: Arc<dyn DiscoveryProvider>,
    services: RwLock<Vec<String>>,
    ttl: Duration,
    backoff: Duration,
    status: Mutex<AdvertiserStatus>,
}

impl Advertiser {
    pub fn new(backend: Arc<dyn DiscoveryProvider>, services: Vec<String>) -> Self {
        Self {
            backend,
            services: RwLock::new(services),
            ttl: DEFAULT_ADVERTISE_TTL,
            backoff: DEFAULT_RETRY_BACKOFF,
            status: Mutex::new(AdvertiserStatus::default()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Add a service; it is picked up at the next round.
    pub fn add_service(&self, service: &str) {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        if !services.iter().any(|s| s == service) {
            services.push(service.to_string());
        }
    }

    pub fn services(&self) -> Vec<String> {
        self.services.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn status(&self) -> AdvertiserStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run until `cancel` fires. Cancellation is the only way out, so the
    /// result is always `Ok`.
    pub async fn run(&self, cancel: &CancelToken) -> Result<(), DiscoveryError> {
        loop {
            let services = self.services();
            info!(count = services.len(), "Advertising services");

            let wait = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                wait = self.round(&services) => wait,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("Stopping advertiser");
        Ok(())
    }

    /// Advertise every service once and return how long to wait before the
    /// next round.
    async fn round(&self, services: &[String]) -> Duration {
        let mut first_ttl = None;
        for service in services {
            match self.backend.advertise(service, self.ttl).await {
                Ok(granted) => {
                    debug!(%service, ttl = ?granted, "Advertised service");
                    first_ttl.get_or_insert(granted);
                }
                Err(e) => {
                    warn!(%service, error = %e, backoff = ?self.backoff, "Advertising failed, retrying batch");
                    let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
                    status.last_error = Some(format!("{service}: {e}"));
                    status.rounds += 1;
                    return self.backoff;
                }
            }
        }

        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.services = services.to_vec();
        status.last_success = Some(Utc::now());
        status.last_error = None;
        status.rounds += 1;
        first_ttl.unwrap_or(self.ttl) * 7 / 8
    }

    /// Wrap the loop as a schedulable task.
    pub fn into_task(self: Arc<Self>) -> Task {
        Task::new(move |cancel| async move { self.run(&cancel).await })
    }
}
