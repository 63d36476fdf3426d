//! Node supervision: the shutdown signal and a tally of component failures.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{info, warn};

/// Shutdown signal manager with failure accounting.
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    failure_count: AtomicU64,
    /// Failures per component (listener tag, task name).
    component_failures: DashMap<String, u32>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            shutdown_tx: tx,
            shutdown_rx: rx,
            failure_count: AtomicU64::new(0),
            component_failures: DashMap::new(),
        }
    }

    /// Get a receiver that will be notified on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Trigger a graceful shutdown.
    pub fn shutdown(&self) {
        info!("Supervisor: initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        // A dropped sender cannot happen while `self` is alive.
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    /// Record that `component` failed. Returns its failure count so far.
    pub fn record_failure(&self, component: &str, reason: &str) -> u32 {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let mut count = self
            .component_failures
            .entry(component.to_string())
            .or_insert(0);
        *count += 1;
        warn!(%component, %reason, failures = *count, "Component failure recorded");
        *count
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn component_failures(&self, component: &str) -> u32 {
        self.component_failures.get(component).map(|c| *c).unwrap_or(0)
    }

    pub fn health(&self) -> SupervisorHealth {
        SupervisorHealth {
            is_shutting_down: self.is_shutting_down(),
            failure_count: self.failure_count(),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Health report from the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHealth {
    pub is_shutting_down: bool,
    pub failure_count: u64,
}
