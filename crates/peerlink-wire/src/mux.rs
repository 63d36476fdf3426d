//! Listener multiplexer.
//!
//! A [`Mux`] starts several tagged listeners, runs one worker per listener
//! on the injected scheduler and funnels every accepted connection into one
//! bounded queue. A single RPC server then treats the mux as its only
//! listener.

use crate::cancel::CancelToken;
use crate::conn::{Conn, ConnAddr};
use crate::error::TransportError;
use crate::scheduler::{Task, TaskScheduler};
use crate::transport::{Listener, TaggedListener};
use async_trait::async_trait;
use futures::Stream;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Capacity of the merged connection queue.
pub const QUEUE_CAPACITY: usize = 50;

/// How long `close` waits for listener workers to exit.
pub const CLOSE_GRACE: Duration = Duration::from_secs(3);

/// Lifecycle state of one tagged listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerStatus {
    NotRunning,
    Running,
    Failed(String),
    /// Closed through [`Mux::close`].
    Stopped,
}

impl std::fmt::Display for ListenerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerStatus::NotRunning => f.write_str("not running"),
            ListenerStatus::Running => f.write_str("running"),
            ListenerStatus::Failed(reason) => write!(f, "failed: {reason}"),
            ListenerStatus::Stopped => f.write_str("stopped"),
        }
    }
}

/// Callback for listener failures: `(tag, error)`.
pub type ErrorReporter = Arc<dyn Fn(&str, &TransportError) + Send + Sync>;

type StatusMap = Arc<Mutex<BTreeMap<String, ListenerStatus>>>;

/// Merges several listeners into one accept stream.
pub struct Mux {
    lifetime: CancelToken,
    scheduler: Arc<dyn TaskScheduler>,
    pending: Mutex<Vec<TaggedListener>>,
    started: Mutex<Vec<(String, Arc<dyn Listener>)>>,
    status: StatusMap,
    reporter: Option<ErrorReporter>,
    tx: mpsc::Sender<Conn>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Conn>>,
    /// Cloned into every worker; the receiver sees `None` once all are gone.
    done_tx: Mutex<Option<mpsc::Sender<()>>>,
    done_rx: Mutex<Option<mpsc::Receiver<()>>>,
    is_started: AtomicBool,
    is_closed: AtomicBool,
}

impl Mux {
    /// Build a mux whose lifetime is a child of `lifetime`. Tags must be
    /// unique.
    pub fn new(
        lifetime: &CancelToken,
        listeners: Vec<TaggedListener>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Result<Self, TransportError> {
        let mut seen = HashSet::new();
        for l in &listeners {
            if !seen.insert(l.tag().to_string()) {
                return Err(TransportError::DuplicateTag(l.tag().to_string()));
            }
        }

        let status: BTreeMap<String, ListenerStatus> = listeners
            .iter()
            .map(|l| (l.tag().to_string(), ListenerStatus::NotRunning))
            .collect();
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (done_tx, done_rx) = mpsc::channel(1);

        Ok(Self {
            lifetime: lifetime.child(),
            scheduler,
            pending: Mutex::new(listeners),
            started: Mutex::new(Vec::new()),
            status: Arc::new(Mutex::new(status)),
            reporter: None,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx: Mutex::new(Some(done_rx)),
            is_started: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
        })
    }

    /// Install a callback invoked whenever a listener fails.
    pub fn with_error_reporter(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Start every listener and its worker.
    ///
    /// A listener that fails to start is marked failed; the others still
    /// start. Returns early with [`TransportError::Cancelled`] if `ctx` fires
    /// while waiting for a worker to come up.
    pub async fn start(&self, ctx: &CancelToken) -> Result<(), TransportError> {
        if self.is_closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.is_started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyStarted);
        }
        let pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));

        for tagged in pending {
            let tag = tagged.tag().to_string();
            let listener = match tagged.start().await {
                Ok(l) => l,
                Err(e) => {
                    self.fail(&tag, &e);
                    continue;
                }
            };
            self.started
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((tag.clone(), Arc::clone(&listener)));

            let done = self.done_tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
            let Some(done) = done else {
                // Closed while starting.
                let _ = listener.close().await;
                return Err(TransportError::Closed);
            };
            let worker = Worker {
                tag: tag.clone(),
                listener,
                tx: self.tx.clone(),
                lifetime: self.lifetime.clone(),
                status: Arc::clone(&self.status),
                reporter: self.reporter.clone(),
                _done: done,
            };

            let ready = match self
                .scheduler
                .go(&format!("MuxListener_{tag}"), Task::new(move |cancel| worker.run(cancel)))
            {
                Ok(ready) => ready,
                Err(e) => {
                    self.fail(&tag, &TransportError::from(e));
                    continue;
                }
            };

            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(TransportError::Cancelled),
                r = ready => {
                    if r.is_ok() && mark_running(&self.status, &tag) {
                        info!(%tag, "Mux: listener running");
                    }
                }
            }
        }
        Ok(())
    }

    fn fail(&self, tag: &str, err: &TransportError) {
        error!(%tag, error = %err, "Mux: listener failed to start");
        set_status(&self.status, tag, ListenerStatus::Failed(err.to_string()));
        if let Some(report) = &self.reporter {
            report(tag, err);
        }
    }

    /// Wait for the next connection from any listener.
    ///
    /// Returns [`TransportError::NotStarted`] before `start` and
    /// [`TransportError::Closed`] once the mux is closed.
    pub async fn accept(&self) -> Result<Conn, TransportError> {
        if !self.is_started.load(Ordering::Acquire) {
            return Err(TransportError::NotStarted);
        }
        tokio::select! {
            biased;
            _ = self.lifetime.cancelled() => {
                debug!("Mux: lifetime cancelled");
                Err(TransportError::Closed)
            }
            conn = async { self.rx.lock().await.recv().await } => {
                conn.ok_or(TransportError::Closed)
            }
        }
    }

    /// Accepted connections as a stream that ends when the mux closes.
    pub fn incoming(&self) -> impl Stream<Item = Conn> + '_ {
        futures::stream::unfold(self, |mux| async move {
            mux.accept().await.ok().map(|conn| (conn, mux))
        })
    }

    /// Close every listener, cancel the lifetime and wait (bounded) for
    /// workers to exit. Safe to call more than once.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Mux: closing listeners");
        self.lifetime.cancel();

        let listeners: Vec<(String, Arc<dyn Listener>)> =
            self.started.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut errors = Vec::new();
        for (tag, listener) in listeners {
            if let Err(e) = listener.close().await {
                warn!(%tag, error = %e, "Mux: error closing listener");
                errors.push(e);
            }
        }

        self.done_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let done_rx = self.done_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut done_rx) = done_rx {
            if tokio::time::timeout(CLOSE_GRACE, done_rx.recv()).await.is_err() {
                warn!("Mux: listeners did not stop within {:?}", CLOSE_GRACE);
                errors.push(TransportError::StopTimeout(CLOSE_GRACE));
            }
        }

        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            for state in status.values_mut() {
                if !matches!(state, ListenerStatus::Failed(_)) {
                    *state = ListenerStatus::Stopped;
                }
            }
        }
        TransportError::aggregate(errors)
    }

    /// Snapshot of every tag's state.
    pub fn status(&self) -> BTreeMap<String, ListenerStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Bound address of a started listener.
    pub fn local_addr_of(&self, tag: &str) -> Option<ConnAddr> {
        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, l)| l.local_addr())
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Listener for Mux {
    async fn accept(&self) -> Result<Conn, TransportError> {
        Mux::accept(self).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        Mux::close(self).await
    }

    /// Address of the first started listener.
    fn local_addr(&self) -> ConnAddr {
        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .first()
            .map(|(_, l)| l.local_addr())
            .unwrap_or(ConnAddr::Tcp(SocketAddr::from(([0, 0, 0, 0], 0))))
    }
}

fn set_status(status: &StatusMap, tag: &str, state: ListenerStatus) {
    let mut status = status.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(current) = status.get_mut(tag) {
        *current = state;
    }
}

/// A worker may already have failed by the time its readiness is observed.
fn mark_running(status: &StatusMap, tag: &str) -> bool {
    let mut status = status.lock().unwrap_or_else(|e| e.into_inner());
    match status.get_mut(tag) {
        Some(current) if *current == ListenerStatus::NotRunning => {
            *current = ListenerStatus::Running;
            true
        }
        _ => false,
    }
}

struct Worker {
    tag: String,
    listener: Arc<dyn Listener>,
    tx: mpsc::Sender<Conn>,
    lifetime: CancelToken,
    status: StatusMap,
    reporter: Option<ErrorReporter>,
    _done: mpsc::Sender<()>,
}

impl Worker {
    async fn run(self, cancel: CancelToken) -> Result<(), TransportError> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.lifetime.cancelled() => return Ok(()),
                _ = cancel.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted,
            };
            let conn = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    if self.lifetime.is_cancelled() {
                        return Ok(());
                    }
                    error!(tag = %self.tag, error = %e, "Mux: failed accepting new connection");
                    set_status(&self.status, &self.tag, ListenerStatus::Failed(e.to_string()));
                    if let Some(report) = &self.reporter {
                        report(&self.tag, &e);
                    }
                    return Err(e);
                }
            };

            let remote = conn.remote_addr().to_string();
            tokio::select! {
                biased;
                _ = self.lifetime.cancelled() => {
                    debug!(tag = %self.tag, "Mux: closing listener worker");
                    return Ok(());
                }
                sent = self.tx.send(conn) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                    debug!(tag = %self.tag, %remote, "Mux: enqueued connection");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioScheduler;
    use std::sync::atomic::AtomicUsize;

    struct FailingListener;

    #[async_trait]
    impl Listener for FailingListener {
        async fn accept(&self) -> Result<Conn, TransportError> {
            Err(TransportError::ConnectionRefused("boom".into()))
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn local_addr(&self) -> ConnAddr {
            ConnAddr::Tcp(SocketAddr::from(([127, 0, 0, 1], 1)))
        }
    }

    fn scheduler() -> Arc<dyn TaskScheduler> {
        Arc::new(TokioScheduler::new(0))
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ListenerStatus::NotRunning.to_string(), "not running");
        assert_eq!(ListenerStatus::Running.to_string(), "running");
        assert_eq!(ListenerStatus::Failed("x".into()).to_string(), "failed: x");
        assert_eq!(ListenerStatus::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_duplicate_tags_rejected() {
        let lifetime = CancelToken::new();
        let result = Mux::new(
            &lifetime,
            vec![
                TaggedListener::tcp("127.0.0.1:0".parse().unwrap()),
                TaggedListener::tcp("127.0.0.1:0".parse().unwrap()),
            ],
            Arc::new(TokioScheduler::new(0)),
        );
        assert!(matches!(result, Err(TransportError::DuplicateTag(t)) if t == "TCP 127.0.0.1:0"));
    }

    #[tokio::test]
    async fn test_accept_before_start() {
        let mux = Mux::new(&CancelToken::new(), vec![], scheduler()).unwrap();
        assert!(matches!(mux.accept().await, Err(TransportError::NotStarted)));
    }

    #[tokio::test]
    async fn test_start_twice() {
        let mux = Mux::new(&CancelToken::new(), vec![], scheduler()).unwrap();
        mux.start(&CancelToken::new()).await.unwrap();
        assert!(matches!(
            mux.start(&CancelToken::new()).await,
            Err(TransportError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_failed_listener_isolated_and_reported() {
        let reported = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&reported);
        let mux = Mux::new(
            &CancelToken::new(),
            vec![
                TaggedListener::ready("bad", Arc::new(FailingListener)),
                TaggedListener::new("unstartable", || async {
                    Err(TransportError::ConnectionRefused("bind".into()))
                }),
                TaggedListener::tcp("127.0.0.1:0".parse().unwrap()),
            ],
            scheduler(),
        )
        .unwrap()
        .with_error_reporter(Arc::new(move |_tag, _err| {
            r.fetch_add(1, Ordering::SeqCst);
        }));

        let initial = mux.status();
        assert!(initial.values().all(|s| *s == ListenerStatus::NotRunning));

        mux.start(&CancelToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = mux.status();
        assert!(status["bad"].to_string().starts_with("failed: "));
        assert!(status["unstartable"].to_string().contains("bind"));
        assert_eq!(status["TCP 127.0.0.1:0"], ListenerStatus::Running);
        assert_eq!(reported.load(Ordering::SeqCst), 2);

        // The healthy listener still delivers.
        let ConnAddr::Tcp(addr) = mux.local_addr_of("TCP 127.0.0.1:0").unwrap() else {
            panic!("expected a TCP address");
        };
        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let conn = tokio::time::timeout(Duration::from_secs(1), mux.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(conn.local_addr(), ConnAddr::Tcp(a) if *a == addr));

        mux.close().await.unwrap();
        let status = mux.status();
        assert!(matches!(status["bad"], ListenerStatus::Failed(_)));
        assert_eq!(status["TCP 127.0.0.1:0"], ListenerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mux = Mux::new(
            &CancelToken::new(),
            vec![TaggedListener::tcp("127.0.0.1:0".parse().unwrap())],
            scheduler(),
        )
        .unwrap();
        mux.start(&CancelToken::new()).await.unwrap();
        mux.close().await.unwrap();
        mux.close().await.unwrap();
        assert!(mux.is_closed());
        assert!(matches!(mux.accept().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_parent_cancel_ends_accept() {
        let parent = CancelToken::new();
        let mux = Mux::new(&parent, vec![], scheduler()).unwrap();
        mux.start(&CancelToken::new()).await.unwrap();
        parent.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), mux.accept())
            .await
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
