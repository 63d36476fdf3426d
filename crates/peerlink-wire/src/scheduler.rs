//! Background task scheduling.
//!
//! Long-lived loops (mux workers, the advertiser, mesher fan-out) are plain
//! [`Task`]s handed to a [`TaskScheduler`]. The scheduler owns their
//! lifetime: each task receives a [`CancelToken`] that fires on shutdown.

use crate::cancel::CancelToken;
use crate::error::SchedulerError;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Error type returned by a task body.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A named unit of background work: `(cancel) -> Result`.
pub struct Task {
    run: Box<dyn FnOnce(CancelToken) -> BoxFuture<'static, Result<(), BoxError>> + Send>,
}

impl Task {
    pub fn new<F, Fut, E>(f: F) -> Self
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self {
            run: Box::new(move |cancel| {
                let fut = f(cancel);
                Box::pin(async move { fut.await.map_err(Into::into) })
            }),
        }
    }

    fn into_future(self, cancel: CancelToken) -> BoxFuture<'static, Result<(), BoxError>> {
        (self.run)(cancel)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Task")
    }
}

/// Anything that can run a named long-lived task.
///
/// The returned receiver resolves once the task body has actually started.
/// It is dropped without a value if the task never runs.
pub trait TaskScheduler: Send + Sync {
    fn go(&self, name: &str, task: Task) -> Result<oneshot::Receiver<()>, SchedulerError>;
}

struct TaskEntry {
    name: String,
    handle: Option<JoinHandle<()>>,
}

struct SchedulerInner {
    tasks: DashMap<u64, TaskEntry>,
    next_id: AtomicU64,
    limit: Option<Arc<Semaphore>>,
    root: CancelToken,
    stopped: AtomicBool,
}

/// [`TaskScheduler`] running every task on the tokio runtime.
#[derive(Clone)]
pub struct TokioScheduler {
    inner: Arc<SchedulerInner>,
}

impl TokioScheduler {
    /// Create a scheduler. `max_workers == 0` means no concurrency bound.
    pub fn new(max_workers: usize) -> Self {
        let limit = (max_workers > 0).then(|| Arc::new(Semaphore::new(max_workers)));
        Self {
            inner: Arc::new(SchedulerInner {
                tasks: DashMap::new(),
                next_id: AtomicU64::new(1),
                limit,
                root: CancelToken::new(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Names of tasks that are queued or running, sorted.
    pub fn status(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .tasks
            .iter()
            .map(|entry| entry.value().name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of live tasks.
    pub fn active_count(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Cancel every task, wait up to `grace` for them to return, then abort
    /// whatever is still running. Returns the number of aborted tasks.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return 0;
        }
        info!(tasks = self.inner.tasks.len(), "Scheduler: shutting down");
        self.inner.root.cancel();
        if let Some(limit) = &self.inner.limit {
            limit.close();
        }

        let handles: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .iter_mut()
            .filter_map(|mut entry| entry.value_mut().handle.take())
            .collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_ok()
        {
            return 0;
        }

        let stragglers = self.status();
        warn!(?stragglers, "Scheduler: tasks did not stop within {grace:?}, aborting");
        for abort in &aborts {
            abort.abort();
        }
        let count = self.inner.tasks.len();
        self.inner.tasks.clear();
        count
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new(0)
    }
}

impl TaskScheduler for TokioScheduler {
    fn go(&self, name: &str, task: Task) -> Result<oneshot::Receiver<()>, SchedulerError> {
        if self.is_stopped() {
            return Err(SchedulerError::Stopped);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        // Registered before spawning so a task that finishes instantly can
        // still remove its own entry.
        self.inner.tasks.insert(
            id,
            TaskEntry {
                name: name.to_string(),
                handle: None,
            },
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let cancel = self.inner.root.child();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            let _permit = match &inner.limit {
                Some(limit) => {
                    let acquire = Arc::clone(limit).acquire_owned();
                    tokio::select! {
                        permit = acquire => match permit {
                            Ok(p) => Some(p),
                            Err(_) => {
                                inner.tasks.remove(&id);
                                return;
                            }
                        },
                        _ = cancel.cancelled() => {
                            inner.tasks.remove(&id);
                            return;
                        }
                    }
                }
                None => None,
            };

            debug!(task = %task_name, "Scheduler: task started");
            let _ = ready_tx.send(());
            match task.into_future(cancel).await {
                Ok(()) => debug!(task = %task_name, "Scheduler: task finished"),
                Err(e) => warn!(task = %task_name, error = %e, "Scheduler: task failed"),
            }
            inner.tasks.remove(&id);
        });

        if let Some(mut entry) = self.inner.tasks.get_mut(&id) {
            entry.handle = Some(handle);
        }
        Ok(ready_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_go_signals_ready_and_runs() {
        let sched = TokioScheduler::new(0);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let ready = sched
            .go(
                "counter",
                Task::new(move |_cancel| async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), BoxError>(())
                }),
            )
            .unwrap();
        ready.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(sched.active_count(), 0);
    }

    #[tokio::test]
    async fn test_status_lists_running_tasks() {
        let sched = TokioScheduler::new(0);
        for name in ["b-loop", "a-loop"] {
            sched
                .go(
                    name,
                    Task::new(|cancel: CancelToken| async move {
                        cancel.cancelled().await;
                        Ok::<(), BoxError>(())
                    }),
                )
                .unwrap()
                .await
                .unwrap();
        }
        assert_eq!(sched.status(), vec!["a-loop".to_string(), "b-loop".to_string()]);
        assert_eq!(sched.shutdown(Duration::from_secs(1)).await, 0);
        assert_eq!(sched.active_count(), 0);
    }

    #[tokio::test]
    async fn test_max_workers_bounds_concurrency() {
        let sched = TokioScheduler::new(1);
        let first = sched
            .go(
                "first",
                Task::new(|cancel: CancelToken| async move {
                    cancel.cancelled().await;
                    Ok::<(), BoxError>(())
                }),
            )
            .unwrap();
        first.await.unwrap();

        let mut second = sched
            .go(
                "second",
                Task::new(|_cancel| async { Ok::<(), BoxError>(()) }),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(second.try_recv().is_err(), "second task must wait for a permit");
        sched.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stragglers() {
        let sched = TokioScheduler::new(0);
        sched
            .go(
                "stubborn",
                Task::new(|_cancel| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<(), BoxError>(())
                }),
            )
            .unwrap()
            .await
            .unwrap();
        let aborted = sched.shutdown(Duration::from_millis(50)).await;
        assert_eq!(aborted, 1);
        assert!(matches!(
            sched.go("late", Task::new(|_c| async { Ok::<(), BoxError>(()) })),
            Err(SchedulerError::Stopped)
        ));
    }
}
