//! Worker lifecycle manager.
//!
//! Runs job bodies on the tokio runtime with a bounded number of execution
//! slots, tracks every registered work item and coordinates graceful
//! shutdown. Cancellation is cooperative: the shutdown token is handed to
//! each body and nothing is ever aborted from the outside.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bookforge_common::{Error, Result, WorkItemId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

type CleanupFn = Box<dyn Fn() + Send + Sync>;

/// Where a work item is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    /// Registered, waiting for an execution slot.
    Queued,
    Running,
}

/// A registered unit of background execution.
#[derive(Debug, Clone, Serialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub name: String,
    pub state: WorkState,
    pub registered_at: DateTime<Utc>,
}

/// Handed to every job body.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub id: WorkItemId,
    pub name: String,
    pub shutdown: CancellationToken,
}

impl WorkContext {
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Result of [`WorkerManager::request_shutdown`].
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub finished_in_time: bool,
    /// Names of items still alive when the timeout elapsed.
    pub still_running: Vec<String>,
}

struct Inner {
    slots: Arc<Semaphore>,
    items: DashMap<WorkItemId, WorkItem>,
    shutdown: CancellationToken,
    cleanup: Mutex<Vec<CleanupFn>>,
    cleanup_ran: AtomicBool,
    idle: Notify,
}

/// Bounded pool of background execution slots.
#[derive(Clone)]
pub struct WorkerManager {
    inner: Arc<Inner>,
}

impl WorkerManager {
    pub fn new(max_concurrent: usize) -> Self {
        Self::with_token(max_concurrent, CancellationToken::new())
    }

    /// Use an externally owned shutdown token, e.g. one cancelled by a signal handler.
    pub fn with_token(max_concurrent: usize, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
                items: DashMap::new(),
                shutdown,
                cleanup: Mutex::new(Vec::new()),
                cleanup_ran: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    /// Register a work item and run `body` once a slot is free.
    ///
    /// The registration is removed on every exit path: normal return, error,
    /// panic, or shutdown before the body got a slot. Errors and panics are
    /// logged here and never reach the caller.
    pub fn run<F, Fut>(&self, name: impl Into<String>, body: F) -> Result<WorkItemId>
    where
        F: FnOnce(WorkContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.is_shutdown_requested() {
            return Err(Error::Conflict("shutdown in progress".into()));
        }

        let id = WorkItemId::new();
        let name = name.into();
        self.inner.items.insert(
            id,
            WorkItem {
                id,
                name: name.clone(),
                state: WorkState::Queued,
                registered_at: Utc::now(),
            },
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _registration = Registration {
                inner: inner.clone(),
                id,
            };

            let permit = tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => {
                    tracing::debug!(work_item = %name, "Shutdown before start; skipping");
                    return;
                }
                permit = inner.slots.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
            };

            if let Some(mut item) = inner.items.get_mut(&id) {
                item.state = WorkState::Running;
            }
            tracing::debug!(work_item = %name, %id, "Work item started");

            let ctx = WorkContext {
                id,
                name: name.clone(),
                shutdown: inner.shutdown.clone(),
            };
            let result = AssertUnwindSafe(async move { body(ctx).await })
                .catch_unwind()
                .await;
            drop(permit);

            match result {
                Ok(Ok(())) => tracing::debug!(work_item = %name, "Work item finished"),
                Ok(Err(e)) => tracing::error!(work_item = %name, error = %e, "Work item failed"),
                Err(panic) => tracing::error!(
                    work_item = %name,
                    panic = panic_message(&panic),
                    "Work item panicked"
                ),
            }
        });

        Ok(id)
    }

    /// Register a callback run once when shutdown is requested, before waiting.
    pub fn on_shutdown(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.cleanup.lock().push(Box::new(callback));
    }

    /// Signal shutdown, run the cleanup callbacks and wait up to `timeout`
    /// for registered items to finish. Survivors are reported, not killed.
    pub async fn request_shutdown(&self, timeout: Duration) -> ShutdownReport {
        tracing::info!(
            active = self.active_count(),
            timeout_secs = timeout.as_secs_f64(),
            "Shutdown requested"
        );
        self.inner.shutdown.cancel();

        if !self.inner.cleanup_ran.swap(true, Ordering::SeqCst) {
            let callbacks = std::mem::take(&mut *self.inner.cleanup.lock());
            for callback in callbacks {
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback())) {
                    tracing::error!(panic = panic_message(&panic), "Shutdown callback panicked");
                }
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.items.is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let still_running = self.active_names();
        if still_running.is_empty() {
            tracing::info!("All work items finished");
        } else {
            tracing::warn!(
                still_running = ?still_running,
                "Work items still running after shutdown timeout"
            );
        }
        ShutdownReport {
            finished_in_time: still_running.is_empty(),
            still_running,
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn active_count(&self) -> usize {
        self.inner.items.len()
    }

    /// Snapshot of registered items, oldest first.
    pub fn active_items(&self) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = self.inner.items.iter().map(|e| e.value().clone()).collect();
        items.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        items
    }

    pub fn active_names(&self) -> Vec<String> {
        self.active_items().into_iter().map(|i| i.name).collect()
    }
}

/// Deregisters a work item when dropped.
struct Registration {
    inner: Arc<Inner>,
    id: WorkItemId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inner.items.remove(&self.id);
        if self.inner.items.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolve on Ctrl-C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
