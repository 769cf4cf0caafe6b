//! Bounded Worker Pool
//!
//! Background work (revalidation refreshes, early refreshes, warming) runs
//! here instead of as detached tasks: concurrency is capped by a semaphore,
//! every task is tracked, and shutdown cancels queued and running work.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Fixed-concurrency task pool with cancellation
pub struct WorkerPool {
    name: String,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    running: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Create a pool of `size` workers, cancelled together with `parent`
    pub fn new(name: impl Into<String>, size: usize, parent: &CancellationToken) -> Self {
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(size.max(1))),
            tracker: TaskTracker::new(),
            cancel: parent.child_token(),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a task. It starts once a worker is free.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Shutdown);
        }

        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();
        let running = Arc::clone(&self.running);

        self.tracker.spawn(async move {
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = cancel.cancelled() => return,
            };

            running.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = task => {}
                _ = cancel.cancelled() => {}
            }
            running.fetch_sub(1, Ordering::Relaxed);
        });
        Ok(())
    }

    /// Tasks queued or running
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Tasks currently holding a worker
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until every submitted task has finished
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        if !self.cancel.is_cancelled() {
            self.tracker.reopen();
        }
    }

    /// Cancel queued and running tasks and wait for them to unwind
    pub async fn shutdown(&self) {
        let pending = self.pending();
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        if pending > 0 {
            info!(pool = %self.name, cancelled = pending, "worker pool shut down");
        } else {
            debug!(pool = %self.name, "worker pool shut down");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
