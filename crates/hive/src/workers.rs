//! Bounded worker pools.
//!
//! Every piece of blocking or slow work (session volleys, global commands,
//! connect bootstrap, data queries, transcription) runs on a named pool
//! with a fixed number of permits. The transport loop only enqueues.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker pool {0} is closed")]
    Closed(&'static str),

    #[error("worker task panicked: {0}")]
    Panicked(String),

    #[error("worker task was cancelled")]
    Cancelled,
}

/// Counters for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: usize,
}

struct Inner {
    name: &'static str,
    permits: Semaphore,
    in_flight: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    idle: Notify,
}

/// A named pool that runs at most `size` tasks at once.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                permits: Semaphore::new(size.max(1)),
                in_flight: AtomicUsize::new(0),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Run `fut` on the pool and wait for its output.
    pub async fn run<F, T>(&self, label: &'static str, fut: F) -> Result<T, WorkerError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(label, Duration::ZERO, fut)
            .await
            .map_err(|e| {
                if e.is_panic() {
                    WorkerError::Panicked(e.to_string())
                } else {
                    WorkerError::Cancelled
                }
            })?
    }

    /// Queue `fut` on the pool without waiting for it.
    pub fn submit<F>(&self, label: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        drop(self.spawn(label, Duration::ZERO, fut));
    }

    /// Queue `fut` to start after `delay`. The wait does not hold a permit,
    /// but the task counts as in flight from now.
    pub fn submit_after<F>(&self, label: &'static str, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        drop(self.spawn(label, delay, fut));
    }

    fn spawn<F, T>(
        &self,
        label: &'static str,
        delay: Duration,
        fut: F,
    ) -> JoinHandle<Result<T, WorkerError>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        inner.submitted.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let guard = InFlight {
                inner: inner.clone(),
                finished: false,
            };

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let _permit = match inner.permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!(pool = inner.name, task = label, "Worker pool closed");
                    return Err(WorkerError::Closed(inner.name));
                }
            };

            tracing::trace!(pool = inner.name, task = label, "Worker task started");
            let output = fut.await;
            guard.finish();
            Ok(output)
        })
    }

    /// Wait until nothing is queued or running.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work. Queued tasks fail with [`WorkerError::Closed`].
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
        }
    }
}

/// Decrements the in-flight count however the task ends (including panics
/// and cancellation).
struct InFlight {
    inner: Arc<Inner>,
    finished: bool,
}

impl InFlight {
    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.finished {
            self.inner.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.failed.fetch_add(1, Ordering::Relaxed);
        }
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
