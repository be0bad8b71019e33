//! Tracks in-flight connection handlers so shutdown can wait for them.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    active: AtomicUsize,
    idle: Notify,
}

/// A wait group with a bounded wait.
///
/// Every handler holds a [`DrainGuard`] for its whole lifetime. The guard is
/// taken before the handler task is spawned and released when it drops, so
/// every exit path decrements the count.
#[derive(Clone, Default)]
pub struct DrainManager {
    inner: Arc<Inner>,
}

impl DrainManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more in-flight handler.
    pub fn add(&self) -> DrainGuard {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        DrainGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Resolve once no handler is in flight.
    pub async fn wait(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            // Register before checking so a release between the check and
            // the await is not missed.
            idle.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Like [`wait`](Self::wait), failing with [`Error::StopTimeout`] if the
    /// count has not reached zero within `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| Error::StopTimeout)
    }
}

pub struct DrainGuard {
    inner: Arc<Inner>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
