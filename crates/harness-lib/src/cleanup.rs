//! Bounded teardown of cluster objects the harness created
//!
//! A [`CleanupGuard`] owns the teardown future of a derived object. Calling
//! [`CleanupGuard::run`] awaits it with a time limit. Dropping a guard that
//! was never run, which happens when the owning future is cancelled, spawns
//! the same bounded teardown onto the current runtime.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

type Teardown = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct CleanupGuard {
    what: String,
    timeout: Duration,
    teardown: Option<Teardown>,
}

impl CleanupGuard {
    pub fn new<F>(what: impl Into<String>, timeout: Duration, teardown: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            what: what.into(),
            timeout,
            teardown: Some(Box::pin(teardown)),
        }
    }

    /// Tear down now; returns once done or once the time limit passes
    ///
    /// If the caller is cancelled mid-way the rest of the teardown moves to a
    /// spawned task.
    pub async fn run(mut self) {
        if let Some(teardown) = self.teardown.as_mut() {
            if tokio::time::timeout(self.timeout, teardown).await.is_err() {
                warn!(what = %self.what, timeout_secs = self.timeout.as_secs(), "Cleanup timed out");
            }
        }
        self.teardown = None;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(teardown) = self.teardown.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                debug!(what = %self.what, "Cleanup dropped before running, spawning it");
                handle.spawn(bounded(self.what.clone(), self.timeout, teardown));
            }
            Err(_) => warn!(what = %self.what, "No runtime left to clean up on, object leaked"),
        }
    }
}

async fn bounded(what: String, timeout: Duration, teardown: Teardown) {
    if tokio::time::timeout(timeout, teardown).await.is_err() {
        warn!(what = %what, timeout_secs = timeout.as_secs(), "Cleanup timed out");
    }
}
