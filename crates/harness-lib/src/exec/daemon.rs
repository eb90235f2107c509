//! Retry-aware command execution in the PTP daemon pod of a node

use super::{shell, PodBackend, PodQuery};
use crate::error::{HarnessError, Result};
use crate::observability::HarnessMetrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for [`NodeExecutor::exec`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    attempts: u32,
    retry_on_error: bool,
    retry_on_empty: bool,
    retry_delay: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            retry_on_error: false,
            retry_on_empty: false,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl ExecOptions {
    /// Number of attempts; zero is rejected and replaced by the default
    pub fn attempts(mut self, attempts: u32) -> Self {
        if attempts == 0 {
            warn!("Exec attempts must be at least 1, using default");
            self.attempts = Self::default().attempts;
        } else {
            self.attempts = attempts;
        }
        self
    }

    pub fn retry_on_error(mut self, retry: bool) -> Self {
        self.retry_on_error = retry;
        self
    }

    pub fn retry_on_empty(mut self, retry: bool) -> Self {
        self.retry_on_empty = retry;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn get_attempts(&self) -> u32 {
        self.attempts
    }
}

/// Why the most recent attempt did not produce output
enum Failure {
    Locate(HarnessError),
    Command(HarnessError),
    Empty,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Locate(e) => write!(f, "failed to locate daemon pod: {}", e),
            Failure::Command(e) => write!(f, "command failed: {}", e),
            Failure::Empty => write!(f, "command produced no output"),
        }
    }
}

/// Runs shell commands inside the PTP daemon container on a node
///
/// The daemon pod is looked up again on every attempt so a restarted pod is
/// picked up transparently.
#[derive(Clone)]
pub struct NodeExecutor {
    backend: Arc<dyn PodBackend>,
    daemon: PodQuery,
    metrics: HarnessMetrics,
}

impl NodeExecutor {
    pub fn new(backend: Arc<dyn PodBackend>, daemon: PodQuery) -> Self {
        Self {
            backend,
            daemon,
            metrics: HarnessMetrics::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn PodBackend> {
        &self.backend
    }

    pub fn daemon_query(&self) -> &PodQuery {
        &self.daemon
    }

    /// Run `sh -c <command>` in the daemon container on `node`
    ///
    /// Returns the trimmed combined output of the first attempt that is
    /// accepted by `options`.
    pub async fn exec(&self, node: &str, command: &str, options: &ExecOptions) -> Result<String> {
        let argv = shell(command);
        let mut last_failure = Failure::Empty;

        for attempt in 1..=options.attempts {
            if attempt > 1 {
                self.metrics.inc_exec_retries();
                tokio::time::sleep(options.retry_delay).await;
            }

            let pod = match self.backend.find_pod(&self.daemon, node).await {
                Ok(pod) => pod,
                Err(e) => {
                    debug!(node = %node, attempt = attempt, error = %e, "Daemon pod lookup failed");
                    last_failure = Failure::Locate(e);
                    continue;
                }
            };

            match self.backend.exec(&pod, &argv).await {
                Ok(output) => {
                    let text = output.combined().trim().to_string();
                    if text.is_empty() && options.retry_on_empty {
                        debug!(node = %node, attempt = attempt, command = %command, "Empty output, retrying");
                        last_failure = Failure::Empty;
                        continue;
                    }
                    return Ok(text);
                }
                Err(e) if options.retry_on_error => {
                    debug!(node = %node, attempt = attempt, error = %e, "Command failed, retrying");
                    last_failure = Failure::Command(e);
                }
                Err(e) => return Err(e.context("exec in daemon pod", node)),
            }
        }

        Err(HarnessError::transient(
            format!("exec {:?} on node {}", command, node),
            format!("exhausted {} attempts, last failure: {}", options.attempts, last_failure),
        ))
    }
}
