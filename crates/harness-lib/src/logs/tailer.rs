//! Wait for a matching line in a node's daemon log
//!
//! Every poll re-resolves the daemon pod and fetches only what was logged
//! since the previous fetch started. The cursor is taken *before* the fetch
//! is issued so lines written during the fetch are read again next time
//! rather than skipped.

use super::{split_lines, LineMatcher};
use crate::error::{HarnessError, Result};
use crate::exec::{PodBackend, PodQuery};
use crate::observability::HarnessMetrics;
use crate::poll::poll_until_timeout;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Options for [`LogTailer::wait_for_log`]
#[derive(Debug, Clone)]
pub struct TailOptions {
    start_time: DateTime<Utc>,
    timeout: Duration,
    polling_interval: Duration,
    matcher: LineMatcher,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            timeout: Duration::from_secs(5 * 60),
            polling_interval: Duration::from_secs(5),
            matcher: LineMatcher::Never,
        }
    }
}

impl TailOptions {
    pub fn new(matcher: LineMatcher) -> Self {
        Self::default().matcher(matcher)
    }

    pub fn start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            warn!("Log tail timeout must be positive, using default");
            self.timeout = Self::default().timeout;
        } else {
            self.timeout = timeout;
        }
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        if interval.is_zero() {
            warn!("Log tail polling interval must be positive, using default");
            self.polling_interval = Self::default().polling_interval;
        } else {
            self.polling_interval = interval;
        }
        self
    }

    /// `None` logs a warning and installs the never-matching matcher
    pub fn matcher(mut self, matcher: impl Into<Option<LineMatcher>>) -> Self {
        self.matcher = match matcher.into() {
            Some(matcher) => matcher,
            None => {
                warn!("No log matcher supplied, this wait can only time out");
                LineMatcher::Never
            }
        };
        self
    }

    pub fn get_start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }
}

/// Tails the daemon container log on nodes
#[derive(Clone)]
pub struct LogTailer {
    backend: Arc<dyn PodBackend>,
    daemon: PodQuery,
    metrics: HarnessMetrics,
}

impl LogTailer {
    pub fn new(backend: Arc<dyn PodBackend>, daemon: PodQuery) -> Self {
        Self {
            backend,
            daemon,
            metrics: HarnessMetrics::new(),
        }
    }

    /// Wait until a line logged on `node` at or after the start time matches
    ///
    /// Returns the first matching line.
    pub async fn wait_for_log(&self, node: &str, options: &TailOptions) -> Result<String> {
        let cursor = Mutex::new(options.start_time);
        let matcher = &options.matcher;

        debug!(node = %node, matcher = %matcher, "Waiting for log line");

        let line = poll_until_timeout(
            &format!("log line {} on {}", matcher, node),
            options.polling_interval,
            options.timeout,
            true,
            || {
                let cursor = &cursor;
                async move {
                    let local_fetch_time = Utc::now();
                    let since = *cursor.lock().unwrap_or_else(|e| e.into_inner());
                    self.metrics.inc_poll_attempts("log");

                    let pod = match self.backend.find_pod(&self.daemon, node).await {
                        Ok(pod) => pod,
                        Err(e) => {
                            warn!(node = %node, error = %e, "Daemon pod lookup failed, retrying");
                            return Ok(None);
                        }
                    };

                    let chunk = match self.backend.logs(&pod, Some(since)).await {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            self.metrics.inc_log_fetch_errors();
                            warn!(node = %node, error = %e, "Log fetch failed, retrying");
                            return Ok(None);
                        }
                    };
                    *cursor.lock().unwrap_or_else(|e| e.into_inner()) = local_fetch_time;

                    let found = split_lines(&chunk)
                        .find(|line| matcher.matches(line))
                        .map(str::to_string);
                    Ok(found)
                }
            },
        )
        .await
        .map_err(|e| e.context("wait for log", node))?;

        info!(node = %node, line = %line, "Matched log line");
        Ok(line)
    }

    /// Run one tailer per node in parallel; succeeds only if every node matches
    pub async fn wait_for_log_on_nodes(&self, nodes: &[String], options: &TailOptions) -> Result<()> {
        let results = join_all(nodes.iter().map(|node| self.wait_for_log(node, options))).await;

        let errors: Vec<HarnessError> = results.into_iter().filter_map(|r| r.err()).collect();
        HarnessError::join(errors)
    }
}
