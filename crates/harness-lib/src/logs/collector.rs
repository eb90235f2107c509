//! Fixed-duration log collection for stability analysis

use super::split_lines;
use crate::error::Result;
use crate::exec::{PodBackend, PodQuery};
use crate::observability::HarnessMetrics;
use crate::poll::poll_until_timeout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Options for [`LogCollector::collect`]
#[derive(Debug, Clone)]
pub struct CollectOptions {
    start_time: DateTime<Utc>,
    duration: Duration,
    polling_interval: Duration,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            duration: Duration::from_secs(300),
            polling_interval: Duration::from_secs(10),
        }
    }
}

impl CollectOptions {
    pub fn start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        if duration.is_zero() {
            warn!("Collection duration must be positive, using default");
            self.duration = Self::default().duration;
        } else {
            self.duration = duration;
        }
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        if interval.is_zero() {
            warn!("Collection polling interval must be positive, using default");
            self.polling_interval = Self::default().polling_interval;
        } else {
            self.polling_interval = interval;
        }
        self
    }
}

/// Everything gathered from one node over a collection window
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionResult {
    pub node_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub lines: Vec<String>,
    /// Fetch failures, in the order they happened
    pub errors: Vec<String>,
    pub successful_fetches: usize,
}

impl CollectionResult {
    /// A window is trustworthy when at least one fetch worked and the lines
    /// read outnumber the failed fetches
    pub fn is_reliable(&self) -> bool {
        self.successful_fetches > 0 && (self.errors.is_empty() || self.lines.len() > self.errors.len())
    }
}

#[derive(Default)]
struct Accumulator {
    cursor: Option<DateTime<Utc>>,
    lines: Vec<String>,
    errors: Vec<String>,
    successful_fetches: usize,
}

/// Accumulates a node's daemon log for a fixed window
#[derive(Clone)]
pub struct LogCollector {
    backend: Arc<dyn PodBackend>,
    daemon: PodQuery,
    metrics: HarnessMetrics,
}

impl LogCollector {
    pub fn new(backend: Arc<dyn PodBackend>, daemon: PodQuery) -> Self {
        Self {
            backend,
            daemon,
            metrics: HarnessMetrics::new(),
        }
    }

    /// Collect every line logged on `node` for the configured duration
    ///
    /// Fetch failures are recorded, never fatal. The window closing is the
    /// normal way out.
    pub async fn collect(&self, node: &str, options: &CollectOptions) -> Result<CollectionResult> {
        let started_at = Utc::now();
        let state = Mutex::new(Accumulator {
            cursor: Some(options.start_time),
            ..Default::default()
        });

        info!(node = %node, duration_secs = options.duration.as_secs(), "Collecting daemon logs");

        let outcome: Result<()> = poll_until_timeout(
            &format!("log collection on {}", node),
            options.polling_interval,
            options.duration,
            true,
            || {
                let state = &state;
                async move {
                    self.fetch_once(node, state).await;
                    Ok(None)
                }
            },
        )
        .await;

        match outcome {
            Err(e) if e.is_timeout() => {}
            Err(e) => return Err(e.context("collect logs", node)),
            Ok(()) => {}
        }

        let state = state.into_inner().unwrap_or_else(|e| e.into_inner());
        let result = CollectionResult {
            node_name: node.to_string(),
            started_at,
            ended_at: Utc::now(),
            lines: state.lines,
            errors: state.errors,
            successful_fetches: state.successful_fetches,
        };

        info!(
            node = %node,
            lines = result.lines.len(),
            errors = result.errors.len(),
            "Log collection finished"
        );
        Ok(result)
    }

    async fn fetch_once(&self, node: &str, state: &Mutex<Accumulator>) {
        let local_fetch_time = Utc::now();
        let since = state.lock().unwrap_or_else(|e| e.into_inner()).cursor;

        let fetched = match self.backend.find_pod(&self.daemon, node).await {
            Ok(pod) => self.backend.logs(&pod, since).await,
            Err(e) => Err(e),
        };

        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        match fetched {
            Ok(chunk) => {
                state.cursor = Some(local_fetch_time);
                state.successful_fetches += 1;
                let before = state.lines.len();
                state.lines.extend(split_lines(&chunk).map(str::to_string));
                debug!(node = %node, new_lines = state.lines.len() - before, "Fetched log chunk");
            }
            Err(e) => {
                self.metrics.inc_log_fetch_errors();
                warn!(node = %node, error = %e, "Log fetch failed during collection");
                state.errors.push(e.to_string());
            }
        }
    }
}
