//! Waiting on the cloud-event consumer sidecar
//!
//! The whole store is re-read on every poll, so events that arrive while the
//! poll interval is wide are never lost. Events are stably sorted by source
//! timestamp, which keeps arrival order for ties, and are never deduplicated.

use super::{CloudEvent, EventFilter};
use crate::error::{HarnessError, Result};
use crate::exec::{PodBackend, PodQuery};
use crate::observability::HarnessMetrics;
use crate::poll::poll_until_timeout;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Source of the events a node's consumer has received, in arrival order
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch_events(&self, node: &str) -> Result<Vec<CloudEvent>>;
}

/// Reads the consumer sidecar's newline-delimited JSON store through exec
pub struct ConsumerEventSource {
    backend: Arc<dyn PodBackend>,
    consumer: PodQuery,
    store_path: String,
}

impl ConsumerEventSource {
    pub fn new(backend: Arc<dyn PodBackend>, consumer: PodQuery, store_path: impl Into<String>) -> Self {
        Self {
            backend,
            consumer,
            store_path: store_path.into(),
        }
    }
}

/// Parse a newline-delimited store, skipping lines that are not events
pub(crate) fn parse_store(raw: &str) -> Vec<CloudEvent> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<CloudEvent>(line) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(error = %e, "Skipping unparsable event store line");
                None
            }
        })
        .collect()
}

#[async_trait]
impl EventSource for ConsumerEventSource {
    async fn fetch_events(&self, node: &str) -> Result<Vec<CloudEvent>> {
        let pod = self.backend.find_pod(&self.consumer, node).await?;
        let argv = vec!["cat".to_string(), self.store_path.clone()];
        let output = self.backend.exec(&pod, &argv).await?;
        Ok(parse_store(&output.stdout_lossy()))
    }
}

/// Options for [`EventConsumer::wait_for_event`]
#[derive(Debug, Clone)]
pub struct EventWaitOptions {
    start_time: DateTime<Utc>,
    timeout: Duration,
    polling_interval: Duration,
    without_current_state: bool,
}

impl Default for EventWaitOptions {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            timeout: Duration::from_secs(5 * 60),
            polling_interval: Duration::from_secs(2),
            without_current_state: false,
        }
    }
}

impl EventWaitOptions {
    pub fn start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            warn!("Event wait timeout must be positive, using default");
            self.timeout = Self::default().timeout;
        } else {
            self.timeout = timeout;
        }
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        if interval.is_zero() {
            warn!("Event polling interval must be positive, using default");
            self.polling_interval = Self::default().polling_interval;
        } else {
            self.polling_interval = interval;
        }
        self
    }

    /// Ignore the consumer's initial current-state snapshot and wait for a transition
    pub fn without_current_state(mut self, without: bool) -> Self {
        self.without_current_state = without;
        self
    }

    pub fn get_start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }
}

/// Find the first event at or after `start_time` accepted by `filter`
pub(crate) fn first_match(
    mut events: Vec<CloudEvent>,
    start_time: DateTime<Utc>,
    filter: &EventFilter,
) -> Option<CloudEvent> {
    events.sort_by_key(|event| event.time);
    events
        .into_iter()
        .find(|event| event.time >= start_time && filter.matches(event))
}

#[derive(Clone)]
pub struct EventConsumer {
    source: Arc<dyn EventSource>,
    metrics: HarnessMetrics,
}

impl EventConsumer {
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        Self {
            source,
            metrics: HarnessMetrics::new(),
        }
    }

    /// Wait for an event on `node`'s consumer matching `filter`
    pub async fn wait_for_event(
        &self,
        node: &str,
        filter: &EventFilter,
        options: &EventWaitOptions,
    ) -> Result<CloudEvent> {
        let filter = if options.without_current_state {
            filter.clone().and(EventFilter::WithoutCurrentState(true))
        } else {
            filter.clone()
        };
        let filter = &filter;

        let event = poll_until_timeout(
            &format!("event on {}", node),
            options.polling_interval,
            options.timeout,
            true,
            || async move {
                self.metrics.inc_poll_attempts("event");
                match self.source.fetch_events(node).await {
                    Ok(events) => Ok(first_match(events, options.start_time, filter)),
                    Err(e) => {
                        warn!(node = %node, error = %e, "Failed to read event store, retrying");
                        Ok(None)
                    }
                }
            },
        )
        .await
        .map_err(|e: HarnessError| e.context("wait for event", node))?;

        info!(node = %node, event_type = %event.type_, time = %event.time, "Received matching event");
        Ok(event)
    }
}
