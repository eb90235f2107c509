//! Event and metric assertions run side by side
//!
//! Both waits share a start time and a timeout. Neither cancels the other:
//! when one fails the other still runs to completion so both diagnostics
//! are reported.

use super::asserter::{AssertOptions, MetricAsserter};
use super::query::MetricQuery;
use super::values::MetricValue;
use crate::error::{HarnessError, Result};
use crate::events::{EventConsumer, EventFilter, EventWaitOptions};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Tells whether the cluster publishes PTP events at all
#[async_trait]
pub trait EventPublisherStatus: Send + Sync {
    async fn events_enabled(&self) -> Result<bool>;
}

#[derive(Clone)]
pub struct JointAsserter {
    metrics: MetricAsserter,
    events: EventConsumer,
    publisher: Arc<dyn EventPublisherStatus>,
}

impl JointAsserter {
    pub fn new(metrics: MetricAsserter, events: EventConsumer, publisher: Arc<dyn EventPublisherStatus>) -> Self {
        Self {
            metrics,
            events,
            publisher,
        }
    }

    pub fn metrics(&self) -> &MetricAsserter {
        &self.metrics
    }

    pub fn events(&self) -> &EventConsumer {
        &self.events
    }

    /// Assert `query == expected` and, when events are enabled, wait for an
    /// event on `node` matching `filter`
    pub async fn assert_event_and_metric<V: MetricValue>(
        &self,
        node: &str,
        query: &MetricQuery<V>,
        expected: V,
        filter: &EventFilter,
        options: &AssertOptions,
    ) -> Result<()> {
        let events_enabled = self
            .publisher
            .events_enabled()
            .await
            .map_err(|e| e.context("read event publisher setting", "PtpOperatorConfig"))?;

        let metric_wait = self.metrics.assert_query(query, expected, options);

        if !events_enabled {
            info!(node = %node, "PTP events disabled, asserting metrics only");
            return metric_wait.await;
        }

        let event_options = EventWaitOptions::default()
            .start_time(options.get_start_time())
            .timeout(options.get_timeout());
        let event_wait = self.events.wait_for_event(node, filter, &event_options);

        let (metric_result, event_result) = tokio::join!(metric_wait, event_wait);

        let errors: Vec<HarnessError> = [metric_result.err(), event_result.err()]
            .into_iter()
            .flatten()
            .collect();
        HarnessError::join(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_types, CloudEvent, EventData, EventSource, EventValue, SyncState};
    use crate::metrics::{ClockState, ClockStateQuery, MetricSample, MetricsApi};
    use crate::observability::StructuredLogger;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedApi(f64);

    #[async_trait]
    impl MetricsApi for FixedApi {
        async fn instant_query(&self, _promql: &str) -> Result<Vec<MetricSample>> {
            Ok(vec![MetricSample {
                labels: Default::default(),
                value: self.0,
            }])
        }
    }

    struct Publisher(bool);

    #[async_trait]
    impl EventPublisherStatus for Publisher {
        async fn events_enabled(&self) -> Result<bool> {
            Ok(self.0)
        }
    }

    /// Produces a LOCKED event stamped one hour ahead, or nothing
    struct Source {
        deliver: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventSource for Source {
        async fn fetch_events(&self, _node: &str) -> Result<Vec<CloudEvent>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.deliver {
                return Ok(vec![]);
            }
            Ok(vec![CloudEvent {
                id: "1".into(),
                type_: event_types::PTP_STATE_CHANGE.into(),
                source: String::new(),
                time: Utc::now() + chrono::Duration::hours(1),
                data: EventData {
                    version: "1.0".into(),
                    values: vec![EventValue {
                        resource_address: "/cluster/node/n0/ens1f0".into(),
                        data_type: "notification".into(),
                        value_type: "enumeration".into(),
                        value: json!("LOCKED"),
                    }],
                },
                current_state: false,
            }])
        }
    }

    fn joint(metric: f64, enabled: bool, deliver: bool) -> (JointAsserter, Arc<Source>) {
        let source = Arc::new(Source {
            deliver,
            calls: AtomicUsize::new(0),
        });
        let asserter = JointAsserter::new(
            MetricAsserter::new(Arc::new(FixedApi(metric)), StructuredLogger::new("test")),
            EventConsumer::new(source.clone()),
            Arc::new(Publisher(enabled)),
        );
        (asserter, source)
    }

    fn options() -> AssertOptions {
        AssertOptions::default()
            .timeout(Duration::from_secs(10))
            .polling_interval(Duration::from_secs(1))
    }

    fn locked() -> EventFilter {
        EventFilter::state_change(event_types::PTP_STATE_CHANGE, SyncState::Locked)
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_succeed() {
        let (asserter, _) = joint(1.0, true, true);
        asserter
            .assert_event_and_metric("n0", &ClockStateQuery::clock_state(), ClockState::Locked, &locked(), &options())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_events_skip_event_wait() {
        let (asserter, source) = joint(1.0, false, false);
        asserter
            .assert_event_and_metric("n0", &ClockStateQuery::clock_state(), ClockState::Locked, &locked(), &options())
            .await
            .unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_failures_are_joined() {
        let (asserter, source) = joint(0.0, true, false);
        let err = asserter
            .assert_event_and_metric("n0", &ClockStateQuery::clock_state(), ClockState::Locked, &locked(), &options())
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("2 errors occurred"));
        assert!(message.contains("openshift_ptp_clock_state"));
        assert!(message.contains("wait for event"));
        // the event wait ran its full course despite the metric failure
        assert!(source.calls.load(Ordering::SeqCst) >= 5);
    }
}
