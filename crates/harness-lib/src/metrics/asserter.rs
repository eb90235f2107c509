//! Polling asserter over instant metric queries
//!
//! A poll succeeds when the result set is non-empty and every sample equals
//! the expected value. The assertion passes once polls have succeeded
//! continuously for `stable_for`; any other poll resets the window. Query
//! errors count as "no data" for that poll.

use super::prometheus::{MetricSample, MetricsApi};
use super::query::MetricQuery;
use super::values::MetricValue;
use crate::error::{HarnessError, Result};
use crate::observability::{HarnessMetrics, StructuredLogger};
use crate::poll::poll_until_timeout;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Options for [`MetricAsserter::assert_query`]
#[derive(Debug, Clone)]
pub struct AssertOptions {
    start_time: DateTime<Utc>,
    timeout: Duration,
    stable_for: Duration,
    polling_interval: Duration,
}

impl Default for AssertOptions {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            timeout: Duration::from_secs(5 * 60),
            stable_for: Duration::ZERO,
            polling_interval: Duration::from_secs(5),
        }
    }
}

impl AssertOptions {
    /// Lower bound shared with event waits; instant queries always evaluate at "now"
    pub fn start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            warn!("Assertion timeout must be positive, using default");
            self.timeout = Self::default().timeout;
        } else {
            self.timeout = timeout;
        }
        self
    }

    /// Zero means the first successful poll passes
    pub fn stable_for(mut self, stable_for: Duration) -> Self {
        self.stable_for = stable_for;
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        if interval.is_zero() {
            warn!("Assertion polling interval must be positive, using default");
            self.polling_interval = Self::default().polling_interval;
        } else {
            self.polling_interval = interval;
        }
        self
    }

    pub fn get_start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn get_polling_interval(&self) -> Duration {
        self.polling_interval
    }
}

/// What one poll saw
#[derive(Debug, Clone, PartialEq)]
enum Observation {
    NoData,
    QueryFailed(String),
    Matched(usize),
    Mismatched(Vec<String>),
}

impl std::fmt::Display for Observation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Observation::NoData => write!(f, "empty result set"),
            Observation::QueryFailed(e) => write!(f, "query failed: {}", e),
            Observation::Matched(n) => write!(f, "{} matching samples", n),
            Observation::Mismatched(values) => write!(f, "unexpected samples: {}", values.join(", ")),
        }
    }
}

fn observe<V: MetricValue>(samples: &[MetricSample], expected: V) -> Observation {
    if samples.is_empty() {
        return Observation::NoData;
    }
    let mismatched: Vec<String> = samples
        .iter()
        .filter(|sample| V::from_sample(sample.value) != Some(expected))
        .map(|sample| format!("{}={}", describe_labels(sample), sample.value))
        .collect();
    if mismatched.is_empty() {
        Observation::Matched(samples.len())
    } else {
        Observation::Mismatched(mismatched)
    }
}

fn describe_labels(sample: &MetricSample) -> String {
    let labels: Vec<String> = sample.labels.iter().filter(|(k, _)| *k != "__name__").map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{{{}}}", labels.join(","))
}

struct Window {
    stable_since: Option<Instant>,
    last: Observation,
}

#[derive(Clone)]
pub struct MetricAsserter {
    api: Arc<dyn MetricsApi>,
    metrics: HarnessMetrics,
    logger: StructuredLogger,
}

impl MetricAsserter {
    pub fn new(api: Arc<dyn MetricsApi>, logger: StructuredLogger) -> Self {
        Self {
            api,
            metrics: HarnessMetrics::new(),
            logger,
        }
    }

    /// Wait until `query` evaluates to `expected` continuously for `stable_for`
    pub async fn assert_query<V: MetricValue>(
        &self,
        query: &MetricQuery<V>,
        expected: V,
        options: &AssertOptions,
    ) -> Result<()> {
        let promql = query.promql();
        let kind = query.metric();
        let expected_text = format!("{:?}", expected);
        let started = Instant::now();
        let window = Mutex::new(Window {
            stable_since: None,
            last: Observation::NoData,
        });

        self.logger.log_assertion_started(kind, &promql, &expected_text);

        let result = poll_until_timeout(
            &format!("{} == {:?}", promql, expected),
            options.polling_interval,
            options.timeout,
            true,
            || {
                let window = &window;
                let promql = &promql;
                async move {
                    self.metrics.inc_poll_attempts(kind);
                    let observation = match self.api.instant_query(promql).await {
                        Ok(samples) => observe(&samples, expected),
                        Err(e) => Observation::QueryFailed(e.to_string()),
                    };
                    debug!(query = %promql, observation = %observation, "Metric poll");

                    let now = Instant::now();
                    let mut window = window.lock().unwrap_or_else(|e| e.into_inner());
                    let done = match observation {
                        Observation::Matched(_) => {
                            let since = *window.stable_since.get_or_insert(now);
                            now.duration_since(since) >= options.stable_for
                        }
                        _ => {
                            window.stable_since = None;
                            false
                        }
                    };
                    window.last = observation;
                    Ok(done.then_some(()))
                }
            },
        )
        .await;

        let elapsed = started.elapsed().as_secs_f64();
        match result {
            Ok(()) => {
                self.metrics.observe_assertion(kind, elapsed, true);
                self.logger.log_assertion_passed(kind, &promql, elapsed);
                Ok(())
            }
            Err(e) => {
                self.metrics.observe_assertion(kind, elapsed, false);
                let last = window.into_inner().unwrap_or_else(|e| e.into_inner()).last;
                let e = match e {
                    HarnessError::Timeout {
                        operation, elapsed, ..
                    } => HarnessError::Timeout {
                        operation,
                        elapsed,
                        last_observation: Some(last.to_string()),
                    },
                    other => other,
                };
                self.logger.log_assertion_failed(kind, &promql, &e.to_string());
                Err(e)
            }
        }
    }
}
