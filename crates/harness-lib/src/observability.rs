//! Observability for harness runs
//!
//! Provides:
//! - Prometheus collectors for the harness itself (assertion latency, poll
//!   attempts, exec retries, log fetch errors, restored profiles)
//! - Structured logging of run milestones with tracing

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for assertion durations (in seconds)
const ASSERTION_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<HarnessMetricsInner> = OnceLock::new();

struct HarnessMetricsInner {
    assertion_duration_seconds: HistogramVec,
    assertion_results: IntCounterVec,
    poll_attempts: IntCounterVec,
    exec_retries: IntCounter,
    log_fetch_errors: IntCounter,
    profiles_restored: IntCounter,
}

impl HarnessMetricsInner {
    fn new() -> Self {
        Self {
            assertion_duration_seconds: register_histogram_vec!(
                "telco_e2e_assertion_duration_seconds",
                "Time spent waiting for an assertion to converge",
                &["kind"],
                ASSERTION_BUCKETS.to_vec()
            )
            .expect("Failed to register assertion_duration_seconds"),

            assertion_results: register_int_counter_vec!(
                "telco_e2e_assertion_results_total",
                "Assertion outcomes by kind and result",
                &["kind", "result"]
            )
            .expect("Failed to register assertion_results"),

            poll_attempts: register_int_counter_vec!(
                "telco_e2e_poll_attempts_total",
                "Number of poll iterations issued by waiting helpers",
                &["kind"]
            )
            .expect("Failed to register poll_attempts"),

            exec_retries: register_int_counter!(
                "telco_e2e_exec_retries_total",
                "Node command attempts beyond the first"
            )
            .expect("Failed to register exec_retries"),

            log_fetch_errors: register_int_counter!(
                "telco_e2e_log_fetch_errors_total",
                "Transient failures fetching container logs"
            )
            .expect("Failed to register log_fetch_errors"),

            profiles_restored: register_int_counter!(
                "telco_e2e_profiles_restored_total",
                "PtpConfig profiles rewritten during restoration"
            )
            .expect("Failed to register profiles_restored"),
        }
    }
}

/// Handle to the process-wide harness metrics
///
/// Clones share the same underlying collectors.
#[derive(Clone)]
pub struct HarnessMetrics {
    _private: (),
}

impl Default for HarnessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessMetrics {
    /// Create a metrics handle (registers collectors on first call)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(HarnessMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &HarnessMetricsInner {
        GLOBAL_METRICS.get_or_init(HarnessMetricsInner::new)
    }

    pub fn observe_assertion(&self, kind: &str, duration_secs: f64, passed: bool) {
        self.inner()
            .assertion_duration_seconds
            .with_label_values(&[kind])
            .observe(duration_secs);
        let result = if passed { "passed" } else { "failed" };
        self.inner()
            .assertion_results
            .with_label_values(&[kind, result])
            .inc();
    }

    pub fn inc_poll_attempts(&self, kind: &str) {
        self.inner().poll_attempts.with_label_values(&[kind]).inc();
    }

    pub fn inc_exec_retries(&self) {
        self.inner().exec_retries.inc();
    }

    pub fn inc_log_fetch_errors(&self) {
        self.inner().log_fetch_errors.inc();
    }

    pub fn add_profiles_restored(&self, count: u64) {
        self.inner().profiles_restored.inc_by(count);
    }

    /// Render every registered collector in the Prometheus text format
    pub fn render_text(&self) -> String {
        let encoder = TextEncoder::new();
        let families = prometheus::gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            warn!(error = %e, "Failed to encode harness metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Structured logger for harness milestones
///
/// Every event carries an `event` field so runs can be filtered and replayed
/// from JSON logs.
#[derive(Clone)]
pub struct StructuredLogger {
    suite: String,
}

impl StructuredLogger {
    pub fn new(suite: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
        }
    }

    pub fn suite(&self) -> &str {
        &self.suite
    }

    pub fn log_assertion_started(&self, kind: &str, target: &str, expected: &str) {
        info!(
            event = "assertion_started",
            suite = %self.suite,
            kind = %kind,
            target = %target,
            expected = %expected,
            "Waiting for assertion"
        );
    }

    pub fn log_assertion_passed(&self, kind: &str, target: &str, elapsed_secs: f64) {
        info!(
            event = "assertion_passed",
            suite = %self.suite,
            kind = %kind,
            target = %target,
            elapsed_secs = elapsed_secs,
            "Assertion converged"
        );
    }

    pub fn log_assertion_failed(&self, kind: &str, target: &str, error: &str) {
        warn!(
            event = "assertion_failed",
            suite = %self.suite,
            kind = %kind,
            target = %target,
            error = %error,
            "Assertion failed"
        );
    }

    pub fn log_perturbation(&self, node: &str, action: &str) {
        info!(
            event = "perturbation_applied",
            suite = %self.suite,
            node = %node,
            action = %action,
            "Perturbation applied"
        );
    }

    pub fn log_profiles_restored(&self, profiles: &[String]) {
        info!(
            event = "profiles_restored",
            suite = %self.suite,
            count = profiles.len(),
            profiles = ?profiles,
            "PtpConfig profiles restored"
        );
    }

    pub fn log_artifact(&self, kind: &str, path: &str) {
        info!(
            event = "artifact_written",
            suite = %self.suite,
            kind = %kind,
            path = %path,
            "Artifact written"
        );
    }

    pub fn log_skip(&self, scenario: &str, reason: &str) {
        warn!(
            event = "scenario_skipped",
            suite = %self.suite,
            scenario = %scenario,
            reason = %reason,
            "Scenario skipped"
        );
    }
}
