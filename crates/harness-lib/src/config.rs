//! Harness configuration
//!
//! Loaded once per run from defaults, an optional file and `TELCO_E2E_*`
//! environment variables, then shared read-only.

use crate::error::{HarnessError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for every configuration key
pub const ENV_PREFIX: &str = "TELCO_E2E";

/// Harness configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HarnessConfig {
    /// Namespace where the PTP operator runs its daemonset
    #[serde(default = "default_ptp_namespace")]
    pub ptp_namespace: String,

    /// Label selector identifying the PTP daemon pods
    #[serde(default = "default_daemon_label_selector")]
    pub daemon_label_selector: String,

    /// Daemon container that runs ptp4l/phc2sys/ts2phc
    #[serde(default = "default_daemon_container")]
    pub daemon_container: String,

    /// Name of the PTP daemonset
    #[serde(default = "default_daemonset_name")]
    pub daemonset_name: String,

    /// Namespace of the cloud-event consumer pods
    #[serde(default = "default_event_consumer_namespace")]
    pub event_consumer_namespace: String,

    /// Label selector for the cloud-event consumer sidecar pods
    #[serde(default = "default_event_consumer_label_selector")]
    pub event_consumer_label_selector: String,

    /// Container holding the consumer's event store
    #[serde(default = "default_event_consumer_container")]
    pub event_consumer_container: String,

    /// Path of the newline-delimited JSON event store inside the consumer
    #[serde(default = "default_event_store_path")]
    pub event_store_path: String,

    /// Namespace of the SR-IOV operator
    #[serde(default = "default_sriov_namespace")]
    pub sriov_namespace: String,

    /// Worker node label, `key` or `key=value`; canonicalised at load
    #[serde(default = "default_worker_label")]
    pub worker_label: String,

    /// Thanos querier route (e.g. `https://thanos-querier-openshift-monitoring.apps.example.com`)
    #[serde(default)]
    pub prometheus_url: Option<String>,

    /// Namespace where the Prometheus reader service account is created
    #[serde(default = "default_prometheus_sa_namespace")]
    pub prometheus_sa_namespace: String,

    /// Skip TLS verification against the querier route (self-signed ingress certs)
    #[serde(default = "default_true")]
    pub prometheus_insecure_skip_verify: bool,

    /// Length of the long-window stability collection
    #[serde(default = "default_stability_duration_secs")]
    pub stability_duration_secs: u64,

    /// Absolute offset threshold for servo-locked samples
    #[serde(default = "default_offset_threshold_ns")]
    pub offset_threshold_ns: i64,

    /// How long the holdover deviation monitor samples
    #[serde(default = "default_holdover_duration_secs")]
    pub holdover_duration_secs: u64,

    /// Maximum allowed PHC drift during holdover
    #[serde(default = "default_holdover_threshold_ns")]
    pub holdover_threshold_ns: i64,

    /// Image providing `/usr/bin/gather`
    #[serde(default = "default_must_gather_image")]
    pub must_gather_image: String,

    /// Root directory for failure artefacts
    #[serde(default = "default_dump_dir")]
    pub dump_dir: PathBuf,

    /// Image used for host-namespace debug pods
    #[serde(default = "default_debug_pod_image")]
    pub debug_pod_image: String,

    /// Image for SR-IOV client/server pods; needs `ip` and `ping`
    #[serde(default = "default_sriov_test_image")]
    pub sriov_test_image: String,

    /// Namespace SR-IOV test pods and networks are placed in
    #[serde(default = "default_sriov_test_namespace")]
    pub sriov_test_namespace: String,
}

fn default_ptp_namespace() -> String {
    "openshift-ptp".to_string()
}

fn default_daemon_label_selector() -> String {
    "app=linuxptp-daemon".to_string()
}

fn default_daemon_container() -> String {
    "linuxptp-daemon-container".to_string()
}

fn default_daemonset_name() -> String {
    "linuxptp-daemon".to_string()
}

fn default_event_consumer_namespace() -> String {
    "cloud-events".to_string()
}

fn default_event_consumer_label_selector() -> String {
    "app=cloud-event-consumer".to_string()
}

fn default_event_consumer_container() -> String {
    "cloud-event-consumer".to_string()
}

fn default_event_store_path() -> String {
    "/tmp/ptp-events.jsonl".to_string()
}

fn default_sriov_namespace() -> String {
    "openshift-sriov-network-operator".to_string()
}

fn default_worker_label() -> String {
    "node-role.kubernetes.io/worker".to_string()
}

fn default_prometheus_sa_namespace() -> String {
    "openshift-monitoring".to_string()
}

fn default_true() -> bool {
    true
}

fn default_stability_duration_secs() -> u64 {
    300
}

fn default_offset_threshold_ns() -> i64 {
    100
}

fn default_holdover_duration_secs() -> u64 {
    60
}

fn default_holdover_threshold_ns() -> i64 {
    1500
}

fn default_must_gather_image() -> String {
    "quay.io/openshift/origin-must-gather:latest".to_string()
}

fn default_dump_dir() -> PathBuf {
    PathBuf::from("/tmp/reports")
}

fn default_debug_pod_image() -> String {
    "registry.access.redhat.com/ubi9/ubi:latest".to_string()
}

fn default_sriov_test_image() -> String {
    "quay.io/openshift-kni/cnf-tests:4.16".to_string()
}

fn default_sriov_test_namespace() -> String {
    "sriov-e2e".to_string()
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            ptp_namespace: default_ptp_namespace(),
            daemon_label_selector: default_daemon_label_selector(),
            daemon_container: default_daemon_container(),
            daemonset_name: default_daemonset_name(),
            event_consumer_namespace: default_event_consumer_namespace(),
            event_consumer_label_selector: default_event_consumer_label_selector(),
            event_consumer_container: default_event_consumer_container(),
            event_store_path: default_event_store_path(),
            sriov_namespace: default_sriov_namespace(),
            worker_label: canonical_worker_label(&default_worker_label()),
            prometheus_url: None,
            prometheus_sa_namespace: default_prometheus_sa_namespace(),
            prometheus_insecure_skip_verify: true,
            stability_duration_secs: default_stability_duration_secs(),
            offset_threshold_ns: default_offset_threshold_ns(),
            holdover_duration_secs: default_holdover_duration_secs(),
            holdover_threshold_ns: default_holdover_threshold_ns(),
            must_gather_image: default_must_gather_image(),
            dump_dir: default_dump_dir(),
            debug_pod_image: default_debug_pod_image(),
            sriov_test_image: default_sriov_test_image(),
            sriov_test_namespace: default_sriov_test_namespace(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?;

        let mut config: HarnessConfig = settings.try_deserialize()?;
        config.normalize()?;
        Ok(config)
    }

    /// Canonicalise derived fields and reject values that cannot work
    fn normalize(&mut self) -> Result<()> {
        if self.worker_label.trim().is_empty() {
            return Err(HarnessError::Precondition(
                "worker label must not be empty".to_string(),
            ));
        }
        self.worker_label = canonical_worker_label(&self.worker_label);

        if self.offset_threshold_ns <= 0 {
            tracing::warn!(
                value = self.offset_threshold_ns,
                "Non-positive offset threshold, using default"
            );
            self.offset_threshold_ns = default_offset_threshold_ns();
        }

        Ok(())
    }

    pub fn stability_duration(&self) -> Duration {
        Duration::from_secs(self.stability_duration_secs)
    }

    pub fn holdover_duration(&self) -> Duration {
        Duration::from_secs(self.holdover_duration_secs)
    }

    /// Worker label key without any value part
    pub fn worker_label_key(&self) -> &str {
        self.worker_label
            .split_once('=')
            .map(|(key, _)| key)
            .unwrap_or(&self.worker_label)
    }

    /// MachineConfigPool that owns the worker nodes
    pub fn worker_pool_name(&self) -> &str {
        let key = self.worker_label_key();
        key.rsplit('/').next().unwrap_or(key)
    }
}

/// Turn `key` into `key=` so it can be used directly as a label selector value match
pub fn canonical_worker_label(label: &str) -> String {
    let label = label.trim();
    if label.contains('=') {
        label.to_string()
    } else {
        format!("{}=", label)
    }
}

/// Label selector form of a canonical worker label
///
/// `key=` selects on key existence, `key=value` on equality.
pub fn worker_label_selector(canonical: &str) -> String {
    match canonical.split_once('=') {
        Some((key, "")) => key.to_string(),
        _ => canonical.to_string(),
    }
}
