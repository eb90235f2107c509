//! PTP perturbation drivers
//!
//! Each driver applies one disturbance to a node and waits for the clock to
//! report the expected states through metrics and, when enabled, events.
//!
//! This module provides:
//! - Daemon pod restart recovery and daemonset readiness
//! - PHC offset injection, interface flaps and GNSS loss injection
//! - Holdover drift monitoring and leap file updates

mod daemonset;
mod flap;
mod gnss;
mod holdover;
mod leap;
mod offset;

pub use daemonset::{daemonset_ready, delete_daemon_pod, wait_for_daemonset_ready};
pub use flap::{
    default_route_device, egress_interfaces, flappable_nics, group_by_nic, link_down_command,
    link_up_command, nic_name, EGRESS_BRIDGE,
};
pub use gnss::{
    chrony_sources_offline, profile_protocol_version, ubx_protocol_version, ubxtool_command,
    GNSS_LOSS_THRESHOLD, GNSS_RESTORE_THRESHOLD,
};
pub use holdover::{monitor_holdover, parse_phc_cmp, phc_device, HoldoverReport, MAX_CONSECUTIVE_FAILURES};
pub use offset::{phc_adjust_command, step_phc, with_restore};
pub use leap::{
    configmap_mentions, is_announcement, last_announcement, leap_date, remove_last_announcement,
    LEAP_CONFIGMAP,
};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::events::{event_types, EventConsumer, EventFilter, EventWaitOptions, SyncState};
use crate::exec::{ExecOptions, NodeExecutor, PodBackend, PodQuery};
use crate::logs::LogTailer;
use crate::metrics::{AssertOptions, ClockState, ClockStateQuery, EventPublisherStatus, JointAsserter, MetricAsserter, PtpProcess};
use crate::nicinfo::{NicRegistry, NicReporter};
use crate::observability::StructuredLogger;
use crate::poll::poll_until_timeout;
use crate::ptp::{wait_for_profile_load, ProfileMutator, ProfileReference};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DAEMONSET_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const STATE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const LOCKED_STABLE_FOR: Duration = Duration::from_secs(10);
const PROFILE_LOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const LEAP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Result of a leap file update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeapOutcome {
    pub removed: String,
    pub date: String,
    pub last_announcement: Option<String>,
}

/// Everything the perturbation drivers need from the runtime
#[derive(Clone)]
pub struct PtpDrivers {
    client: Client,
    config: Arc<HarnessConfig>,
    backend: Arc<dyn PodBackend>,
    executor: NodeExecutor,
    nics: NicReporter,
    registry: NicRegistry,
    joint: JointAsserter,
    publisher: Arc<dyn EventPublisherStatus>,
    mutator: ProfileMutator,
    tailer: LogTailer,
    logger: StructuredLogger,
}

impl PtpDrivers {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        config: Arc<HarnessConfig>,
        backend: Arc<dyn PodBackend>,
        joint: JointAsserter,
        publisher: Arc<dyn EventPublisherStatus>,
        mutator: ProfileMutator,
        registry: NicRegistry,
        logger: StructuredLogger,
    ) -> Self {
        let daemon = daemon_query(&config);
        let executor = NodeExecutor::new(backend.clone(), daemon.clone());
        Self {
            nics: NicReporter::new(executor.clone()),
            tailer: LogTailer::new(backend.clone(), daemon),
            client,
            config,
            backend,
            executor,
            registry,
            joint,
            publisher,
            mutator,
            logger,
        }
    }

    pub fn executor(&self) -> &NodeExecutor {
        &self.executor
    }

    fn metrics(&self) -> &MetricAsserter {
        self.joint.metrics()
    }

    fn events(&self) -> &EventConsumer {
        self.joint.events()
    }

    async fn assert_clock_state(
        &self,
        node: &str,
        state: ClockState,
        since: DateTime<Utc>,
        stable_for: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let query = ClockStateQuery::clock_state().node(node);
        let options = AssertOptions::default()
            .start_time(since)
            .stable_for(stable_for)
            .timeout(timeout);
        self.metrics().assert_query(&query, state, &options).await
    }

    async fn wait_for_event(&self, node: &str, filter: &EventFilter, since: DateTime<Utc>) -> Result<()> {
        let options = EventWaitOptions::default()
            .start_time(since)
            .timeout(STATE_TIMEOUT)
            .without_current_state(true);
        self.events().wait_for_event(node, filter, &options).await.map(|_| ())
    }

    async fn exec(&self, node: &str, command: &str) -> Result<String> {
        self.executor.exec(node, command, &ExecOptions::default()).await
    }

    /// Delete the daemon pod on `node` and wait for the clock to lock again
    pub async fn pod_restart_recovery(&self, node: &str) -> Result<()> {
        let since = Utc::now();
        self.logger.log_perturbation(node, "delete PTP daemon pod");
        delete_daemon_pod(&self.client, self.backend.as_ref(), self.executor.daemon_query(), node).await?;
        wait_for_daemonset_ready(
            &self.client,
            &self.config.ptp_namespace,
            &self.config.daemonset_name,
            DAEMONSET_TIMEOUT,
        )
        .await?;

        let query = ClockStateQuery::clock_state().node(node);
        let options = AssertOptions::default()
            .start_time(since)
            .stable_for(LOCKED_STABLE_FOR)
            .timeout(RECOVERY_TIMEOUT);
        let filter = EventFilter::state_change(event_types::PTP_STATE_CHANGE, SyncState::Locked);
        self.joint
            .assert_event_and_metric(node, &query, ClockState::Locked, &filter, &options)
            .await
            .map_err(|e| e.context("pod restart recovery", node))
    }

    /// Step the PHC of `interface` by `seconds`, expect FREERUN, step back, expect LOCKED
    pub async fn offset_perturbation(&self, node: &str, interface: &str, seconds: f64) -> Result<()> {
        let phc = self.nics.ptp_hardware_clock(node, interface).await?;
        self.registry.mark(node, interface);
        let device = phc_device(phc);

        let since = Utc::now();
        self.logger
            .log_perturbation(node, &phc_adjust_command(&device, seconds));
        step_phc(&self.executor, node, &device, seconds, || {
            self.assert_clock_state(node, ClockState::Freerun, since, Duration::ZERO, STATE_TIMEOUT)
        })
        .await
        .map_err(|e| e.context("offset perturbation", node))?;

        self.assert_clock_state(node, ClockState::Locked, since, LOCKED_STABLE_FOR, RECOVERY_TIMEOUT)
            .await
    }

    /// Interfaces that must stay up because they carry the node's traffic
    pub async fn egress_interfaces(&self, node: &str) -> Result<std::collections::BTreeSet<String>> {
        let route = self.exec(node, "ip route show default").await?;
        let ports = if default_route_device(&route) == Some(EGRESS_BRIDGE) {
            self.exec(node, &format!("ovs-vsctl list-ports {}", EGRESS_BRIDGE)).await?
        } else {
            String::new()
        };
        Ok(egress_interfaces(&route, &ports))
    }

    /// Take every NIC of `interfaces` down and up again, one NIC at a time
    ///
    /// NICs that own the egress interface are left alone. Returns the NICs flapped.
    pub async fn interface_flap(&self, node: &str, interfaces: &[String]) -> Result<Vec<String>> {
        let egress = self.egress_interfaces(node).await?;
        let nics = flappable_nics(group_by_nic(interfaces), &egress);
        if nics.is_empty() {
            return Err(HarnessError::Skip(format!(
                "every PTP NIC on {} carries egress traffic",
                node
            )));
        }

        for (nic, members) in &nics {
            self.registry.mark_all(node, members);
            let since = Utc::now();
            self.logger.log_perturbation(node, &format!("link down {}", nic));

            let mut result = self.links(node, members, link_down_command).await;
            if result.is_ok() {
                result = self
                    .assert_clock_state(node, ClockState::Holdover, since, Duration::ZERO, STATE_TIMEOUT)
                    .await;
            }
            if result.is_ok() {
                result = self
                    .assert_clock_state(node, ClockState::Freerun, since, Duration::ZERO, STATE_TIMEOUT)
                    .await;
            }

            let up_since = Utc::now();
            self.links(node, members, link_up_command).await?;
            self.logger.log_perturbation(node, &format!("link up {}", nic));
            result.map_err(|e| e.context("interface flap", nic.as_str()))?;

            self.assert_clock_state(node, ClockState::Locked, up_since, LOCKED_STABLE_FOR, RECOVERY_TIMEOUT)
                .await?;
        }
        Ok(nics.into_keys().collect())
    }

    async fn links(&self, node: &str, members: &[String], command: fn(&str) -> String) -> Result<()> {
        for member in members {
            crate::nicinfo::validate_interface_name(member)?;
            self.exec(node, &command(member)).await?;
        }
        Ok(())
    }

    /// Set the GNSS receiver's satellite threshold through `ubxtool`
    pub async fn set_gnss_threshold(&self, node: &str, protocol: &str, threshold: u32) -> Result<()> {
        self.logger
            .log_perturbation(node, &format!("ubxtool INFIL_NCNOTHRS={}", threshold));
        let options = ExecOptions::default().attempts(3).retry_on_error(true);
        self.executor
            .exec(node, &ubxtool_command(protocol, threshold), &options)
            .await
            .map(|_| ())
    }

    async fn chrony_offline(&self, node: &str) -> Result<bool> {
        Ok(chrony_sources_offline(&self.exec(node, "chronyc activity").await?))
    }

    async fn process_running(&self, node: &str, process: PtpProcess) -> Result<bool> {
        let output = self
            .exec(node, &format!("pgrep -x {} || true", process.as_str()))
            .await?;
        Ok(!output.trim().is_empty())
    }

    /// GNSS loss on an NTP-fallback GM: chronyd takes over, then hands back
    pub async fn gnss_ntp_fallback(&self, node: &str, reference: &ProfileReference, holdover_secs: u64) -> Result<()> {
        if !self.publisher.events_enabled().await? {
            return Err(HarnessError::Skip("PTP events are disabled".to_string()));
        }

        let since = Utc::now();
        let saved = self.mutator.update_ts2phc_holdover(reference, holdover_secs).await?;
        let nodes = [node.to_string()];
        let restore = async {
            self.mutator
                .restore_profile_and_wait(reference, &saved, &self.tailer, &nodes, PROFILE_LOAD_TIMEOUT)
                .await
                .map_err(|e| {
                    warn!(node = %node, error = %e, "Failed to restore NTP fallback profile");
                    e.context("restore NTP fallback profile", &reference.profile_name)
                })
        };
        with_restore(self.gnss_fallback_steps(node, &saved, since), restore)
            .await
            .map_err(|e| e.context("GNSS fallback", node))
    }

    async fn gnss_fallback_steps(&self, node: &str, profile: &crate::crds::PtpProfile, since: DateTime<Utc>) -> Result<()> {
        let protocol = profile_protocol_version(profile)?;
        wait_for_profile_load(&self.tailer, &[node.to_string()], since, PROFILE_LOAD_TIMEOUT).await?;

        let ts2phc = ClockStateQuery::clock_state().node(node).process(PtpProcess::Ts2phc);
        let options = AssertOptions::default().start_time(since).timeout(RECOVERY_TIMEOUT);
        self.metrics().assert_query(&ts2phc, ClockState::Locked, &options).await?;
        check_flag(node, "chrony sources offline", self.chrony_offline(node).await?, true)?;

        let os_locked = EventFilter::state_change(event_types::OS_CLOCK_SYNC_STATE_CHANGE, SyncState::Locked);

        let lost_at = Utc::now();
        self.set_gnss_threshold(node, protocol, GNSS_LOSS_THRESHOLD).await?;
        let fallback = async {
            self.wait_for_event(node, &os_locked, lost_at).await?;
            check_flag(node, "phc2sys running", self.process_running(node, PtpProcess::Phc2sys).await?, false)?;
            check_flag(node, "chrony sources offline", self.chrony_offline(node).await?, false)
        }
        .await;

        let restored_at = Utc::now();
        self.set_gnss_threshold(node, protocol, GNSS_RESTORE_THRESHOLD).await?;
        fallback?;

        self.wait_for_event(node, &os_locked, restored_at).await?;
        check_flag(node, "phc2sys running", self.process_running(node, PtpProcess::Phc2sys).await?, true)?;
        check_flag(node, "chrony sources offline", self.chrony_offline(node).await?, true)
    }

    /// Watch PHC drift on `interface` for the configured holdover window
    pub async fn holdover_deviation(&self, node: &str, interface: &str) -> Result<HoldoverReport> {
        let phc = self.nics.ptp_hardware_clock(node, interface).await?;
        self.registry.mark(node, interface);
        let report = monitor_holdover(
            &self.executor,
            node,
            phc,
            self.config.holdover_duration(),
            self.config.holdover_threshold_ns,
        )
        .await?;
        info!(
            node = %node,
            samples = report.samples,
            max_abs_delta_ns = report.max_abs_delta_ns,
            "Holdover drift within threshold"
        );
        Ok(report)
    }

    /// Remove the newest leap announcement for `node` and wait for the daemon to rewrite the file
    pub async fn leap_file_mutation(&self, node: &str) -> Result<LeapOutcome> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.config.ptp_namespace);
        let mut configmap = api.get_opt(LEAP_CONFIGMAP).await?.ok_or_else(|| {
            HarnessError::Precondition(format!("ConfigMap {} not found", LEAP_CONFIGMAP))
        })?;

        let data = configmap.data.get_or_insert_with(Default::default);
        let content = data
            .get(node)
            .ok_or_else(|| HarnessError::Precondition(format!("no leap file for {}", node)))?;
        let (updated, removed) = remove_last_announcement(content).ok_or_else(|| {
            HarnessError::Precondition(format!("leap file for {} has no announcement", node))
        })?;
        data.insert(node.to_string(), updated);

        api.replace(LEAP_CONFIGMAP, &PostParams::default(), &configmap).await?;
        self.logger.log_perturbation(node, &format!("removed leap line {:?}", removed));
        delete_daemon_pod(&self.client, self.backend.as_ref(), self.executor.daemon_query(), node).await?;

        let date = leap_date(Utc::now());
        let last = poll_until_timeout("leap file rewrite", Duration::from_secs(10), LEAP_TIMEOUT, true, || {
            let api = api.clone();
            let (date, removed) = (&date, &removed);
            async move {
                let Some(configmap) = api.get_opt(LEAP_CONFIGMAP).await? else {
                    return Ok(None);
                };
                if !configmap_mentions(&configmap, date) {
                    return Ok(None);
                }
                let last = configmap
                    .data
                    .as_ref()
                    .and_then(|d| d.get(node))
                    .and_then(|content| last_announcement(content))
                    .map(str::to_string);
                Ok((last.as_deref() != Some(removed.as_str())).then_some(last))
            }
        })
        .await?;

        Ok(LeapOutcome {
            removed,
            date,
            last_announcement: last,
        })
    }
}

fn check_flag(node: &str, what: &str, actual: bool, expected: bool) -> Result<()> {
    if actual == expected {
        return Ok(());
    }
    Err(HarnessError::Contract(format!(
        "{} on {}: expected {}, found {}",
        what, node, expected, actual
    )))
}

/// Where the PTP daemon container runs
pub fn daemon_query(config: &HarnessConfig) -> PodQuery {
    PodQuery::new(&config.ptp_namespace, &config.daemon_label_selector).with_container(&config.daemon_container)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_flag() {
        assert!(check_flag("n0", "phc2sys running", true, true).is_ok());
        let err = check_flag("n0", "phc2sys running", true, false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "contract violation: phc2sys running on n0: expected false, found true"
        );
    }

    #[test]
    fn test_daemon_query_targets_daemon_container() {
        let query = daemon_query(&HarnessConfig::default());
        assert_eq!(query.namespace, "openshift-ptp");
        assert_eq!(query.label_selector, "app=linuxptp-daemon");
        assert_eq!(query.container.as_deref(), Some("linuxptp-daemon-container"));
    }
}
