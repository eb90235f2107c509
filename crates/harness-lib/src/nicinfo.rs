//! Registry of interfaces touched by checks, and the NIC report built from it
//!
//! The registry is shared by every check of a run. Checks mark the interfaces
//! they exercised; on failure the report records driver, firmware and PHC
//! index for each of them.

use crate::error::{HarnessError, Result};
use crate::exec::{ExecOptions, NodeExecutor};
use dashmap::{DashMap, DashSet};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

const ETHTOOL_ATTEMPTS: u32 = 3;
const ETHTOOL_RETRY_DELAY: Duration = Duration::from_secs(20);

/// Node → interfaces marked as tested
#[derive(Debug, Default, Clone)]
pub struct NicRegistry {
    inner: Arc<DashMap<String, DashSet<String>>>,
}

impl NicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry
    pub fn global() -> &'static NicRegistry {
        static GLOBAL: OnceLock<NicRegistry> = OnceLock::new();
        GLOBAL.get_or_init(NicRegistry::new)
    }

    pub fn mark(&self, node: &str, interface: &str) {
        self.inner
            .entry(node.to_string())
            .or_default()
            .insert(interface.to_string());
    }

    /// Mark every interface yielded by `interfaces`; nothing is allocated for an empty sequence
    pub fn mark_all<I, S>(&self, node: &str, interfaces: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut interfaces = interfaces.into_iter().peekable();
        if interfaces.peek().is_none() {
            return;
        }
        let entry = self.inner.entry(node.to_string()).or_default();
        for interface in interfaces {
            entry.insert(interface.as_ref().to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.iter().all(|entry| entry.value().is_empty())
    }

    /// Sorted copy of the registry
    pub fn snapshot(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.inner
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| {
                let interfaces = entry.value().iter().map(|i| i.key().clone()).collect();
                (entry.key().clone(), interfaces)
            })
            .collect()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceReport {
    pub name: String,
    pub driver: String,
    pub version: String,
    pub firmware_version: String,
    pub ptp_hardware_clock: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeNicReport {
    pub node_name: String,
    pub interfaces: Vec<InterfaceReport>,
}

/// `driver`, `version` and `firmware-version` from `ethtool -i`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    pub driver: String,
    pub version: String,
    pub firmware_version: String,
}

fn driver_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^driver:[ \t]*(\S.*?)[ \t]*$").expect("driver regex is valid"))
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^version:[ \t]*(\S.*?)[ \t]*$").expect("version regex is valid"))
}

fn firmware_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^firmware-version:[ \t]*(\S.*?)[ \t]*$").expect("firmware regex is valid")
    })
}

fn phc_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*PTP Hardware Clock:\s*(\d+)\s*$").expect("phc regex is valid"))
}

fn interface_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.@-]{1,15}$").expect("interface regex is valid"))
}

fn capture(re: &Regex, output: &str, field: &str, interface: &str) -> Result<String> {
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| HarnessError::Contract(format!("no {} in ethtool output for {}", field, interface)))
}

pub fn parse_driver_info(output: &str, interface: &str) -> Result<DriverInfo> {
    Ok(DriverInfo {
        driver: capture(driver_regex(), output, "driver", interface)?,
        version: capture(version_regex(), output, "version", interface)?,
        firmware_version: capture(firmware_regex(), output, "firmware-version", interface)?,
    })
}

/// PHC index from `ethtool -T`; `/dev/ptp<N>` is the device
pub fn parse_ptp_hardware_clock(output: &str, interface: &str) -> Result<u32> {
    capture(phc_regex(), output, "PTP Hardware Clock", interface)?
        .parse()
        .map_err(|e| HarnessError::Contract(format!("bad PTP Hardware Clock for {}: {}", interface, e)))
}

/// Reject names that are not plain interface names before they reach a shell
pub fn validate_interface_name(interface: &str) -> Result<()> {
    if interface_name_regex().is_match(interface) {
        Ok(())
    } else {
        Err(HarnessError::InvalidArgument(format!("invalid interface name {:?}", interface)))
    }
}

/// Reads NIC details through the PTP daemon pods
#[derive(Clone)]
pub struct NicReporter {
    executor: NodeExecutor,
    options: ExecOptions,
}

impl NicReporter {
    pub fn new(executor: NodeExecutor) -> Self {
        Self {
            executor,
            options: ExecOptions::default()
                .attempts(ETHTOOL_ATTEMPTS)
                .retry_on_error(true)
                .retry_on_empty(true)
                .retry_delay(ETHTOOL_RETRY_DELAY),
        }
    }

    pub async fn ptp_hardware_clock(&self, node: &str, interface: &str) -> Result<u32> {
        validate_interface_name(interface)?;
        let output = self
            .executor
            .exec(node, &format!("ethtool -T {}", interface), &self.options)
            .await?;
        parse_ptp_hardware_clock(&output, interface)
    }

    pub async fn interface_report(&self, node: &str, interface: &str) -> Result<InterfaceReport> {
        validate_interface_name(interface)?;
        let info = self
            .executor
            .exec(node, &format!("ethtool -i {}", interface), &self.options)
            .await?;
        let info = parse_driver_info(&info, interface)?;
        let ptp_hardware_clock = self.ptp_hardware_clock(node, interface).await?;
        debug!(node = %node, interface = %interface, driver = %info.driver, "Collected NIC info");

        Ok(InterfaceReport {
            name: interface.to_string(),
            driver: info.driver,
            version: info.version,
            firmware_version: info.firmware_version,
            ptp_hardware_clock,
        })
    }

    /// Report every interface in `registry`, nodes and interfaces sorted by name
    pub async fn collect(&self, registry: &NicRegistry) -> Result<Vec<NodeNicReport>> {
        let mut reports = Vec::new();
        for (node, interfaces) in registry.snapshot() {
            let mut node_report = NodeNicReport {
                node_name: node.clone(),
                interfaces: Vec::with_capacity(interfaces.len()),
            };
            for interface in &interfaces {
                let report = self
                    .interface_report(&node, interface)
                    .await
                    .map_err(|e| e.context("NIC report", format!("{}/{}", node, interface)))?;
                node_report.interfaces.push(report);
            }
            reports.push(node_report);
        }
        Ok(reports)
    }
}

/// Write `reports` as pretty JSON, creating parent directories
pub fn write_report(path: &Path, reports: &[NodeNicReport]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(reports)?)?;
    info!(path = %path.display(), nodes = reports.len(), "Wrote NIC report");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock::MockPodBackend;
    use crate::exec::PodQuery;

    const ETHTOOL_I: &str = "driver: ice\nversion: 5.14.0-427.el9.x86_64\nfirmware-version: 4.40 0x8001c967 1.3534.0\nexpansion-rom-version: \nbus-info: 0000:51:00.0\nsupports-statistics: yes\n";
    const ETHTOOL_T: &str = "Time stamping parameters for ens1f0:\nCapabilities:\n\thardware-transmit\nPTP Hardware Clock: 1\nHardware Transmit Timestamp Modes:\n\toff\n";

    fn reporter(backend: MockPodBackend) -> NicReporter {
        let query = PodQuery::new("openshift-ptp", "app=linuxptp-daemon");
        NicReporter::new(NodeExecutor::new(Arc::new(backend), query))
    }

    #[test]
    fn test_registry_marks_and_snapshots() {
        let registry = NicRegistry::new();
        registry.mark("n1", "ens1f1");
        registry.mark("n1", "ens1f0");
        registry.mark("n1", "ens1f0");
        registry.mark_all("n0", ["eno1"]);
        registry.mark_all("n2", Vec::<String>::new());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec!["n0", "n1"]);
        assert_eq!(snapshot["n1"].iter().collect::<Vec<_>>(), vec!["ens1f0", "ens1f1"]);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_clones_share_state() {
        let registry = NicRegistry::new();
        let clone = registry.clone();
        clone.mark("n0", "ens1f0");
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_parse_driver_info() {
        let info = parse_driver_info(ETHTOOL_I, "ens1f0").unwrap();
        assert_eq!(info.driver, "ice");
        assert_eq!(info.version, "5.14.0-427.el9.x86_64");
        assert_eq!(info.firmware_version, "4.40 0x8001c967 1.3534.0");

        let err = parse_driver_info("driver: ice\n", "ens1f0").unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_parse_ptp_hardware_clock() {
        assert_eq!(parse_ptp_hardware_clock(ETHTOOL_T, "ens1f0").unwrap(), 1);
        assert!(parse_ptp_hardware_clock("PTP Hardware Clock: none\n", "ens1f0").is_err());
    }

    #[test]
    fn test_interface_names_are_validated() {
        assert!(validate_interface_name("ens1f0").is_ok());
        assert!(validate_interface_name("ens1f0; reboot").is_err());
        assert!(validate_interface_name("").is_err());
    }

    #[tokio::test]
    async fn test_collect_report() {
        let backend = MockPodBackend::new().on_exec(|_, argv, _| {
            let script = argv.last().cloned().unwrap_or_default();
            if script.starts_with("ethtool -i") {
                MockPodBackend::stdout(ETHTOOL_I)
            } else {
                MockPodBackend::stdout(ETHTOOL_T)
            }
        });
        let registry = NicRegistry::new();
        registry.mark("n0", "ens1f0");

        let reports = reporter(backend).collect(&registry).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].node_name, "n0");
        assert_eq!(reports[0].interfaces[0].ptp_hardware_clock, 1);

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("reports/nic-info.json");
        write_report(&path, &reports).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json[0]["interfaces"][0]["firmware_version"], "4.40 0x8001c967 1.3534.0");
    }
}
