//! Scripted perturbation scenarios
//!
//! Each scenario saves the PtpConfigs first and restores them afterwards,
//! whatever the outcome. Interfaces touched along the way are written to a
//! NIC report in the dump directory.

use anyhow::{anyhow, Result};
use clap::ValueEnum;
use harness_lib::nicinfo::{write_report, NicRegistry};
use harness_lib::ptp::{ClockType, NodeInfo, NodeInfoMap, ProfileType};
use harness_lib::{Harness, HarnessError};
use tracing::warn;

use crate::output::{format_ns, print_info, print_json, print_success, OutputFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScenarioKind {
    /// Delete the daemon pod and wait for LOCKED
    PodRestart,
    /// Step the PHC, expect FREERUN, step back, expect LOCKED
    Offset,
    /// Take PTP NICs down and up, one at a time
    InterfaceFlap,
    /// Monitor PHC drift against the system clock
    Holdover,
    /// Drop the newest leap second announcement
    Leap,
    /// Revoke GNSS on an NTP-fallback grandmaster
    GnssFallback,
}

impl ScenarioKind {
    /// Profile types a node must carry to run this scenario
    fn profile_types(&self) -> &'static [ProfileType] {
        match self {
            ScenarioKind::PodRestart | ScenarioKind::Offset | ScenarioKind::InterfaceFlap => {
                &[ProfileType::Oc, ProfileType::TwoPortOc, ProfileType::Bc]
            }
            ScenarioKind::Holdover | ScenarioKind::Leap => {
                &[ProfileType::Gm, ProfileType::MultiNicGm, ProfileType::NtpFallback]
            }
            ScenarioKind::GnssFallback => &[ProfileType::NtpFallback],
        }
    }

    /// Role of the interfaces picked when none are given
    fn default_role(&self) -> ClockType {
        match self {
            ScenarioKind::Holdover => ClockType::Server,
            _ => ClockType::Client,
        }
    }
}

pub struct ScenarioArgs {
    pub node: Option<String>,
    pub interfaces: Vec<String>,
    pub offset_secs: f64,
    pub holdover_secs: u64,
}

fn select_node<'a>(topology: &'a NodeInfoMap, kind: ScenarioKind, requested: Option<&str>) -> Result<&'a NodeInfo> {
    let types = kind.profile_types();
    match requested {
        Some(name) => {
            let node = topology
                .get(name)
                .ok_or_else(|| HarnessError::Precondition(format!("node {} carries no PTP profile", name)))?;
            if node.profiles_by_types(types).is_empty() {
                return Err(HarnessError::Skip(format!("node {} has no {:?} profile", name, types)).into());
            }
            Ok(node)
        }
        None => harness_lib::ptp::nodes_with_profile_types(topology, types)
            .into_iter()
            .next()
            .ok_or_else(|| HarnessError::Skip(format!("no node carries a {:?} profile", types)).into()),
    }
}

fn select_interfaces(node: &NodeInfo, kind: ScenarioKind, requested: &[String]) -> Vec<String> {
    if !requested.is_empty() {
        return requested.to_vec();
    }
    node.profiles_by_types(kind.profile_types())
        .into_iter()
        .flat_map(|profile| profile.interfaces_by_clock_type(kind.default_role()))
        .map(|iface| iface.name.clone())
        .collect()
}

fn first_interface(interfaces: &[String]) -> Result<&str> {
    interfaces
        .first()
        .map(String::as_str)
        .ok_or_else(|| anyhow!(HarnessError::Precondition("no interface to perturb".to_string())))
}

/// Run `kind` and restore the PtpConfigs afterwards
pub async fn run(harness: &Harness, kind: ScenarioKind, args: &ScenarioArgs, format: OutputFormat) -> Result<()> {
    let topology = harness.discover_topology().await?;
    let node = select_node(&topology, kind, args.node.as_deref())?;
    let interfaces = select_interfaces(node, kind, &args.interfaces);

    let registry = NicRegistry::global().clone();
    let drivers = harness.drivers(registry.clone()).await?;
    let mutator = harness.mutator();
    let saved = mutator.save_ptp_configs().await?;

    print_info(&format!("Running {:?} on {}", kind, node.name));
    let outcome = async {
        match kind {
            ScenarioKind::PodRestart => drivers.pod_restart_recovery(&node.name).await?,
            ScenarioKind::Offset => {
                drivers
                    .offset_perturbation(&node.name, first_interface(&interfaces)?, args.offset_secs)
                    .await?
            }
            ScenarioKind::InterfaceFlap => {
                let flapped = drivers.interface_flap(&node.name, &interfaces).await?;
                print_info(&format!("Flapped NICs: {}", flapped.join(", ")));
            }
            ScenarioKind::Holdover => {
                let report = drivers
                    .holdover_deviation(&node.name, first_interface(&interfaces)?)
                    .await?;
                match format {
                    OutputFormat::Json => print_json(&report)?,
                    OutputFormat::Table => print_info(&format!(
                        "{} samples, max drift {}",
                        report.samples,
                        format_ns(report.max_abs_delta_ns)
                    )),
                }
            }
            ScenarioKind::Leap => {
                let outcome = drivers.leap_file_mutation(&node.name).await?;
                match format {
                    OutputFormat::Json => print_json(&outcome)?,
                    OutputFormat::Table => print_info(&format!("Leap file rewritten on {}", outcome.date)),
                }
            }
            ScenarioKind::GnssFallback => {
                let profile = node
                    .profiles_by_types(&[ProfileType::NtpFallback])
                    .into_iter()
                    .next()
                    .ok_or_else(|| HarnessError::Skip("no NTP fallback profile".to_string()))?;
                drivers
                    .gnss_ntp_fallback(&node.name, &profile.reference, args.holdover_secs)
                    .await?
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    if let Err(e) = mutator.restore_ptp_configs(&saved).await {
        warn!(error = %e, "Failed to restore PtpConfigs after scenario");
    }
    if !registry.is_empty() {
        let path = harness.config().dump_dir.join("nic-report.json");
        match harness.nic_reporter().collect(&registry).await {
            Ok(reports) => {
                write_report(&path, &reports)?;
                harness.logger().log_artifact("nic_report", &path.display().to_string());
            }
            Err(e) => warn!(error = %e, "Failed to collect NIC report"),
        }
    }

    outcome?;
    print_success(&format!("{:?} passed on {}", kind, node.name));
    Ok(())
}
