//! Topology discovery command

use anyhow::Result;
use colored::Colorize;
use harness_lib::ptp::NodeInfo;
use harness_lib::Harness;
use tabled::Tabled;

use crate::output::{or_dash, print_json, print_table, print_warning, OutputFormat};

/// Row for the topology table, one per interface
#[derive(Tabled)]
struct InterfaceRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Profile")]
    profile: String,
    #[tabled(rename = "Type")]
    profile_type: String,
    #[tabled(rename = "Config")]
    config: String,
    #[tabled(rename = "Interface")]
    interface: String,
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "Port Identity")]
    port_identity: String,
    #[tabled(rename = "Local Parent")]
    parent: String,
}

fn rows(node: &NodeInfo) -> Vec<InterfaceRow> {
    let mut rows = Vec::new();
    for profile in &node.profiles {
        let config = profile
            .config_path()
            .unwrap_or_else(|| "-".to_string());
        if profile.interfaces.is_empty() {
            rows.push(InterfaceRow {
                node: node.name.clone(),
                profile: profile.name().to_string(),
                profile_type: profile.profile_type.to_string(),
                config: config.clone(),
                interface: "-".to_string(),
                role: "-".to_string(),
                port_identity: "-".to_string(),
                parent: "-".to_string(),
            });
        }
        for interface in profile.interfaces.values() {
            rows.push(InterfaceRow {
                node: node.name.clone(),
                profile: profile.name().to_string(),
                profile_type: profile.profile_type.to_string(),
                config: config.clone(),
                interface: interface.name.clone(),
                role: format!("{:?}", interface.clock_type),
                port_identity: or_dash(interface.port_identity.as_deref()),
                parent: or_dash(node.parent_of(interface).map(|p| p.name.as_str())),
            });
        }
    }
    rows
}

/// Discover and print the PTP topology
pub async fn show_topology(harness: &Harness, format: OutputFormat) -> Result<()> {
    let topology = harness.discover_topology().await?;

    match format {
        OutputFormat::Json => print_json(&topology)?,
        OutputFormat::Table => {
            if topology.is_empty() {
                print_warning("No worker node carries a PTP profile");
                return Ok(());
            }
            println!("{}", "PTP Topology".bold());
            let rows: Vec<InterfaceRow> = topology.values().flat_map(rows).collect();
            print_table(&rows);
            for node in topology.values() {
                let counts: Vec<String> = node
                    .counts
                    .iter()
                    .map(|(profile_type, count)| format!("{}={}", profile_type, count))
                    .collect();
                println!("{}: {}", node.name.cyan(), counts.join(" "));
            }
        }
    }

    Ok(())
}
