//! Node reports, must-gather and host commands

use anyhow::{Context, Result};
use harness_lib::nicinfo::{write_report, NicRegistry};
use harness_lib::Harness;
use std::path::Path;
use std::time::Duration;
use tabled::Tabled;

use crate::output::{print_info, print_json, print_success, print_table, OutputFormat};

#[derive(Tabled)]
struct NicRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Interface")]
    interface: String,
    #[tabled(rename = "Driver")]
    driver: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Firmware")]
    firmware: String,
    #[tabled(rename = "PHC")]
    phc: String,
}

/// Report driver, firmware and PHC index of `interfaces` on `node`
pub async fn nic_report(
    harness: &Harness,
    node: &str,
    interfaces: &[String],
    output: Option<&Path>,
    format: OutputFormat,
) -> Result<()> {
    let registry = NicRegistry::new();
    registry.mark_all(node, interfaces);
    let reports = harness.nic_reporter().collect(&registry).await?;

    if let Some(path) = output {
        write_report(path, &reports)?;
        harness.logger().log_artifact("nic_report", &path.display().to_string());
    }

    match format {
        OutputFormat::Json => print_json(&reports)?,
        OutputFormat::Table => {
            let rows: Vec<NicRow> = reports
                .iter()
                .flat_map(|report| {
                    report.interfaces.iter().map(move |iface| NicRow {
                        node: report.node_name.clone(),
                        interface: iface.name.clone(),
                        driver: iface.driver.clone(),
                        version: iface.version.clone(),
                        firmware: iface.firmware_version.clone(),
                        phc: format!("/dev/ptp{}", iface.ptp_hardware_clock),
                    })
                })
                .collect();
            print_table(&rows);
        }
    }
    Ok(())
}

/// Run must-gather into `<dump_dir>/<spec_name>/`
pub async fn must_gather(harness: &Harness, spec_name: &str) -> Result<()> {
    print_info("Running must-gather, this can take several minutes");
    let dump_dir = &harness.config().dump_dir;
    let tarball = harness.must_gather().run_for_spec(dump_dir, spec_name).await?;
    print_success(&format!("Must-gather written to {}", tarball.display()));
    Ok(())
}

/// Run `command` in the host namespaces of `node` and print its output
pub async fn host_exec(harness: &Harness, node: &str, command: &[String], timeout_secs: u64) -> Result<()> {
    harness
        .sriov()
        .ensure_namespace()
        .await
        .context("Failed to prepare the debug pod namespace")?;
    let output = harness
        .host_executor()
        .exec_on_host(node, command, Duration::from_secs(timeout_secs))
        .await?;
    println!("{}", output);
    Ok(())
}
