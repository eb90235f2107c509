//! PtpConfig snapshot and restore commands

use anyhow::{Context, Result};
use harness_lib::crds::PtpConfig;
use harness_lib::Harness;
use std::path::Path;
use tabled::Tabled;

use crate::output::{print_info, print_json, print_success, print_table, OutputFormat};

#[derive(Tabled)]
struct RestoredRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "PtpConfig")]
    config: String,
    #[tabled(rename = "Profile")]
    profile: String,
}

/// Save every PtpConfig in the PTP namespace
pub async fn snapshot(harness: &Harness, output: &Path) -> Result<()> {
    let configs = harness.mutator().save_ptp_configs().await?;
    let content = serde_json::to_string_pretty(&configs)?;
    std::fs::write(output, content).with_context(|| format!("Failed to write {}", output.display()))?;
    harness.logger().log_artifact("ptpconfig_snapshot", &output.display().to_string());
    print_success(&format!("Saved {} PtpConfigs to {}", configs.len(), output.display()));
    Ok(())
}

/// Rewrite every PtpConfig whose profiles differ from the snapshot
pub async fn restore(harness: &Harness, input: &Path, format: OutputFormat) -> Result<()> {
    let content = std::fs::read_to_string(input).with_context(|| format!("Failed to read {}", input.display()))?;
    let saved: Vec<PtpConfig> =
        serde_json::from_str(&content).with_context(|| format!("{} is not a PtpConfig snapshot", input.display()))?;

    let restored = harness.mutator().restore_ptp_configs(&saved).await?;

    match format {
        OutputFormat::Json => print_json(&restored)?,
        OutputFormat::Table => {
            if restored.is_empty() {
                print_info("Every profile already matches the snapshot");
                return Ok(());
            }
            let rows: Vec<RestoredRow> = restored
                .iter()
                .map(|reference| RestoredRow {
                    namespace: reference.config_namespace.clone(),
                    config: reference.config_name.clone(),
                    profile: reference.profile_name.clone(),
                })
                .collect();
            print_table(&rows);
        }
    }
    print_success(&format!("Restored {} profiles", restored.len()));
    Ok(())
}
