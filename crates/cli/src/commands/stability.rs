//! Servo stability commands

use anyhow::{bail, Context, Result};
use chrono::Utc;
use colored::Colorize;
use harness_lib::logs::{analyze_collection, analyze_lines, CollectOptions, StabilityReport};
use harness_lib::Harness;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabled::Tabled;
use tokio::task::JoinSet;

use crate::output::{color_status, format_ns, print_json, print_success, print_table, OutputFormat};

/// Row for the stability summary table
#[derive(Tabled)]
struct ReportRow {
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "ptp4l Samples")]
    ptp4l_samples: u64,
    #[tabled(rename = "ptp4l Max")]
    ptp4l_max: String,
    #[tabled(rename = "phc2sys Samples")]
    phc2sys_samples: u64,
    #[tabled(rename = "phc2sys Max")]
    phc2sys_max: String,
    #[tabled(rename = "Restarts")]
    restarts: usize,
}

impl ReportRow {
    fn new(source: &str, report: &StabilityReport) -> Self {
        Self {
            source: source.to_string(),
            result: color_status(if report.passed { "passed" } else { "failed" }),
            ptp4l_samples: report.ptp4l_stats.sample_count,
            ptp4l_max: format_ns(report.ptp4l_stats.max_abs),
            phc2sys_samples: report.phc2sys_stats.sample_count,
            phc2sys_max: format_ns(report.phc2sys_stats.max_abs),
            restarts: report.ptp4l_start_count,
        }
    }
}

fn print_reports(reports: &[(String, StabilityReport)], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let map: std::collections::BTreeMap<&str, &StabilityReport> =
                reports.iter().map(|(source, report)| (source.as_str(), report)).collect();
            print_json(&map)?;
        }
        OutputFormat::Table => {
            let rows: Vec<ReportRow> = reports.iter().map(|(source, report)| ReportRow::new(source, report)).collect();
            print_table(&rows);
            for (source, report) in reports.iter().filter(|(_, report)| !report.passed) {
                println!("\n{}", source.bold());
                println!("{}", report.message());
            }
        }
    }
    Ok(())
}

fn verdict(reports: &[(String, StabilityReport)]) -> Result<()> {
    let failed: Vec<&str> = reports
        .iter()
        .filter(|(_, report)| !report.passed)
        .map(|(source, _)| source.as_str())
        .collect();
    if !failed.is_empty() {
        bail!("stability check failed on {}", failed.join(", "));
    }
    print_success("Stability check passed");
    Ok(())
}

/// Analyse a saved log file
pub fn analyze_file(file: &Path, threshold_ns: i64, format: OutputFormat) -> Result<()> {
    let content = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let lines: Vec<&str> = content.lines().collect();
    let report = analyze_lines(&lines, threshold_ns);

    let reports = vec![(file.display().to_string(), report)];
    print_reports(&reports, format)?;
    verdict(&reports)
}

/// Collect daemon logs on every node in parallel, save them and analyse each window
pub async fn collect(
    harness: &Harness,
    nodes: &[String],
    duration_secs: Option<u64>,
    out_dir: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let config = harness.config();
    let duration = duration_secs.map(Duration::from_secs).unwrap_or_else(|| config.stability_duration());
    let out_dir = out_dir.unwrap_or_else(|| config.dump_dir.join("stability"));
    std::fs::create_dir_all(&out_dir).with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let options = CollectOptions::default().start_time(Utc::now()).duration(duration);
    let mut tasks = JoinSet::new();
    for node in nodes {
        let collector = harness.collector();
        let options = options.clone();
        let node = node.clone();
        tasks.spawn(async move { collector.collect(&node, &options).await });
    }

    let mut reports = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let result = joined.context("Collector task panicked")??;
        let log_path = out_dir.join(format!("{}-ptp-daemon.log", result.node_name));
        std::fs::write(&log_path, result.lines.join("\n"))
            .with_context(|| format!("Failed to write {}", log_path.display()))?;
        harness.logger().log_artifact("daemon_log", &log_path.display().to_string());

        let report = analyze_collection(&result, config.offset_threshold_ns);
        let report_path = out_dir.join(format!("{}-stability.json", result.node_name));
        std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write {}", report_path.display()))?;
        harness.logger().log_artifact("stability_report", &report_path.display().to_string());

        reports.push((result.node_name.clone(), report));
    }
    reports.sort_by(|a, b| a.0.cmp(&b.0));

    print_reports(&reports, format)?;
    verdict(&reports)
}
