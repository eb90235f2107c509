//! Telco E2E CLI
//!
//! A command-line front end to the PTP and SR-IOV validation harness:
//! topology discovery, stability analysis, metric assertions, PtpConfig
//! snapshots, artefact collection and scripted perturbation scenarios.

mod commands;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use commands::{artifacts, clock, ptpconfig, scenario, stability, topology};
use harness_lib::{Harness, HarnessConfig, HarnessError, HarnessMetrics};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Telco E2E validation harness
#[derive(Parser)]
#[command(name = "telco-e2e")]
#[command(author, version, about = "PTP and SR-IOV end-to-end validation harness", long_about = None)]
pub struct Cli {
    /// Harness configuration file (YAML, TOML or JSON)
    #[arg(long, env = "TELCO_E2E_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table", global = true)]
    pub format: output::OutputFormat,

    /// Log line format
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Write the harness's own metrics here when the command finishes
    #[arg(long, global = true)]
    pub metrics_out: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show PTP profiles resolved against the worker nodes
    Topology,

    /// Analyse a saved daemon log for servo stability
    Analyze {
        /// Log file, one daemon line per line
        file: PathBuf,

        /// Absolute offset threshold in nanoseconds (defaults to the configured one)
        #[arg(long)]
        threshold_ns: Option<i64>,
    },

    /// Collect daemon logs on nodes for a window and analyse them
    CollectStability {
        /// Nodes to collect from
        #[arg(required = true)]
        nodes: Vec<String>,

        /// Window length in seconds (defaults to the configured one)
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Directory for raw logs and reports (defaults to the dump directory)
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Wait for the clock state metric of a node to reach a value
    AssertClockState {
        /// Node name
        node: String,

        /// Expected state
        #[arg(long, default_value = "locked")]
        state: clock::StateArg,

        /// Seconds the value must hold
        #[arg(long, default_value_t = 10)]
        stable_for_secs: u64,

        /// Overall timeout in seconds
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },

    /// Report driver and firmware of PTP interfaces
    NicReport {
        /// Node name
        node: String,

        /// Interfaces to report
        #[arg(long = "interface", short, required = true)]
        interfaces: Vec<String>,

        /// Write the report as JSON here
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Run must-gather into the dump directory
    MustGather {
        /// Name of the failed check the artefacts belong to
        #[arg(long, default_value = "manual")]
        spec_name: String,
    },

    /// Save every PtpConfig to a file
    Snapshot {
        /// Snapshot file
        #[arg(long, short)]
        output: PathBuf,
    },

    /// Restore PtpConfigs from a snapshot file
    Restore {
        /// Snapshot file
        #[arg(long, short)]
        input: PathBuf,
    },

    /// Run a command in the host namespaces of a node
    HostExec {
        /// Node name
        node: String,

        /// Command and arguments
        #[arg(required = true, last = true)]
        command: Vec<String>,

        /// Timeout in seconds
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },

    /// Run a perturbation scenario against a node
    Scenario {
        /// Scenario to run
        kind: scenario::ScenarioKind,

        /// Node name (defaults to the first node carrying a suitable profile)
        #[arg(long)]
        node: Option<String>,

        /// Interfaces for offset, flap and holdover scenarios
        #[arg(long = "interface", short)]
        interfaces: Vec<String>,

        /// Seconds to step the PHC by in the offset scenario
        #[arg(long, default_value_t = 1.0)]
        offset_secs: f64,

        /// ts2phc holdover in seconds for the GNSS fallback scenario
        #[arg(long, default_value_t = 10)]
        holdover_secs: u64,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(std::io::stderr)).init(),
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
    }
}

/// True if the error chain carries a harness skip
fn is_skip(error: &anyhow::Error) -> bool {
    error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<HarnessError>())
        .any(HarnessError::is_skip)
}

async fn run(cli: &Cli) -> Result<()> {
    let config = HarnessConfig::load(cli.config.as_deref()).context("Failed to load harness configuration")?;

    // offline commands never touch the cluster
    if let Commands::Analyze { file, threshold_ns } = &cli.command {
        let threshold = threshold_ns.unwrap_or(config.offset_threshold_ns);
        return stability::analyze_file(file, threshold, cli.format);
    }

    let harness = Harness::connect(config, "telco-e2e")
        .await
        .context("Failed to connect to the cluster")?;

    match &cli.command {
        Commands::Analyze { .. } => Ok(()),
        Commands::Topology => topology::show_topology(&harness, cli.format).await,
        Commands::CollectStability {
            nodes,
            duration_secs,
            out_dir,
        } => stability::collect(&harness, nodes, *duration_secs, out_dir.clone(), cli.format).await,
        Commands::AssertClockState {
            node,
            state,
            stable_for_secs,
            timeout_secs,
        } => clock::assert_clock_state(&harness, node, *state, *stable_for_secs, *timeout_secs).await,
        Commands::NicReport {
            node,
            interfaces,
            output,
        } => artifacts::nic_report(&harness, node, interfaces, output.as_deref(), cli.format).await,
        Commands::MustGather { spec_name } => artifacts::must_gather(&harness, spec_name).await,
        Commands::Snapshot { output } => ptpconfig::snapshot(&harness, output).await,
        Commands::Restore { input } => ptpconfig::restore(&harness, input, cli.format).await,
        Commands::HostExec {
            node,
            command,
            timeout_secs,
        } => artifacts::host_exec(&harness, node, command, *timeout_secs).await,
        Commands::Scenario {
            kind,
            node,
            interfaces,
            offset_secs,
            holdover_secs,
        } => {
            let args = scenario::ScenarioArgs {
                node: node.clone(),
                interfaces: interfaces.clone(),
                offset_secs: *offset_secs,
                holdover_secs: *holdover_secs,
            };
            scenario::run(&harness, *kind, &args, cli.format).await
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let result = run(&cli).await;

    if let Some(path) = &cli.metrics_out {
        std::fs::write(path, HarnessMetrics::new().render_text())
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    }

    match result {
        Ok(()) => Ok(()),
        Err(e) if is_skip(&e) => {
            output::print_warning(&format!("Skipped: {:#}", e));
            Ok(())
        }
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            std::process::exit(1);
        }
    }
}
