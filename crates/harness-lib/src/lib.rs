//! Validation harness for PTP and SR-IOV on OpenShift clusters
//!
//! This crate provides the core functionality for:
//! - Command execution in PTP daemon pods and host debug pods
//! - Log tailing, long-window collection and stability analysis
//! - Cloud-event and Prometheus metric assertions
//! - PTP topology discovery and PtpConfig mutation/restoration
//! - SR-IOV policy, network and traffic checks
//! - Must-gather and NIC report artefacts
//! - Perturbation drivers composing all of the above

pub mod cleanup;
pub mod config;
pub mod crds;
pub mod drivers;
pub mod error;
pub mod events;
pub mod exec;
pub mod logs;
pub mod metrics;
pub mod mustgather;
pub mod nicinfo;
pub mod observability;
pub mod poll;
pub mod ptp;
pub mod runtime;
pub mod sriov;

pub use config::HarnessConfig;
pub use error::{HarnessError, Result, ResultExt};
pub use observability::{HarnessMetrics, StructuredLogger};
pub use poll::poll_until_timeout;
pub use runtime::Harness;
