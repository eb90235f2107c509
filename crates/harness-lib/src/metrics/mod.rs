//! Metric queries against the cluster's Prometheus
//!
//! This module provides:
//! - Typed PTP metric queries that render PromQL instant queries
//! - The [`MetricsApi`] seam and its Thanos querier client
//! - The stability asserter and the joint event+metric asserter

mod asserter;
mod joint;
mod prometheus;
mod query;
mod values;

pub use asserter::{AssertOptions, MetricAsserter};
pub use joint::{EventPublisherStatus, JointAsserter};
pub use prometheus::{MetricSample, MetricsApi, PrometheusClient};
pub use query::{
    ClockClassQuery, ClockStateQuery, HaProfileStatusQuery, InterfaceRoleQuery, LabelFilter,
    LabelMatch, MetricQuery, ProcessStatusQuery,
};
pub use values::{ClockClass, ClockState, HaProfileStatus, InterfaceRole, MetricValue, ProcessStatus};

use serde::{Deserialize, Serialize};

/// Processes that publish PTP metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PtpProcess {
    Ptp4l,
    Phc2sys,
    Ts2phc,
    Chronyd,
}

impl PtpProcess {
    pub fn as_str(&self) -> &'static str {
        match self {
            PtpProcess::Ptp4l => "ptp4l",
            PtpProcess::Phc2sys => "phc2sys",
            PtpProcess::Ts2phc => "ts2phc",
            PtpProcess::Chronyd => "chronyd",
        }
    }
}

impl std::fmt::Display for PtpProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
