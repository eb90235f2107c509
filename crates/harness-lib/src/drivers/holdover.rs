//! PHC drift monitoring during holdover
//!
//! `phc_ctl <dev> cmp` reports the PHC's offset from CLOCK_REALTIME. The first
//! sample is the baseline so a constant TAI-UTC difference cancels out.

use crate::error::{HarnessError, Result};
use crate::exec::{ExecOptions, NodeExecutor};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Consecutive failed samples tolerated; one more gives up
pub const MAX_CONSECUTIVE_FAILURES: u32 = 120;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

fn cmp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"offset from CLOCK_REALTIME is (-?\d+)ns").expect("phc_ctl regex is valid"))
}

pub fn phc_device(index: u32) -> String {
    format!("/dev/ptp{}", index)
}

/// Offset in nanoseconds from `phc_ctl cmp` output
pub fn parse_phc_cmp(output: &str) -> Option<i64> {
    cmp_regex().captures(output)?.get(1)?.as_str().parse().ok()
}

/// Summary of one monitoring run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldoverReport {
    pub baseline_ns: i64,
    pub samples: u64,
    pub failed_samples: u64,
    pub max_abs_delta_ns: i64,
}

/// Accumulates samples against the first one
#[derive(Debug, Default)]
pub(crate) struct DeviationTracker {
    threshold_ns: i64,
    consecutive_failures: u32,
    report: Option<HoldoverReport>,
    failed_before_baseline: u64,
}

impl DeviationTracker {
    pub(crate) fn new(threshold_ns: i64) -> Self {
        Self {
            threshold_ns,
            ..Default::default()
        }
    }

    /// Record an offset; fails once the drift reaches the threshold
    pub(crate) fn record(&mut self, offset_ns: i64) -> Result<()> {
        self.consecutive_failures = 0;
        let failed_before = self.failed_before_baseline;
        let report = self.report.get_or_insert_with(|| HoldoverReport {
            baseline_ns: offset_ns,
            failed_samples: failed_before,
            ..Default::default()
        });
        report.samples += 1;

        let delta = (offset_ns - report.baseline_ns).abs();
        report.max_abs_delta_ns = report.max_abs_delta_ns.max(delta);
        if delta >= self.threshold_ns {
            return Err(HarnessError::Contract(format!(
                "PHC drifted {}ns from its holdover baseline, threshold {}ns",
                delta, self.threshold_ns
            )));
        }
        Ok(())
    }

    /// Record a failed sample; fails after too many in a row
    pub(crate) fn record_failure(&mut self, error: &HarnessError) -> Result<()> {
        self.consecutive_failures += 1;
        match self.report.as_mut() {
            Some(report) => report.failed_samples += 1,
            None => self.failed_before_baseline += 1,
        }
        if self.consecutive_failures > MAX_CONSECUTIVE_FAILURES {
            return Err(HarnessError::transient(
                "holdover monitor",
                format!("{} consecutive failed samples, last: {}", self.consecutive_failures, error),
            ));
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<HoldoverReport> {
        self.report
            .ok_or_else(|| HarnessError::Contract("no PHC offset sample was collected".to_string()))
    }
}

/// Sample `phc_ctl cmp` once per second for `duration`
pub async fn monitor_holdover(
    executor: &NodeExecutor,
    node: &str,
    phc_index: u32,
    duration: Duration,
    threshold_ns: i64,
) -> Result<HoldoverReport> {
    let command = format!("phc_ctl {} cmp", phc_device(phc_index));
    let options = ExecOptions::default();
    let mut tracker = DeviationTracker::new(threshold_ns);
    let deadline = Instant::now() + duration;
    let mut ticker = interval(SAMPLE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(node = %node, device = %phc_device(phc_index), secs = duration.as_secs(), "Monitoring holdover drift");
    while Instant::now() < deadline {
        ticker.tick().await;
        let sample = executor.exec(node, &command, &options).await.and_then(|output| {
            parse_phc_cmp(&output)
                .ok_or_else(|| HarnessError::Contract(format!("unexpected phc_ctl output: {}", output)))
        });
        match sample {
            Ok(offset) => {
                debug!(node = %node, offset_ns = offset, "PHC offset sample");
                tracker.record(offset)?;
            }
            Err(e) => {
                warn!(node = %node, error = %e, "PHC offset sample failed");
                tracker.record_failure(&e)?;
            }
        }
    }

    tracker.finish()
}
