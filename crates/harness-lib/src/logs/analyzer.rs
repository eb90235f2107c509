//! Servo offset analysis of ptp4l/phc2sys logs
//!
//! Recognised lines look like
//!
//! ```text
//! ptp4l[8542.510]: [ptp4l.0.config] master offset -4 s2 freq -2341 path delay 512
//! phc2sys[8542.701]: [ptp4l.0.config] CLOCK_REALTIME phc offset 3 s2 freq -91 delay 498
//! ```

use super::CollectionResult;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::OnceLock;

fn offset_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(ptp4l|phc2sys)\[[^\]]*\].*?\boffset\s+(\S+)\s+(s\d+)\b.*\bdelay\b")
            .expect("offset line regex is valid")
    })
}

const RESTART_MARKER: &str = "Starting ptp4l";
const LOCKED_TRANSIENT_STATE: &str = "s2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Process {
    Ptp4l,
    Phc2sys,
}

#[derive(Debug, Clone)]
struct OffsetEntry<'a> {
    raw: &'a str,
    offset: i64,
    state: &'a str,
}

/// Statistics over absolute offsets, in nanoseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OffsetStats {
    pub sample_count: u64,
    pub max_abs: i64,
    pub min_abs: i64,
    pub mean_abs: f64,
}

impl OffsetStats {
    fn add(&mut self, offset: i64) {
        let abs = offset.saturating_abs();
        if self.sample_count == 0 {
            self.max_abs = abs;
            self.min_abs = abs;
        } else {
            self.max_abs = self.max_abs.max(abs);
            self.min_abs = self.min_abs.min(abs);
        }
        self.sample_count += 1;
        self.mean_abs += (abs as f64 - self.mean_abs) / self.sample_count as f64;
    }

    fn summary(&self, process: &str) -> String {
        format!(
            "{} offsets: samples={} max_abs={}ns min_abs={}ns mean_abs={:.2}ns",
            process, self.sample_count, self.max_abs, self.min_abs, self.mean_abs
        )
    }
}

/// Adjacent ptp4l samples whose servo state differs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: String,
    pub to: String,
    pub line: String,
}

/// Outcome of a stability analysis
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StabilityReport {
    pub passed: bool,
    /// Number of failed checks, one per entry in `details`
    pub errors: usize,
    pub details: Vec<String>,
    pub threshold_ns: i64,
    pub ptp4l_stats: OffsetStats,
    pub phc2sys_stats: OffsetStats,
    pub ptp4l_start_count: usize,
    pub state_transitions: Vec<StateTransition>,
    pub faulty_lines: usize,
    pub timeout_lines: usize,
    pub ptp4l_violations: usize,
    pub phc2sys_violations: usize,
    /// Offset lines whose offset field did not parse
    pub dropped: usize,
}

impl StabilityReport {
    /// Multi-line diagnostic: failures first, then per-process stats
    pub fn message(&self) -> String {
        let mut out = String::new();
        if self.passed {
            out.push_str("stability check passed\n");
        } else {
            let _ = writeln!(out, "stability check failed with {} errors:", self.errors);
            for detail in &self.details {
                let _ = writeln!(out, "  - {}", detail);
            }
        }
        let _ = writeln!(out, "{}", self.ptp4l_stats.summary("ptp4l"));
        let _ = writeln!(out, "{}", self.phc2sys_stats.summary("phc2sys"));
        let _ = write!(out, "ptp4l restarts: {}", self.ptp4l_start_count);
        out
    }

    fn fail(&mut self, detail: String) {
        self.details.push(detail);
        self.errors = self.details.len();
        self.passed = false;
    }
}

fn parse_entry(line: &str) -> Option<(Process, Option<OffsetEntry<'_>>)> {
    let caps = offset_line_regex().captures(line)?;
    let process = match caps.get(1)?.as_str() {
        "ptp4l" => Process::Ptp4l,
        _ => Process::Phc2sys,
    };
    let entry = caps
        .get(2)?
        .as_str()
        .parse::<i64>()
        .ok()
        .map(|offset| OffsetEntry {
            raw: line,
            offset,
            state: caps.get(3).map(|m| m.as_str()).unwrap_or_default(),
        });
    Some((process, entry))
}

/// Analyse raw daemon log lines against an absolute offset threshold
pub fn analyze_lines<S: AsRef<str>>(lines: &[S], threshold_ns: i64) -> StabilityReport {
    let mut report = StabilityReport {
        passed: true,
        threshold_ns,
        ..Default::default()
    };
    let mut previous_ptp4l: Option<OffsetEntry<'_>> = None;

    for line in lines {
        let line = line.as_ref();
        let lower = line.to_lowercase();
        if lower.contains("faulty") {
            report.faulty_lines += 1;
        }
        if lower.contains("timeout") {
            report.timeout_lines += 1;
        }
        if line.contains(RESTART_MARKER) {
            report.ptp4l_start_count += 1;
        }

        let Some((process, entry)) = parse_entry(line) else {
            continue;
        };
        let Some(entry) = entry else {
            report.dropped += 1;
            continue;
        };

        let violates = entry.state == LOCKED_TRANSIENT_STATE && entry.offset.saturating_abs() > threshold_ns;
        match process {
            Process::Ptp4l => {
                report.ptp4l_stats.add(entry.offset);
                if violates {
                    report.ptp4l_violations += 1;
                }
                if let Some(previous) = &previous_ptp4l {
                    if previous.state != entry.state {
                        report.state_transitions.push(StateTransition {
                            from: previous.state.to_string(),
                            to: entry.state.to_string(),
                            line: entry.raw.to_string(),
                        });
                    }
                }
                previous_ptp4l = Some(entry);
            }
            Process::Phc2sys => {
                report.phc2sys_stats.add(entry.offset);
                if violates {
                    report.phc2sys_violations += 1;
                }
            }
        }
    }

    if report.faulty_lines > 0 {
        let detail = format!("found {} lines containing FAULTY", report.faulty_lines);
        report.fail(detail);
    }
    if report.timeout_lines > 0 {
        let detail = format!("found {} lines containing TIMEOUT", report.timeout_lines);
        report.fail(detail);
    }
    if report.ptp4l_violations > 0 {
        let detail = format!(
            "found {} ptp4l s2 offset violations over threshold {}ns",
            report.ptp4l_violations, threshold_ns
        );
        report.fail(detail);
    }
    if report.phc2sys_violations > 0 {
        let detail = format!(
            "found {} phc2sys s2 offset violations over threshold {}ns",
            report.phc2sys_violations, threshold_ns
        );
        report.fail(detail);
    }
    if !report.state_transitions.is_empty() {
        let detail = format!("found {} ptp4l servo state transitions", report.state_transitions.len());
        report.fail(detail);
    }

    report
}

/// Analyse a collection window, failing it outright when the window is unreliable
pub fn analyze_collection(result: &CollectionResult, threshold_ns: i64) -> StabilityReport {
    let mut report = analyze_lines(&result.lines, threshold_ns);
    if !result.is_reliable() {
        let detail = format!(
            "log collection on {} is unreliable: {} lines from {} successful fetches against {} fetch errors",
            result.node_name,
            result.lines.len(),
            result.successful_fetches,
            result.errors.len()
        );
        report.fail(detail);
    }
    report
}
