//! Leap-second file edits in the operator's leap ConfigMap

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use regex::Regex;
use std::sync::OnceLock;

pub const LEAP_CONFIGMAP: &str = "leap-configmap";

fn announcement_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\d+\s+\d+\s+#").expect("leap regex is valid"))
}

pub fn is_announcement(line: &str) -> bool {
    announcement_regex().is_match(line)
}

/// Last `<seconds> <offset> # …` line
pub fn last_announcement(content: &str) -> Option<&str> {
    content.lines().filter(|line| is_announcement(line)).last()
}

/// Drop the last announcement line; returns the new content and the removed line
pub fn remove_last_announcement(content: &str) -> Option<(String, String)> {
    let lines: Vec<&str> = content.lines().collect();
    let index = lines.iter().rposition(|line| is_announcement(line))?;
    let removed = lines[index].to_string();

    let mut kept: Vec<&str> = lines;
    kept.remove(index);
    let mut updated = kept.join("\n");
    if content.ends_with('\n') {
        updated.push('\n');
    }
    Some((updated, removed))
}

/// `D Mon YYYY`, the date format the daemon writes into the leap file header
pub fn leap_date(now: DateTime<Utc>) -> String {
    now.format("%-d %b %Y").to_string()
}

/// Whether any value of the ConfigMap mentions `date`
pub fn configmap_mentions(configmap: &ConfigMap, date: &str) -> bool {
    configmap
        .data
        .as_ref()
        .map(|data| data.values().any(|value| value.contains(date)))
        .unwrap_or(false)
}
