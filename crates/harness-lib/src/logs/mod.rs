//! Container log tailing, long-window collection and stability analysis

mod analyzer;
mod collector;
mod matcher;
mod tailer;

pub use analyzer::{analyze_collection, analyze_lines, OffsetStats, StabilityReport, StateTransition};
pub use collector::{CollectOptions, CollectionResult, LogCollector};
pub use matcher::LineMatcher;
pub use tailer::{LogTailer, TailOptions};

/// Split a log chunk into its non-empty lines
pub(crate) fn split_lines(chunk: &str) -> impl Iterator<Item = &str> {
    chunk.split('\n').map(|line| line.trim_end_matches('\r')).filter(|line| !line.trim().is_empty())
}

#[cfg(test)]
mod tests;
