use super::*;
use crate::error::HarnessError;
use crate::exec::mock::{node_of, MockPodBackend};
use crate::exec::PodQuery;
use chrono::{TimeZone, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn daemon() -> PodQuery {
    PodQuery::new("openshift-ptp", "app=linuxptp-daemon").with_container("linuxptp-daemon-container")
}

fn ptp4l_line(offset: i64, state: &str) -> String {
    format!(
        "ptp4l[1000.100]: [ptp4l.0.config] master offset {} {} freq -2341 path delay 512",
        offset, state
    )
}

mod matcher_tests {
    use super::*;

    #[test]
    fn test_contains_and_regex() {
        assert!(LineMatcher::contains("load profiles").matches("I0101 daemon.go:1] load profiles"));
        let re = LineMatcher::regex(r"ptp4l\[\d+").unwrap();
        assert!(re.matches("ptp4l[123.4]: port 1"));
        assert!(!re.matches("phc2sys[1.0]"));
    }

    #[test]
    fn test_default_never_matches() {
        assert!(!LineMatcher::default().matches(""));
        assert!(!LineMatcher::Never.matches("anything"));
    }

    #[test]
    fn test_invalid_regex_is_error() {
        assert!(matches!(LineMatcher::regex("("), Err(HarnessError::Regex(_))));
    }
}

mod tailer_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_immediate_match_returns_before_first_sleep() {
        let backend = Arc::new(MockPodBackend::new().on_logs(|_, _, _| Ok("foo\nload profiles\n".to_string())));
        let tailer = LogTailer::new(backend.clone(), daemon());
        let started = Instant::now();

        let line = tailer
            .wait_for_log("node-0", &TailOptions::new(LineMatcher::contains("load profiles")))
            .await
            .unwrap();

        assert_eq!(line, "load profiles");
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(backend.log_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_matcher_always_times_out() {
        let backend = Arc::new(MockPodBackend::new().on_logs(|_, _, _| Ok("load profiles".to_string())));
        let tailer = LogTailer::new(backend, daemon());
        let options = TailOptions::default()
            .matcher(None)
            .timeout(Duration::from_secs(30))
            .polling_interval(Duration::from_secs(5));

        let err = tailer.wait_for_log("node-0", &options).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_starts_at_start_time_and_advances() {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let backend = Arc::new(MockPodBackend::new().on_logs(|_, _, call| {
            Ok(if call < 2 { String::new() } else { "match".to_string() })
        }));
        let tailer = LogTailer::new(backend.clone(), daemon());
        let options = TailOptions::new(LineMatcher::contains("match"))
            .start_time(start)
            .polling_interval(Duration::from_secs(1));

        tailer.wait_for_log("node-0", &options).await.unwrap();

        let since = backend.log_since.lock().unwrap();
        assert_eq!(since.len(), 3);
        assert_eq!(since[0].1, Some(start));
        assert!(since[1].1.unwrap() > start);
        assert!(since[2].1.unwrap() >= since[1].1.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tolerates_lookup_and_fetch_errors() {
        let backend = Arc::new(
            MockPodBackend::new()
                .failing_lookups("node-0", 1)
                .on_logs(|_, _, call| match call {
                    0 => Err(HarnessError::transient("logs", "stream reset")),
                    _ => Ok("load profiles".to_string()),
                }),
        );
        let tailer = LogTailer::new(backend.clone(), daemon());
        let options = TailOptions::new(LineMatcher::contains("load profiles")).polling_interval(Duration::from_secs(1));

        tailer.wait_for_log("node-0", &options).await.unwrap();
        assert_eq!(backend.finds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_lists_failed_nodes() {
        let backend = Arc::new(MockPodBackend::new().on_logs(|pod, _, _| {
            Ok(if node_of(pod) == "node-1" { String::new() } else { "load profiles".to_string() })
        }));
        let tailer = LogTailer::new(backend, daemon());
        let options = TailOptions::new(LineMatcher::contains("load profiles")).timeout(Duration::from_secs(20));
        let nodes = vec!["node-0".to_string(), "node-1".to_string(), "node-2".to_string()];

        let err = tailer.wait_for_log_on_nodes(&nodes, &options).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("node-1"));
        assert!(!message.contains("node-0"));
        assert!(!message.contains("node-2"));

        let healthy = vec!["node-0".to_string(), "node-2".to_string()];
        tailer.wait_for_log_on_nodes(&healthy, &options).await.unwrap();
    }
}

mod collector_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_collects_for_whole_window_and_records_errors() {
        let backend = Arc::new(MockPodBackend::new().on_logs(|_, _, call| match call {
            1 => Err(HarnessError::transient("logs", "i/o timeout")),
            n => Ok(format!("line-{}a\n\nline-{}b\n", n, n)),
        }));
        let collector = LogCollector::new(backend.clone(), daemon());
        let options = CollectOptions::default()
            .duration(Duration::from_secs(30))
            .polling_interval(Duration::from_secs(10));

        let result = collector.collect("node-0", &options).await.unwrap();

        assert_eq!(result.node_name, "node-0");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.successful_fetches, backend.log_calls.load(Ordering::SeqCst) - 1);
        assert_eq!(result.lines.len(), result.successful_fetches * 2);
        assert!(result.is_reliable());
        assert!(result.ended_at >= result.started_at);
    }

    #[test]
    fn test_reliability_rules() {
        let mut result = CollectionResult::default();
        assert!(!result.is_reliable());

        result.successful_fetches = 1;
        assert!(result.is_reliable());

        result.errors = vec!["a".into(), "b".into()];
        result.lines = vec!["x".into(), "y".into()];
        assert!(!result.is_reliable());

        result.lines.push("z".into());
        assert!(result.is_reliable());
    }
}

mod analyzer_tests {
    use super::*;

    #[test]
    fn test_empty_input_passes() {
        let report = analyze_lines::<String>(&[], 100);
        assert!(report.passed);
        assert_eq!(report.errors, 0);
        assert_eq!(report.ptp4l_stats.sample_count, 0);
    }

    #[test]
    fn test_statistics_on_absolute_offsets() {
        let lines = vec![ptp4l_line(-40, "s2"), ptp4l_line(10, "s2"), ptp4l_line(-4, "s2")];
        let report = analyze_lines(&lines, 100);

        assert!(report.passed);
        assert_eq!(report.ptp4l_stats.sample_count, 3);
        assert_eq!(report.ptp4l_stats.max_abs, 40);
        assert_eq!(report.ptp4l_stats.min_abs, 4);
        assert!((report.ptp4l_stats.mean_abs - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_phc2sys_lines_and_dropped_offsets() {
        let lines = vec![
            "phc2sys[1.0]: [ptp4l.0.config] CLOCK_REALTIME phc offset 7 s2 freq -91 delay 498".to_string(),
            "ptp4l[1.0]: [ptp4l.0.config] master offset abc s2 freq 1 path delay 5".to_string(),
            "ptp4l[1.0]: port 1: announce received".to_string(),
        ];
        let report = analyze_lines(&lines, 100);

        assert_eq!(report.phc2sys_stats.sample_count, 1);
        assert_eq!(report.ptp4l_stats.sample_count, 0);
        assert_eq!(report.dropped, 1);
        assert!(report.passed);
    }

    #[test]
    fn test_state_transition_and_timeout_fail() {
        let lines = vec![
            ptp4l_line(900, "s0"),
            ptp4l_line(3, "s2"),
            "ptp4l[2.0]: timed out while polling for tx timestamp".to_string(),
            "ptp4l[2.0]: increasing tx_timestamp_timeout may correct this issue".to_string(),
        ];
        let report = analyze_lines(&lines, 100);

        assert!(!report.passed);
        assert_eq!(report.state_transitions.len(), 1);
        assert_eq!(report.state_transitions[0].from, "s0");
        assert_eq!(report.timeout_lines, 1);
        // the s0 offset is not a violation, only s2 samples are checked
        assert_eq!(report.ptp4l_violations, 0);
        assert_eq!(report.errors, 2);
    }

    #[test]
    fn test_unreliable_collection_fails() {
        let result = CollectionResult {
            node_name: "node-0".into(),
            errors: vec!["reset".into()],
            ..Default::default()
        };
        let report = analyze_collection(&result, 100);
        assert!(!report.passed);
        assert!(report.details[0].contains("unreliable"));
    }

    #[test]
    fn test_message_lists_failures_and_stats() {
        let lines = vec![ptp4l_line(500, "s2"), "Starting ptp4l".to_string()];
        let report = analyze_lines(&lines, 100);
        let message = report.message();

        assert!(message.contains("failed with 1 errors"));
        assert!(message.contains("ptp4l offsets: samples=1 max_abs=500ns"));
        assert!(message.contains("ptp4l restarts: 1"));
    }
}
