//! CLI integration tests

use std::io::Write;
use std::process::{Command, Output};

fn telco_e2e(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_telco-e2e"))
        .args(args)
        .env_remove("TELCO_E2E_CONFIG")
        .env("NO_COLOR", "1")
        .output()
        .expect("Failed to execute command")
}

fn ptp4l_line(seq: usize, offset: i64) -> String {
    format!(
        "ptp4l[{}.000]: [ptp4l.0.config] master offset {} s2 freq -2341 path delay 512",
        9000 + seq,
        offset
    )
}

fn log_file(lines: &[String]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
    file
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = telco_e2e(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("PTP and SR-IOV"), "Should show app description");
    for command in [
        "topology",
        "analyze",
        "collect-stability",
        "assert-clock-state",
        "nic-report",
        "must-gather",
        "snapshot",
        "restore",
        "host-exec",
        "scenario",
    ] {
        assert!(stdout.contains(command), "Should show {} command", command);
    }
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = telco_e2e(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("telco-e2e"), "Should show binary name");
}

/// Test scenario subcommand help lists every scenario
#[test]
fn test_scenario_help() {
    let output = telco_e2e(&["scenario", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Scenario help should succeed");
    assert!(stdout.contains("pod-restart"));
    assert!(stdout.contains("interface-flap"));
    assert!(stdout.contains("gnss-fallback"));
    assert!(stdout.contains("--holdover-secs"));
}

/// Test assert-clock-state help
#[test]
fn test_assert_clock_state_help() {
    let output = telco_e2e(&["assert-clock-state", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--stable-for-secs"));
    assert!(stdout.contains("--timeout-secs"));
}

/// Test offline analysis of a clean window
#[test]
fn test_analyze_clean_log() {
    let mut lines = vec!["Starting ptp4l".to_string()];
    lines.extend((0..60).map(|i| ptp4l_line(i, (i as i64 % 21) - 10)));
    let file = log_file(&lines);

    let output = telco_e2e(&["analyze", file.path().to_str().unwrap()]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("Stability check passed"));
}

/// Test offline analysis fails on an offset spike
#[test]
fn test_analyze_spike_fails() {
    let lines: Vec<String> = vec![ptp4l_line(0, 3), ptp4l_line(1, 1200), ptp4l_line(2, -4)];
    let file = log_file(&lines);

    let output = telco_e2e(&["analyze", file.path().to_str().unwrap(), "--threshold-ns", "100"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(!output.status.success(), "Spike should fail the check");
    assert!(stdout.contains("ptp4l s2 offset violations"));
}

/// Test JSON output of offline analysis
#[test]
fn test_analyze_json_output() {
    let file = log_file(&[ptp4l_line(0, 7), ptp4l_line(1, -7)]);

    let output = telco_e2e(&["analyze", file.path().to_str().unwrap(), "--format", "json"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let json_start = stdout.find('{').expect("JSON object in output");
    let json_end = stdout.rfind('}').expect("JSON object in output");
    let value: serde_json::Value = serde_json::from_str(&stdout[json_start..=json_end]).unwrap();

    assert!(output.status.success());
    let report = value.as_object().unwrap().values().next().unwrap();
    assert_eq!(report["passed"], true);
    assert_eq!(report["ptp4l_stats"]["sample_count"], 2);
}

/// Test missing file reports an error
#[test]
fn test_analyze_missing_file() {
    let output = telco_e2e(&["analyze", "/nonexistent/ptp-daemon.log"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to read"));
}
