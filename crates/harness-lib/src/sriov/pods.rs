//! Client/server test pods and the checks run inside them

use crate::error::{HarnessError, Result};
use crate::exec::{PodBackend, PodRef};
use crate::poll::poll_until_timeout;
use k8s_openapi::api::core::v1::{Capabilities, Container, Pod, PodSpec, SecurityContext};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";
pub const SECONDARY_INTERFACE: &str = "net1";

/// Substrings of exec failures worth retrying
const TRANSIENT_MARKERS: &[&str] = &[
    "use of closed network connection",
    "connection refused",
    "i/o timeout",
    "connection reset",
    "error dialing backend",
];

/// One pod of a traffic test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPodSpec {
    pub name: String,
    /// CIDR address on the secondary network, e.g. `192.168.0.1/24`
    pub ip: String,
    pub mac: String,
    pub node: Option<String>,
}

impl TestPodSpec {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, mac: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            mac: mac.into(),
            node: None,
        }
    }

    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Address without the prefix length
    pub fn address(&self) -> &str {
        self.ip.split('/').next().unwrap_or(&self.ip)
    }
}

/// Multus annotation attaching `network` with a static address and MAC
pub fn networks_annotation(network: &str, ip: &str, mac: &str) -> String {
    serde_json::json!([{ "name": network, "ips": [ip], "mac": mac }]).to_string()
}

pub fn build_test_pod(spec: &TestPodSpec, namespace: &str, network: &str, image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([("app".to_string(), "sriov-test".to_string())])),
            annotations: Some(BTreeMap::from([(
                NETWORKS_ANNOTATION.to_string(),
                networks_annotation(network, &spec.ip, &spec.mac),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: spec.node.clone(),
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(0),
            containers: vec![Container {
                name: "test".to_string(),
                image: Some(image.to_string()),
                command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    capabilities: Some(Capabilities {
                        add: Some(vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()]),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Link state read from `ip link show`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Down,
    NoCarrier,
}

fn flags_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([A-Z0-9_,-]*)>").expect("flags regex is valid"))
}

pub fn parse_link_status(output: &str) -> Option<LinkStatus> {
    let flags: Vec<&str> = flags_regex()
        .captures(output)?
        .get(1)?
        .as_str()
        .split(',')
        .collect();

    if flags.contains(&"NO-CARRIER") {
        Some(LinkStatus::NoCarrier)
    } else if flags.contains(&"UP") && !flags.contains(&"DOWN") && !output.contains("state DOWN") {
        Some(LinkStatus::Up)
    } else {
        Some(LinkStatus::Down)
    }
}

pub fn is_transient_message(message: &str) -> bool {
    TRANSIENT_MARKERS.iter().any(|marker| message.contains(marker))
}

fn loss_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)% packet loss").expect("loss regex is valid"))
}

/// True only for explicit zero loss
pub fn ping_succeeded(output: &str) -> bool {
    let zero_loss = match loss_regex().captures(output) {
        Some(caps) => caps[1].parse::<f64>().map(|loss| loss == 0.0).unwrap_or(false),
        None => false,
    };
    zero_loss || (output.contains(" 3 received") && !loss_regex().is_match(output))
}

/// Lines of `ip link show <pf>` that describe the VF with `mac`
pub fn vf_lines<'a>(output: &'a str, mac: &str) -> Vec<&'a str> {
    let mac = mac.to_ascii_lowercase();
    output
        .lines()
        .filter(|line| line.to_ascii_lowercase().contains(&mac))
        .collect()
}

/// Whether `line` reports spoof checking in the expected state
pub fn spoof_check_matches(line: &str, enabled: bool) -> bool {
    let state = if enabled { "on" } else { "off" };
    [
        format!("spoof checking {}", state),
        format!("spoofchk {}", state),
        format!("spoofchk={}", state),
    ]
    .iter()
    .any(|needle| line.contains(needle.as_str()))
}

/// Check `net1` inside `pod`, retrying transient exec failures for `window`
///
/// `pod_exists` is consulted after each transient failure; a vanished pod ends
/// the retry with a contract error. A link without carrier is a skip.
pub async fn check_secondary_interface<F, Fut>(
    backend: &dyn PodBackend,
    pod: &PodRef,
    window: Duration,
    interval: Duration,
    mut pod_exists: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let argv: Vec<String> = ["ip", "link", "show", SECONDARY_INTERFACE]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let output = poll_until_timeout(
        &format!("{} in {}", SECONDARY_INTERFACE, pod),
        interval,
        window,
        true,
        || {
            let argv = argv.clone();
            let exists = pod_exists();
            async move {
                match backend.exec(pod, &argv).await {
                    Ok(output) => Ok(Some(output.combined())),
                    Err(e) if is_transient_message(&e.to_string()) => {
                        if !exists.await? {
                            return Err(HarnessError::Contract(format!("pod {} no longer exists", pod)));
                        }
                        debug!(pod = %pod, error = %e, "Transient interface check failure, retrying");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
        },
    )
    .await?;

    match parse_link_status(&output) {
        Some(LinkStatus::Up) => Ok(()),
        Some(LinkStatus::NoCarrier) => {
            warn!(pod = %pod, "Secondary interface has no carrier");
            Err(HarnessError::Skip(format!(
                "{} in {} has no carrier; physical link is down",
                SECONDARY_INTERFACE, pod
            )))
        }
        Some(LinkStatus::Down) => Err(HarnessError::Contract(format!(
            "{} in {} is not up: {}",
            SECONDARY_INTERFACE,
            pod,
            output.trim()
        ))),
        None => Err(HarnessError::Contract(format!(
            "unexpected `ip link` output in {}: {}",
            pod,
            output.trim()
        ))),
    }
}

/// `ping -c 3 <address>` from `pod`; any loss fails
pub async fn ping(backend: &dyn PodBackend, pod: &PodRef, address: &str) -> Result<()> {
    let argv: Vec<String> = ["ping", "-c", "3", address].iter().map(|s| s.to_string()).collect();
    let output = backend.exec(pod, &argv).await?.combined();
    if ping_succeeded(&output) {
        Ok(())
    } else {
        Err(HarnessError::Contract(format!(
            "ping from {} to {} lost packets: {}",
            pod,
            address,
            output.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock::MockPodBackend;
    use crate::exec::ExecOutput;
    use std::sync::atomic::Ordering;

    const UP: &str = "5: net1@if12: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc mq state UP mode DEFAULT\n    link/ether aa:aa:aa:aa:aa:01 brd ff:ff:ff:ff:ff:ff";
    const NO_CARRIER: &str = "5: net1: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500 qdisc mq state DOWN mode DEFAULT";
    const DOWN: &str = "5: net1: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN mode DEFAULT";

    const PF_OUTPUT: &str = "4: ens3f0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 state UP\n    link/ether b8:ce:f6:00:00:00 brd ff:ff:ff:ff:ff:ff\n    vf 0     link/ether AA:AA:AA:AA:AA:01 brd ff:ff:ff:ff:ff:ff, spoof checking off, link-state auto, trust on\n    vf 1     link/ether aa:aa:aa:aa:aa:02 brd ff:ff:ff:ff:ff:ff, spoof checking on, link-state auto, trust off";

    #[test]
    fn test_link_status() {
        assert_eq!(parse_link_status(UP), Some(LinkStatus::Up));
        assert_eq!(parse_link_status(NO_CARRIER), Some(LinkStatus::NoCarrier));
        assert_eq!(parse_link_status(DOWN), Some(LinkStatus::Down));
        assert_eq!(parse_link_status("Device \"net1\" does not exist."), None);
    }

    #[test]
    fn test_ping_verdicts() {
        assert!(ping_succeeded("3 packets transmitted, 3 received, 0% packet loss, time 2003ms"));
        assert!(!ping_succeeded("3 packets transmitted, 0 received, 100% packet loss, time 2040ms"));
        assert!(!ping_succeeded("3 packets transmitted, 2 received, 33.3333% packet loss, time 2003ms"));
        assert!(!ping_succeeded("connect: Network is unreachable"));
    }

    #[test]
    fn test_spoof_check_filtered_by_mac() {
        let lines = vf_lines(PF_OUTPUT, "aa:aa:aa:aa:aa:01");
        assert_eq!(lines.len(), 1);
        assert!(spoof_check_matches(lines[0], false));
        assert!(!spoof_check_matches(lines[0], true));
        assert!(spoof_check_matches("vf 1 MAC aa:aa:aa:aa:aa:02, spoofchk=on", true));
    }

    #[test]
    fn test_annotation_and_pod() {
        let spec = TestPodSpec::new("client", "192.168.0.1/24", "aa:aa:aa:aa:aa:01").on_node("worker-0");
        assert_eq!(spec.address(), "192.168.0.1");

        let pod = build_test_pod(&spec, "sriov-test", "n0", "quay.io/test:latest");
        let annotation = &pod.metadata.annotations.unwrap()[NETWORKS_ANNOTATION];
        let parsed: serde_json::Value = serde_json::from_str(annotation).unwrap();
        assert_eq!(parsed[0]["name"], "n0");
        assert_eq!(parsed[0]["ips"][0], "192.168.0.1/24");
        assert_eq!(parsed[0]["mac"], "aa:aa:aa:aa:aa:01");
        assert_eq!(pod.spec.unwrap().node_name.as_deref(), Some("worker-0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interface_check_retries_transient_errors() {
        let backend = MockPodBackend::new().on_exec(|_, _, call| {
            if call < 2 {
                Err(HarnessError::transient("exec", "dial tcp: i/o timeout"))
            } else {
                MockPodBackend::stdout(UP)
            }
        });
        let pod = PodRef::new("sriov-test", "client");

        check_secondary_interface(&backend, &pod, Duration::from_secs(30), Duration::from_secs(3), || async {
            Ok(true)
        })
        .await
        .unwrap();
        assert_eq!(backend.execs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interface_check_stops_when_pod_is_gone() {
        let backend = MockPodBackend::new()
            .on_exec(|_, _, _| Err(HarnessError::transient("exec", "connection refused")));
        let pod = PodRef::new("sriov-test", "client");

        let err = check_secondary_interface(&backend, &pod, Duration::from_secs(30), Duration::from_secs(3), || async {
            Ok(false)
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no longer exists"));
        assert_eq!(backend.execs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_carrier_is_a_skip() {
        let backend = MockPodBackend::new().on_exec(|_, _, _| MockPodBackend::stdout(NO_CARRIER));
        let pod = PodRef::new("sriov-test", "client");

        let err = check_secondary_interface(&backend, &pod, Duration::from_secs(5), Duration::from_secs(1), || async {
            Ok(true)
        })
        .await
        .unwrap_err();
        assert!(err.is_skip());
    }

    #[tokio::test]
    async fn test_ping_uses_three_packets() {
        let backend = MockPodBackend::new().on_exec(|_, argv, _| {
            assert_eq!(argv, ["ping", "-c", "3", "192.168.0.2"]);
            Ok(ExecOutput {
                stdout: b"3 packets transmitted, 3 received, 0% packet loss".to_vec(),
                stderr: String::new(),
            })
        });
        ping(&backend, &PodRef::new("sriov-test", "client"), "192.168.0.2").await.unwrap();
    }
}
