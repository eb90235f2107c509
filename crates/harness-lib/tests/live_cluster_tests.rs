//! Scenarios against a real OpenShift cluster
//!
//! Run with `cargo test -p harness-lib --test live_cluster_tests -- --ignored`
//! and a kubeconfig pointing at a cluster with the PTP and SR-IOV operators.
//! `TELCO_E2E_PROMETHEUS_URL` must name the Thanos querier route.

use harness_lib::nicinfo::NicRegistry;
use harness_lib::sriov::{DeviceType, NetworkRequest, PolicyRequest, TestPodSpec};
use harness_lib::{Harness, HarnessConfig};

async fn harness(suite: &str) -> Harness {
    let config = HarnessConfig::load(None).expect("load harness config");
    Harness::connect(config, suite).await.expect("connect to cluster")
}

#[tokio::test]
#[ignore = "requires an OpenShift cluster"]
async fn test_ptp_pod_restart_recovery() {
    let harness = harness("ptp").await;
    let topology = harness.discover_topology().await.unwrap();
    let node = topology.keys().next().expect("at least one PTP node").clone();

    let drivers = harness.drivers(NicRegistry::new()).await.unwrap();
    drivers.pod_restart_recovery(&node).await.unwrap();
}

#[tokio::test]
#[ignore = "requires an OpenShift cluster"]
async fn test_sriov_spoof_off_traffic() {
    let harness = harness("sriov").await;
    let sriov = harness.sriov();
    let namespace = harness.config().sriov_test_namespace.clone();
    let workers: Vec<String> = harness
        .worker_nodes()
        .await
        .unwrap()
        .into_iter()
        .map(|node| node.name)
        .collect();

    let policy = PolicyRequest {
        name: "p0".to_string(),
        resource_name: "p0res".to_string(),
        vendor: "15b3".to_string(),
        device_id: "1016".to_string(),
        interface_name: None,
        device_type: DeviceType::Netdevice,
        num_vfs: 4,
        candidate_nodes: workers,
    };
    let applied = match sriov.apply_policy(&policy).await {
        Err(e) if e.is_skip() => {
            eprintln!("skipping: {}", e);
            return;
        }
        other => other.unwrap(),
    };

    sriov.ensure_namespace().await.unwrap();
    let network = NetworkRequest {
        name: "n0".to_string(),
        resource_name: applied.resource_name.clone(),
        network_namespace: namespace,
        spoof_check: Some(false),
        trust: Some(true),
        vlan: Some(0),
        ..Default::default()
    };
    sriov.create_network(&network).await.unwrap();

    let client = TestPodSpec::new("client", "192.168.0.1/24", "aa:aa:aa:aa:aa:01").on_node(&applied.node);
    let server = TestPodSpec::new("server", "192.168.0.2/24", "aa:aa:aa:aa:aa:02").on_node(&applied.node);
    let pods = sriov
        .create_test_pods(&network.name, &[client.clone(), server.clone()])
        .await
        .unwrap();

    let outcome = async {
        sriov.verify_interface(&pods[0]).await?;
        sriov
            .verify_spoof_check(&applied.node, &applied.interface, &client.mac, false)
            .await?;
        sriov.ping(&pods[0], server.address()).await
    }
    .await;

    sriov.cleanup(Some(&policy.name), Some(&network.name), &pods).await;
    outcome.unwrap();
}
