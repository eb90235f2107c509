//! SR-IOV environment setup and traffic checks
//!
//! This module provides:
//! - Policy placement with per-node fallback and convergence waits
//! - SriovNetwork creation with NetworkAttachmentDefinition and VF checks
//! - Client/server pods, secondary interface checks, ping and spoof checks

mod convergence;
mod network;
mod pods;
mod policy;

pub use convergence::{allocatable_vfs, blocking_reason, node_healthy, pool_blocking, SYNC_SUCCEEDED};
pub use network::{build_network, NetworkRequest};
pub use pods::{
    build_test_pod, check_secondary_interface, is_transient_message, networks_annotation,
    parse_link_status, ping, ping_succeeded, spoof_check_matches, vf_lines, LinkStatus,
    TestPodSpec, NETWORKS_ANNOTATION, SECONDARY_INTERFACE,
};
pub use policy::{
    build_policy, find_interface, is_bcm_vendor, normalize_pci_id, pf_names, AppliedPolicy,
    DeviceType, PolicyRequest, BCM_VENDOR_ID,
};

use crate::config::{worker_label_selector, HarnessConfig};
use crate::crds::{
    MachineConfigPool, NetworkAttachmentDefinition, SriovNetwork, SriovNetworkNodePolicy,
    SriovNetworkNodeState,
};
use crate::error::{HarnessError, Result};
use crate::exec::{DebugPodExecutor, PodBackend, PodRef};
use crate::poll::poll_until_timeout;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(35 * 60);
const CONVERGENCE_INTERVAL: Duration = Duration::from_secs(10);
const NAD_TIMEOUT: Duration = Duration::from_secs(120);
const ALLOCATABLE_TIMEOUT: Duration = Duration::from_secs(180);
const POD_READY_TIMEOUT: Duration = Duration::from_secs(300);
const INTERFACE_RETRY_WINDOW: Duration = Duration::from_secs(30);
const INTERFACE_RETRY_INTERVAL: Duration = Duration::from_secs(3);
const HOST_EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// Drives the SR-IOV operator and the traffic pods of a test
#[derive(Clone)]
pub struct SriovEnvironment {
    client: Client,
    config: Arc<HarnessConfig>,
    backend: Arc<dyn PodBackend>,
    host: DebugPodExecutor,
}

impl SriovEnvironment {
    pub fn new(client: Client, config: Arc<HarnessConfig>, backend: Arc<dyn PodBackend>) -> Self {
        let host = DebugPodExecutor::new(
            client.clone(),
            backend.clone(),
            config.sriov_test_namespace.clone(),
            config.debug_pod_image.clone(),
        );
        Self {
            client,
            config,
            backend,
            host,
        }
    }

    fn operator_api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.config.sriov_namespace)
    }

    /// Place the policy on the first candidate node that converges
    pub async fn apply_policy(&self, request: &PolicyRequest) -> Result<AppliedPolicy> {
        request.validate()?;
        let states: Api<SriovNetworkNodeState> = self.operator_api();
        let policies: Api<SriovNetworkNodePolicy> = self.operator_api();
        let mut errors = Vec::new();

        for node in &request.candidate_nodes {
            let Some(state) = states.get_opt(node).await? else {
                warn!(node = %node, "No SriovNetworkNodeState for candidate node");
                continue;
            };
            let Some(interface) = find_interface(
                &state,
                &request.vendor,
                &request.device_id,
                request.interface_name.as_deref(),
            ) else {
                info!(node = %node, vendor = %request.vendor, device = %request.device_id, "No matching NIC on node");
                continue;
            };

            let policy = build_policy(request, &self.config.sriov_namespace, node, &interface);
            info!(policy = %request.name, node = %node, interface = %interface, "Creating SriovNetworkNodePolicy");
            policies.create(&PostParams::default(), &policy).await?;

            match self.wait_for_convergence().await {
                Ok(()) => {
                    return Ok(AppliedPolicy {
                        name: request.name.clone(),
                        node: node.clone(),
                        interface,
                        resource_name: request.resource_name.clone(),
                    })
                }
                Err(e) => {
                    warn!(policy = %request.name, node = %node, error = %e, "Policy did not converge, trying next node");
                    self.delete_policy(&request.name).await;
                    errors.push(e.context("apply policy", node.as_str()));
                }
            }
        }

        HarnessError::join(errors)?;
        Err(HarnessError::Precondition(format!(
            "no candidate node has a {}:{} NIC",
            request.vendor, request.device_id
        )))
    }

    /// Wait until node states, the worker pool and worker nodes are all settled
    pub async fn wait_for_convergence(&self) -> Result<()> {
        let states: Api<SriovNetworkNodeState> = self.operator_api();
        let pools: Api<MachineConfigPool> = Api::all(self.client.clone());
        let nodes: Api<Node> = Api::all(self.client.clone());
        let pool_name = self.config.worker_pool_name().to_string();
        let node_params = ListParams::default().labels(&worker_label_selector(&self.config.worker_label));

        let last = Mutex::new(None::<String>);
        let last_seen = &last;
        let result = poll_until_timeout("SR-IOV convergence", CONVERGENCE_INTERVAL, CONVERGENCE_TIMEOUT, false, || {
            let (states, pools, nodes) = (states.clone(), pools.clone(), nodes.clone());
            let (pool_name, node_params) = (pool_name.clone(), node_params.clone());
            async move {
                // API errors during node reboots are expected; keep polling
                let snapshot = async {
                    let states = states.list(&ListParams::default()).await?.items;
                    let pool = pools.get_opt(&pool_name).await?;
                    let nodes = nodes.list(&node_params).await?.items;
                    Ok::<_, kube::Error>(blocking_reason(&states, pool.as_ref(), &nodes))
                };
                let observation = match snapshot.await {
                    Ok(None) => return Ok(Some(())),
                    Ok(Some(reason)) => reason,
                    Err(e) => e.to_string(),
                };
                if let Ok(mut slot) = last_seen.lock() {
                    *slot = Some(observation);
                }
                Ok(None)
            }
        })
        .await;

        result.map_err(|e| match e {
            HarnessError::Timeout { operation, elapsed, .. } => HarnessError::Timeout {
                operation,
                elapsed,
                last_observation: last.lock().ok().and_then(|mut slot| slot.take()),
            },
            other => other,
        })
    }

    async fn delete_policy(&self, name: &str) {
        let policies: Api<SriovNetworkNodePolicy> = self.operator_api();
        if let Err(e) = policies.delete(name, &DeleteParams::default()).await {
            warn!(policy = %name, error = %e, "Failed to delete SriovNetworkNodePolicy");
        }
    }

    /// Create the network, then wait for its NAD and (best effort) its VF resource
    pub async fn create_network(&self, request: &NetworkRequest) -> Result<SriovNetwork> {
        let network = build_network(request, &self.config.sriov_namespace)?;
        let networks: Api<SriovNetwork> = self.operator_api();
        let created = networks.create(&PostParams::default(), &network).await?;
        info!(network = %request.name, namespace = %request.network_namespace, "Created SriovNetwork");

        let policies: Api<SriovNetworkNodePolicy> = self.operator_api();
        let has_policy = policies
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .any(|p| p.spec.resource_name == request.resource_name);
        if !has_policy {
            return Err(HarnessError::Precondition(format!(
                "no SriovNetworkNodePolicy provides resource {}",
                request.resource_name
            )));
        }

        let nads: Api<NetworkAttachmentDefinition> =
            Api::namespaced(self.client.clone(), &request.network_namespace);
        poll_until_timeout(
            &format!("NetworkAttachmentDefinition {}", request.name),
            Duration::from_secs(2),
            NAD_TIMEOUT,
            true,
            || {
                let nads = nads.clone();
                async move { Ok(nads.get_opt(&request.name).await?.map(|_| ())) }
            },
        )
        .await?;

        if let Err(e) = self.wait_for_allocatable(&request.resource_name).await {
            warn!(resource = %request.resource_name, error = %e, "VF resource not advertised yet, continuing");
        }

        Ok(created)
    }

    async fn wait_for_allocatable(&self, resource_name: &str) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&worker_label_selector(&self.config.worker_label));
        poll_until_timeout(
            &format!("allocatable openshift.io/{}", resource_name),
            Duration::from_secs(5),
            ALLOCATABLE_TIMEOUT,
            true,
            || {
                let (nodes, params) = (nodes.clone(), params.clone());
                async move {
                    let items = nodes.list(&params).await?.items;
                    Ok(items
                        .iter()
                        .any(|node| allocatable_vfs(node, resource_name) > 0)
                        .then_some(()))
                }
            },
        )
        .await
    }

    /// Create the test namespace if it does not exist
    pub async fn ensure_namespace(&self) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let name = &self.config.sriov_test_namespace;
        if namespaces.get_opt(name).await?.is_some() {
            return Ok(());
        }
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        namespaces.create(&PostParams::default(), &namespace).await?;
        Ok(())
    }

    /// Create the pods on `network` and wait until all of them are Ready
    pub async fn create_test_pods(&self, network: &str, specs: &[TestPodSpec]) -> Result<Vec<PodRef>> {
        let namespace = &self.config.sriov_test_namespace;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        for spec in specs {
            let pod = build_test_pod(spec, namespace, network, &self.config.sriov_test_image);
            pods.create(&PostParams::default(), &pod).await?;
        }

        let waits = specs.iter().map(|spec| self.wait_for_pod_ready(&pods, &spec.name));
        let results = futures::future::join_all(waits).await;
        HarnessError::join(results.into_iter().filter_map(|r| r.err()).collect())?;

        Ok(specs.iter().map(|spec| PodRef::new(namespace, &spec.name)).collect())
    }

    async fn wait_for_pod_ready(&self, pods: &Api<Pod>, name: &str) -> Result<()> {
        poll_until_timeout(&format!("pod {} ready", name), Duration::from_secs(2), POD_READY_TIMEOUT, true, || {
            let pods = pods.clone();
            async move {
                let Some(pod) = pods.get_opt(name).await? else {
                    return Ok(None);
                };
                let ready = pod
                    .status
                    .and_then(|s| s.conditions)
                    .unwrap_or_default()
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True");
                Ok(ready.then_some(()))
            }
        })
        .await
    }

    /// `net1` must be up with carrier; no carrier is a skip
    pub async fn verify_interface(&self, pod: &PodRef) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        check_secondary_interface(
            self.backend.as_ref(),
            pod,
            INTERFACE_RETRY_WINDOW,
            INTERFACE_RETRY_INTERVAL,
            || {
                let pods = pods.clone();
                let name = pod.name.clone();
                async move { Ok(pods.get_opt(&name).await?.is_some()) }
            },
        )
        .await
    }

    pub async fn ping(&self, client: &PodRef, address: &str) -> Result<()> {
        ping(self.backend.as_ref(), client, address).await
    }

    /// Check the kernel's spoof checking flag for the VF carrying `mac` on `pf`
    pub async fn verify_spoof_check(&self, node: &str, pf: &str, mac: &str, enabled: bool) -> Result<()> {
        let argv: Vec<String> = ["ip", "link", "show", pf].iter().map(|s| s.to_string()).collect();
        let output = self.host.exec_on_host(node, &argv, HOST_EXEC_TIMEOUT).await?;
        let lines = vf_lines(&output, mac);
        if lines.is_empty() {
            return Err(HarnessError::Contract(format!("no VF with MAC {} on {} of {}", mac, pf, node)));
        }
        if lines.iter().any(|line| spoof_check_matches(line, enabled)) {
            Ok(())
        } else {
            Err(HarnessError::Contract(format!(
                "spoof checking is not {} for {} on {}: {}",
                if enabled { "on" } else { "off" },
                mac,
                pf,
                lines.join(" | ")
            )))
        }
    }

    /// Delete test pods, the network and the policy; failures are logged only
    pub async fn cleanup(&self, policy: Option<&str>, network: Option<&str>, pods: &[PodRef]) {
        for pod in pods {
            let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
            if let Err(e) = api.delete(&pod.name, &DeleteParams::default().grace_period(0)).await {
                warn!(pod = %pod, error = %e, "Failed to delete test pod");
            }
        }
        if let Some(network) = network {
            let networks: Api<SriovNetwork> = self.operator_api();
            if let Err(e) = networks.delete(network, &DeleteParams::default()).await {
                warn!(network = %network, error = %e, "Failed to delete SriovNetwork");
            }
        }
        if let Some(policy) = policy {
            self.delete_policy(policy).await;
            if let Err(e) = self.wait_for_convergence().await {
                warn!(policy = %policy, error = %e, "Cluster did not settle after policy removal");
            }
        }
    }
}
