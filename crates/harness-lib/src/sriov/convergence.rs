//! SR-IOV operator convergence
//!
//! Convergence holds when every node state reports `Succeeded`, the worker
//! MachineConfigPool is `Updated` and not `Degraded`, and every worker node is
//! `Ready` without memory or disk pressure. Each check returns the first
//! thing still blocking, so a timeout can name it.

use crate::crds::{MachineConfigPool, SriovNetworkNodeState};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

pub const SYNC_SUCCEEDED: &str = "Succeeded";

pub fn node_states_blocking(states: &[SriovNetworkNodeState]) -> Option<String> {
    states.iter().find_map(|state| {
        let status = state.status.as_ref();
        let sync = status.and_then(|s| s.sync_status.as_deref()).unwrap_or("");
        (sync != SYNC_SUCCEEDED).then(|| {
            let error = status.and_then(|s| s.last_sync_error.as_deref()).unwrap_or("");
            format!(
                "node state {} sync status {:?}{}",
                state.name_any(),
                sync,
                if error.is_empty() { String::new() } else { format!(" ({})", error) }
            )
        })
    })
}

/// `None` pool means the cluster has no such pool, which counts as converged
pub fn pool_blocking(pool: Option<&MachineConfigPool>) -> Option<String> {
    let pool = pool?;
    let status = pool.status.clone().unwrap_or_default();
    if status.condition_true("Degraded") {
        return Some(format!("machine config pool {} is degraded", pool.name_any()));
    }
    if !status.condition_true("Updated") {
        return Some(format!("machine config pool {} is not updated", pool.name_any()));
    }
    None
}

fn condition_true(node: &Node, type_: &str) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| conditions.iter().any(|c| c.type_ == type_ && c.status == "True"))
        .unwrap_or(false)
}

pub fn node_healthy(node: &Node) -> bool {
    condition_true(node, "Ready") && !condition_true(node, "MemoryPressure") && !condition_true(node, "DiskPressure")
}

pub fn nodes_blocking(nodes: &[Node]) -> Option<String> {
    nodes
        .iter()
        .find(|node| !node_healthy(node))
        .map(|node| format!("node {} is not ready", node.name_any()))
}

/// First reason the cluster has not converged, if any
pub fn blocking_reason(
    states: &[SriovNetworkNodeState],
    pool: Option<&MachineConfigPool>,
    nodes: &[Node],
) -> Option<String> {
    node_states_blocking(states)
        .or_else(|| pool_blocking(pool))
        .or_else(|| nodes_blocking(nodes))
}

/// Number of `openshift.io/<resource>` devices a node advertises
pub fn allocatable_vfs(node: &Node, resource_name: &str) -> u64 {
    let key = format!("openshift.io/{}", resource_name);
    node.status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .and_then(|a| a.get(&key))
        .and_then(|q| q.0.parse::<u64>().ok())
        .unwrap_or(0)
}
