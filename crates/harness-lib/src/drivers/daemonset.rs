//! PTP daemonset readiness and daemon pod restarts

use crate::error::{HarnessError, Result};
use crate::exec::{PodBackend, PodQuery};
use crate::poll::poll_until_timeout;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams};
use kube::Client;
use std::time::Duration;
use tracing::info;

/// Every scheduled pod is updated and ready, and the controller has seen the latest spec
pub fn daemonset_ready(daemonset: &DaemonSet) -> bool {
    let Some(status) = daemonset.status.as_ref() else {
        return false;
    };
    let generation = daemonset.metadata.generation.unwrap_or(0);
    let observed = status.observed_generation.unwrap_or(0);

    observed >= generation
        && status.desired_number_scheduled > 0
        && status.number_ready == status.desired_number_scheduled
        && status.updated_number_scheduled.unwrap_or(0) == status.desired_number_scheduled
}

pub async fn wait_for_daemonset_ready(client: &Client, namespace: &str, name: &str, timeout: Duration) -> Result<()> {
    let api: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    poll_until_timeout(
        &format!("daemonset {}/{} ready", namespace, name),
        Duration::from_secs(5),
        timeout,
        true,
        || {
            let api = api.clone();
            async move {
                let ready = api.get_opt(name).await?.as_ref().map(daemonset_ready).unwrap_or(false);
                Ok(ready.then_some(()))
            }
        },
    )
    .await?;
    info!(namespace = %namespace, daemonset = %name, "Daemonset ready");
    Ok(())
}

/// Delete the pod matching `query` on `node`; returns its name
pub async fn delete_daemon_pod(
    client: &Client,
    backend: &dyn PodBackend,
    query: &PodQuery,
    node: &str,
) -> Result<String> {
    let pod = backend.find_pod(query, node).await?;
    let api: Api<Pod> = Api::namespaced(client.clone(), &pod.namespace);
    api.delete(&pod.name, &DeleteParams::default())
        .await
        .map_err(|e| HarnessError::from(e).context("delete daemon pod", node))?;
    info!(node = %node, pod = %pod.name, "Deleted PTP daemon pod");
    Ok(pod.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn daemonset(generation: i64, status: serde_json::Value) -> DaemonSet {
        serde_json::from_value(json!({
            "metadata": {"name": "linuxptp-daemon", "generation": generation},
            "status": status
        }))
        .unwrap()
    }

    #[test]
    fn test_ready_when_all_scheduled_pods_ready() {
        let ds = daemonset(
            3,
            json!({"observedGeneration": 3, "desiredNumberScheduled": 2, "numberReady": 2,
                   "updatedNumberScheduled": 2, "currentNumberScheduled": 2, "numberMisscheduled": 0}),
        );
        assert!(daemonset_ready(&ds));
    }

    #[test]
    fn test_not_ready_while_rolling() {
        let rolling = daemonset(
            3,
            json!({"observedGeneration": 3, "desiredNumberScheduled": 2, "numberReady": 1,
                   "updatedNumberScheduled": 2, "currentNumberScheduled": 2, "numberMisscheduled": 0}),
        );
        let stale = daemonset(
            4,
            json!({"observedGeneration": 3, "desiredNumberScheduled": 2, "numberReady": 2,
                   "updatedNumberScheduled": 2, "currentNumberScheduled": 2, "numberMisscheduled": 0}),
        );
        assert!(!daemonset_ready(&rolling));
        assert!(!daemonset_ready(&stale));
    }
}
