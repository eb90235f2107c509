//! Privileged host-namespace debug pods
//!
//! A debug pod is pinned to a node with host networking and host PID, and
//! commands are run against pid 1 through `nsenter`. Arguments always travel
//! as an argv vector; callers that need a shell must pass `sh -c` themselves.

use super::{PodBackend, PodRef};
use crate::cleanup::CleanupGuard;
use crate::error::{HarnessError, Result};
use crate::poll::poll_until_timeout;
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, Pod, PodSpec, SecurityContext, Toleration, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const NAME_PREFIX: &str = "debug-host-";
const CONTAINER_NAME: &str = "debug";
const MAX_NAME_LEN: usize = 63;
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// DNS-1123 pod name for the debug pod on `node`
pub fn debug_pod_name(node: &str) -> String {
    let mut name: String = format!("{}{}", NAME_PREFIX, node)
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    name.truncate(MAX_NAME_LEN);
    name.trim_end_matches('-').to_string()
}

/// Wrap `cmd` so it runs in every namespace of the host's pid 1
pub fn nsenter_argv(cmd: &[String]) -> Vec<String> {
    let mut argv: Vec<String> = [
        "nsenter", "--target", "1", "--mount", "--uts", "--ipc", "--net", "--pid", "--",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    argv.extend(cmd.iter().cloned());
    argv
}

/// Creates, uses and tears down debug pods
#[derive(Clone)]
pub struct DebugPodExecutor {
    client: Client,
    backend: Arc<dyn PodBackend>,
    namespace: String,
    image: String,
}

impl DebugPodExecutor {
    pub fn new(
        client: Client,
        backend: Arc<dyn PodBackend>,
        namespace: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            client,
            backend,
            namespace: namespace.into(),
            image: image.into(),
        }
    }

    /// Run `cmd` in the host namespaces of `node` and return its stdout
    ///
    /// The pod is deleted on every exit path, including timeout.
    pub async fn exec_on_host(&self, node: &str, cmd: &[String], timeout: Duration) -> Result<String> {
        let name = debug_pod_name(node);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let cleanup = CleanupGuard::new(
            format!("debug pod {}", name),
            CLEANUP_TIMEOUT,
            delete_and_wait(pods.clone(), name.clone(), None),
        );

        let result = match tokio::time::timeout(timeout, self.run(&pods, node, &name, cmd, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::timeout(
                format!("host command {:?} on {}", cmd, node),
                timeout,
            )),
        };
        cleanup.run().await;

        result.map_err(|e| e.context("exec on host", node))
    }

    async fn run(&self, pods: &Api<Pod>, node: &str, name: &str, cmd: &[String], timeout: Duration) -> Result<String> {
        delete_and_wait(pods.clone(), name.to_string(), Some(0)).await;

        pods.create(&PostParams::default(), &build_debug_pod(name, &self.namespace, node, &self.image))
            .await?;
        info!(pod = %name, node = %node, "Created debug pod");

        poll_until_timeout(
            &format!("debug pod {} running", name),
            POLL_INTERVAL,
            timeout,
            true,
            || {
                let pods = pods.clone();
                async move {
                    let pod = match pods.get_opt(name).await {
                        Ok(pod) => pod,
                        Err(e) => {
                            debug!(pod = %name, error = %e, "Debug pod lookup failed");
                            return Ok(None);
                        }
                    };
                    match pod_phase(pod.as_ref()) {
                        Some("Running") => Ok(Some(())),
                        Some(phase @ ("Failed" | "Succeeded")) => Err(HarnessError::Contract(
                            format!("debug pod {} terminated early in phase {}", name, phase),
                        )),
                        _ => Ok(None),
                    }
                }
            },
        )
        .await?;

        let pod = PodRef::new(&self.namespace, name).with_container(CONTAINER_NAME);
        let output = self.backend.exec(&pod, &nsenter_argv(cmd)).await?;
        Ok(output.stdout_lossy())
    }
}

/// Delete the pod if present and wait until it is gone. Failures are logged only.
async fn delete_and_wait(pods: Api<Pod>, name: String, grace_period: Option<u32>) {
    let name = name.as_str();
    let params = match grace_period {
        Some(seconds) => DeleteParams::default().grace_period(seconds),
        None => DeleteParams::default(),
    };

    match pods.delete(name, &params).await {
        Ok(_) => {}
        Err(kube::Error::Api(response)) if response.code == 404 => return,
        Err(e) => {
            warn!(pod = %name, error = %e, "Failed to delete debug pod");
            return;
        }
    }

    let gone = poll_until_timeout(
        &format!("debug pod {} deleted", name),
        Duration::from_secs(1),
        CLEANUP_TIMEOUT,
        true,
        || {
            let pods = pods.clone();
            async move {
                match pods.get_opt(name).await {
                    Ok(None) => Ok(Some(())),
                    _ => Ok(None),
                }
            }
        },
    )
    .await;

    if let Err(e) = gone {
        warn!(pod = %name, error = %e, "Debug pod still present");
    }
}

fn pod_phase(pod: Option<&Pod>) -> Option<&str> {
    pod?.status.as_ref()?.phase.as_deref()
}

/// Privileged pod pinned to `node` sharing the host's network and PID namespaces
pub(crate) fn build_debug_pod(name: &str, namespace: &str, node: &str, image: &str) -> Pod {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "telco-e2e-debug".to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            host_network: Some(true),
            host_pid: Some(true),
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(1),
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(image.to_string()),
                command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    run_as_user: Some(0),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![VolumeMount {
                    name: "host".to_string(),
                    mount_path: "/host".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "host".to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: "/".to_string(),
                    type_: Some("Directory".to_string()),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_pod_name_is_dns1123() {
        assert_eq!(debug_pod_name("Worker-0.Example.com"), "debug-host-worker-0-example-com");

        let long = format!("{}.lab", "n".repeat(80));
        let name = debug_pod_name(&long);
        assert!(name.len() <= 63);
        assert!(!name.ends_with('-'));
    }

    #[test]
    fn test_nsenter_argv_keeps_arguments_separate() {
        let argv = nsenter_argv(&["ip".to_string(), "link".to_string(), "show".to_string(), "x; rm -rf /".to_string()]);
        assert_eq!(&argv[..3], &["nsenter", "--target", "1"]);
        assert_eq!(argv[8], "--");
        assert_eq!(argv.last().map(String::as_str), Some("x; rm -rf /"));
    }

    #[test]
    fn test_build_debug_pod() {
        let pod = build_debug_pod("debug-host-n0", "default", "n0", "ubi");
        let spec = pod.spec.unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("n0"));
        assert_eq!(spec.host_network, Some(true));
        assert_eq!(spec.host_pid, Some(true));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.termination_grace_period_seconds, Some(1));
        let security = spec.containers[0].security_context.as_ref().unwrap();
        assert_eq!(security.privileged, Some(true));
    }
}
