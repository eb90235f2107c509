//! Must-gather collection for failed checks
//!
//! A throwaway privileged namespace hosts a two-container pod: `gather` runs
//! the image's collector into a shared emptyDir, `copy` idles so the result
//! can be streamed out as a tar archive once `gather` has exited cleanly.

use crate::cleanup::CleanupGuard;
use crate::error::{HarnessError, Result};
use crate::exec::{PodBackend, PodRef};
use crate::observability::StructuredLogger;
use crate::poll::poll_until_timeout;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, Namespace, Pod, PodSpec, SecurityContext,
    ServiceAccount, Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// File name of the archive inside a check's artifact directory
pub const TARBALL_NAME: &str = "ptp-must-gather.tar";

const POD_NAME: &str = "must-gather";
const SERVICE_ACCOUNT: &str = "must-gather-admin";
const GATHER_CONTAINER: &str = "gather";
const COPY_CONTAINER: &str = "copy";
const OUTPUT_DIR: &str = "/must-gather";
const RUNNING_TIMEOUT: Duration = Duration::from_secs(300);
const GATHER_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Replace every run of characters outside `[A-Za-z0-9_-]` with `_`
pub fn sanitize_spec_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// `<dump_dir>/<sanitized spec name>/`
pub fn artifact_dir(dump_dir: &Path, spec_name: &str) -> PathBuf {
    dump_dir.join(sanitize_spec_name(spec_name))
}

fn named(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

pub(crate) fn build_namespace(name: &str) -> Namespace {
    let labels = BTreeMap::from(
        [
            ("openshift.io/run-level", "0"),
            ("pod-security.kubernetes.io/enforce", "privileged"),
            ("pod-security.kubernetes.io/audit", "privileged"),
            ("pod-security.kubernetes.io/warn", "privileged"),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string())),
    );
    Namespace {
        metadata: ObjectMeta {
            labels: Some(labels),
            ..named(name, None)
        },
        ..Default::default()
    }
}

pub(crate) fn build_cluster_role_binding(name: &str, namespace: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: named(name, None),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: "cluster-admin".to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SERVICE_ACCOUNT.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

fn gather_container(name: &str, image: &str, script: &str) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        command: Some(vec!["/bin/bash".to_string(), "-c".to_string(), script.to_string()]),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: "must-gather-output".to_string(),
            mount_path: OUTPUT_DIR.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

pub(crate) fn build_gather_pod(namespace: &str, image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            labels: Some(BTreeMap::from([("app".to_string(), POD_NAME.to_string())])),
            ..named(POD_NAME, Some(namespace))
        },
        spec: Some(PodSpec {
            service_account_name: Some(SERVICE_ACCOUNT.to_string()),
            restart_policy: Some("Never".to_string()),
            priority_class_name: Some("system-cluster-critical".to_string()),
            node_selector: Some(BTreeMap::from([("kubernetes.io/os".to_string(), "linux".to_string())])),
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]),
            termination_grace_period_seconds: Some(0),
            containers: vec![
                gather_container(GATHER_CONTAINER, image, "/usr/bin/gather"),
                gather_container(COPY_CONTAINER, image, "trap : TERM INT; sleep infinity & wait"),
            ],
            volumes: Some(vec![Volume {
                name: "must-gather-output".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Exit code of the `gather` container once it has terminated
pub(crate) fn gather_exit_code(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|s| s.name == GATHER_CONTAINER)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|t| t.exit_code)
}

/// Stream `/must-gather` out of the copy container into `tarball`
pub(crate) async fn copy_out(backend: &dyn PodBackend, pod: &PodRef, tarball: &Path) -> Result<u64> {
    let argv: Vec<String> = ["tar", "cf", "-", "-C", OUTPUT_DIR, "."]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let output = backend.exec(pod, &argv).await?;
    if output.stdout.is_empty() {
        return Err(HarnessError::Contract(format!(
            "empty archive from {}: {}",
            pod,
            output.stderr.trim()
        )));
    }
    if let Some(parent) = tarball.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(tarball, &output.stdout).await?;
    Ok(output.stdout.len() as u64)
}

/// Runs must-gather and copies the result to the local filesystem
#[derive(Clone)]
pub struct MustGather {
    client: Client,
    backend: Arc<dyn PodBackend>,
    image: String,
    logger: StructuredLogger,
}

impl MustGather {
    pub fn new(client: Client, backend: Arc<dyn PodBackend>, image: impl Into<String>, logger: StructuredLogger) -> Self {
        Self {
            client,
            backend,
            image: image.into(),
            logger,
        }
    }

    /// Collect into `tarball`; the namespace and binding are removed on every path
    pub async fn run(&self, tarball: &Path) -> Result<u64> {
        let name = format!("ptp-must-gather-{}", Utc::now().timestamp());
        let cleanup = CleanupGuard::new(
            format!("must-gather namespace {}", name),
            CLEANUP_TIMEOUT,
            delete_gather_objects(self.client.clone(), name.clone()),
        );
        let result = self.gather(&name, tarball).await;
        cleanup.run().await;

        match &result {
            Ok(bytes) => {
                info!(path = %tarball.display(), bytes = bytes, "Must-gather collected");
                self.logger.log_artifact("must-gather", &tarball.display().to_string());
            }
            Err(e) => warn!(error = %e, "Must-gather failed"),
        }
        result.map_err(|e| e.context("must-gather", tarball.display().to_string()))
    }

    /// Collect into `<dump_dir>/<sanitized spec>/ptp-must-gather.tar`
    pub async fn run_for_spec(&self, dump_dir: &Path, spec_name: &str) -> Result<PathBuf> {
        let path = artifact_dir(dump_dir, spec_name).join(TARBALL_NAME);
        self.run(&path).await?;
        Ok(path)
    }

    async fn gather(&self, name: &str, tarball: &Path) -> Result<u64> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), name);
        let bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), name);
        let params = PostParams::default();

        namespaces.create(&params, &build_namespace(name)).await?;
        let account = ServiceAccount {
            metadata: named(SERVICE_ACCOUNT, Some(name)),
            ..Default::default()
        };
        accounts.create(&params, &account).await?;
        bindings
            .create(&params, &build_cluster_role_binding(name, name))
            .await?;
        pods.create(&params, &build_gather_pod(name, &self.image)).await?;
        info!(namespace = %name, image = %self.image, "Started must-gather pod");

        poll_until_timeout("must-gather pod running", POLL_INTERVAL, RUNNING_TIMEOUT, true, || {
            let pods = pods.clone();
            async move {
                let phase = pods
                    .get_opt(POD_NAME)
                    .await?
                    .and_then(|p| p.status)
                    .and_then(|s| s.phase);
                Ok((phase.as_deref() == Some("Running")).then_some(()))
            }
        })
        .await?;

        let exit_code = poll_until_timeout("must-gather container exit", POLL_INTERVAL, GATHER_TIMEOUT, false, || {
            let pods = pods.clone();
            async move { Ok(pods.get_opt(POD_NAME).await?.as_ref().and_then(gather_exit_code)) }
        })
        .await?;

        if exit_code != 0 {
            return Err(HarnessError::Contract(format!(
                "gather container exited with code {}",
                exit_code
            )));
        }

        let pod = PodRef::new(name, POD_NAME).with_container(COPY_CONTAINER);
        copy_out(self.backend.as_ref(), &pod, tarball).await
    }
}

async fn delete_gather_objects(client: Client, name: String) {
    let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    if let Err(e) = bindings.delete(&name, &DeleteParams::default()).await {
        warn!(binding = %name, error = %e, "Failed to delete must-gather ClusterRoleBinding");
    }
    let namespaces: Api<Namespace> = Api::all(client);
    if let Err(e) = namespaces.delete(&name, &DeleteParams::default()).await {
        warn!(namespace = %name, error = %e, "Failed to delete must-gather namespace");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock::MockPodBackend;
    use crate::exec::ExecOutput;
    use serde_json::json;

    #[test]
    fn test_sanitize_spec_name() {
        assert_eq!(sanitize_spec_name("PTP events: pod restart [LOCKED]"), "PTP_events_pod_restart_LOCKED_");
        assert_eq!(sanitize_spec_name("already_safe-name"), "already_safe-name");
        assert_eq!(
            artifact_dir(Path::new("/tmp/reports"), "a/b c"),
            PathBuf::from("/tmp/reports/a_b_c")
        );
    }

    #[test]
    fn test_namespace_is_privileged() {
        let labels = build_namespace("mg").metadata.labels.unwrap();
        assert_eq!(labels["openshift.io/run-level"], "0");
        assert_eq!(labels["pod-security.kubernetes.io/enforce"], "privileged");
        assert_eq!(labels["pod-security.kubernetes.io/warn"], "privileged");
    }

    #[test]
    fn test_binding_targets_service_account() {
        let binding = build_cluster_role_binding("mg", "mg");
        assert_eq!(binding.role_ref.name, "cluster-admin");
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.name, SERVICE_ACCOUNT);
        assert_eq!(subject.namespace.as_deref(), Some("mg"));
    }

    #[test]
    fn test_gather_pod_layout() {
        let pod = build_gather_pod("mg", "quay.io/mg:latest");
        let spec = pod.spec.unwrap();
        assert_eq!(spec.priority_class_name.as_deref(), Some("system-cluster-critical"));
        assert_eq!(spec.containers.len(), 2);
        for container in &spec.containers {
            let mounts = container.volume_mounts.as_ref().unwrap();
            assert_eq!(mounts[0].mount_path, "/must-gather");
            let caps = container.security_context.as_ref().unwrap().capabilities.as_ref().unwrap();
            assert_eq!(caps.add.as_ref().unwrap(), &vec!["ALL".to_string()]);
        }
        assert!(spec.containers[0].command.as_ref().unwrap()[2].contains("/usr/bin/gather"));
        assert!(spec.containers[1].command.as_ref().unwrap()[2].contains("sleep infinity"));
    }

    #[test]
    fn test_gather_exit_code() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {"name": "must-gather"},
            "status": {"containerStatuses": [
                {"name": "copy", "ready": true, "restartCount": 0, "image": "i", "imageID": "", "state": {"running": {}}},
                {"name": "gather", "ready": false, "restartCount": 0, "image": "i", "imageID": "", "state": {"terminated": {"exitCode": 2}}}
            ]}
        }))
        .unwrap();
        assert_eq!(gather_exit_code(&pod), Some(2));

        let running: Pod = serde_json::from_value(json!({"metadata": {"name": "must-gather"}, "status": {}})).unwrap();
        assert_eq!(gather_exit_code(&running), None);
    }

    #[tokio::test]
    async fn test_copy_out_writes_archive() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = artifact_dir(dir.path(), "pod restart").join(TARBALL_NAME);
        let backend = MockPodBackend::new().on_exec(|pod, argv, _| {
            assert_eq!(pod.container.as_deref(), Some(COPY_CONTAINER));
            assert_eq!(argv[0], "tar");
            Ok(ExecOutput {
                stdout: vec![7u8; 1024],
                stderr: String::new(),
            })
        });
        let pod = PodRef::new("mg", POD_NAME).with_container(COPY_CONTAINER);

        let bytes = copy_out(&backend, &pod, &path).await.unwrap();
        assert_eq!(bytes, 1024);
        assert_eq!(std::fs::read(&path).unwrap().len(), 1024);
    }

    #[tokio::test]
    async fn test_copy_out_rejects_empty_archive() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = MockPodBackend::new();
        let pod = PodRef::new("mg", POD_NAME).with_container(COPY_CONTAINER);
        assert!(copy_out(&backend, &pod, &dir.path().join(TARBALL_NAME)).await.is_err());
    }
}
