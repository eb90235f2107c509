//! Command execution inside cluster pods
//!
//! This module provides:
//! - The [`PodBackend`] seam: pod lookup, exec and log fetch
//! - A Kubernetes implementation over the exec/log subresources
//! - The retry-aware PTP daemon executor (node-exec)
//! - The privileged host-namespace debug pod executor

mod daemon;
mod debug_pod;

pub use daemon::{ExecOptions, NodeExecutor};
pub use debug_pod::{debug_pod_name, nsenter_argv, DebugPodExecutor};

use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams, LogParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Fully resolved pod target: namespace, pod name and optional container
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub container: Option<String>,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            container: None,
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }
}

impl std::fmt::Display for PodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.container {
            Some(c) => write!(f, "{}/{}[{}]", self.namespace, self.name, c),
            None => write!(f, "{}/{}", self.namespace, self.name),
        }
    }
}

/// How to find a per-node pod: namespace, label selector, and the container to target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodQuery {
    pub namespace: String,
    pub label_selector: String,
    pub container: Option<String>,
}

impl PodQuery {
    pub fn new(namespace: impl Into<String>, label_selector: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            label_selector: label_selector.into(),
            container: None,
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }
}

/// Output captured from an exec session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ExecOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// stdout followed by stderr, as a terminal would show them
    pub fn combined(&self) -> String {
        let mut out = self.stdout_lossy();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Seam over the pod operations the harness needs
///
/// Pods are never cached: every call resolves the live object.
#[async_trait]
pub trait PodBackend: Send + Sync {
    /// Find the single pod matching `query` bound to `node`
    async fn find_pod(&self, query: &PodQuery, node: &str) -> Result<PodRef>;

    /// Run `argv` in the pod's container and capture its output
    async fn exec(&self, pod: &PodRef, argv: &[String]) -> Result<ExecOutput>;

    /// Fetch container logs, optionally starting at `since`
    async fn logs(&self, pod: &PodRef, since: Option<DateTime<Utc>>) -> Result<String>;
}

/// [`PodBackend`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubePodBackend {
    client: Client,
}

impl KubePodBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl PodBackend for KubePodBackend {
    async fn find_pod(&self, query: &PodQuery, node: &str) -> Result<PodRef> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &query.namespace);
        let params = ListParams::default()
            .labels(&query.label_selector)
            .fields(&format!("spec.nodeName={}", node));

        let list = pods
            .list(&params)
            .await
            .map_err(|e| HarnessError::transient(format!("list pods on {}", node), e))?;

        let names: Vec<String> = list
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect();

        match names.as_slice() {
            [name] => {
                let mut pod = PodRef::new(&query.namespace, name);
                pod.container = query.container.clone();
                Ok(pod)
            }
            _ => Err(HarnessError::transient(
                format!("locate pod on {}", node),
                format!(
                    "expected exactly one pod matching {:?} in {}, found {}",
                    query.label_selector,
                    query.namespace,
                    names.len()
                ),
            )),
        }
    }

    async fn exec(&self, pod: &PodRef, argv: &[String]) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let mut params = AttachParams::default().stdin(false).stdout(true).stderr(true);
        if let Some(container) = &pod.container {
            params = params.container(container.clone());
        }

        debug!(pod = %pod, command = ?argv, "Executing in pod");

        let mut attached = pods
            .exec(&pod.name, argv.to_vec(), &params)
            .await
            .map_err(|e| HarnessError::transient(format!("exec in {}", pod), e))?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let (stdout, stderr) = tokio::join!(read_all(stdout), read_all(stderr));
        let stdout = stdout.map_err(|e| HarnessError::transient(format!("read stdout of {}", pod), e))?;
        let stderr = stderr.map_err(|e| HarnessError::transient(format!("read stderr of {}", pod), e))?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };

        attached
            .join()
            .await
            .map_err(|e| HarnessError::transient(format!("exec session in {}", pod), e))?;

        let output = ExecOutput {
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        };

        if let Some(status) = status {
            if status.status.as_deref() == Some("Failure") {
                return Err(HarnessError::Exec {
                    pod: pod.to_string(),
                    command: argv.join(" "),
                    message: format!(
                        "{}: {}",
                        status.message.unwrap_or_default(),
                        output.combined().trim()
                    ),
                });
            }
        }

        Ok(output)
    }

    async fn logs(&self, pod: &PodRef, since: Option<DateTime<Utc>>) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = LogParams {
            container: pod.container.clone(),
            since_time: since,
            ..Default::default()
        };

        pods.logs(&pod.name, &params)
            .await
            .map_err(|e| HarnessError::transient(format!("fetch logs of {}", pod), e))
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buffer).await?;
    }
    Ok(buffer)
}

/// Wrap a shell script as `sh -c <script>`
pub fn shell(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

#[cfg(test)]
pub(crate) mod mock;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output() {
        let output = ExecOutput {
            stdout: b"first".to_vec(),
            stderr: "second".to_string(),
        };
        assert_eq!(output.combined(), "first\nsecond");

        let only_stderr = ExecOutput {
            stdout: vec![],
            stderr: "err".to_string(),
        };
        assert_eq!(only_stderr.combined(), "err");
    }

    #[test]
    fn test_pod_ref_display() {
        let pod = PodRef::new("openshift-ptp", "linuxptp-daemon-abc").with_container("daemon");
        assert_eq!(pod.to_string(), "openshift-ptp/linuxptp-daemon-abc[daemon]");
    }

    #[test]
    fn test_shell_wraps_script() {
        assert_eq!(shell("echo hi"), vec!["sh", "-c", "echo hi"]);
    }
}
