//! Access to PtpConfig objects in the cluster

use crate::crds::PtpConfig;
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};

/// Seam over PtpConfig reads and writes
#[async_trait]
pub trait PtpConfigApi: Send + Sync {
    async fn list(&self) -> Result<Vec<PtpConfig>>;
    async fn get(&self, namespace: &str, name: &str) -> Result<PtpConfig>;
    /// Write `config` back; its resourceVersion must come from a live read
    async fn replace(&self, config: &PtpConfig) -> Result<PtpConfig>;
}

/// [`PtpConfigApi`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubePtpConfigApi {
    client: Client,
    namespace: String,
}

impl KubePtpConfigApi {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl PtpConfigApi for KubePtpConfigApi {
    async fn list(&self) -> Result<Vec<PtpConfig>> {
        let api: Api<PtpConfig> = Api::namespaced(self.client.clone(), &self.namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<PtpConfig> {
        let api: Api<PtpConfig> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn replace(&self, config: &PtpConfig) -> Result<PtpConfig> {
        let namespace = config
            .namespace()
            .ok_or_else(|| HarnessError::InvalidArgument(format!("PtpConfig {} has no namespace", config.name_any())))?;
        let api: Api<PtpConfig> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.replace(&config.name_any(), &PostParams::default(), config).await?)
    }
}

/// True if the API rejected a write because the object changed underneath it
pub(crate) fn is_conflict(error: &HarnessError) -> bool {
    match error {
        HarnessError::Kube(kube::Error::Api(response)) => response.code == 409,
        HarnessError::Context { source, .. } => is_conflict(source),
        _ => false,
    }
}
