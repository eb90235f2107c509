//! PTP operator configuration checks

use crate::crds::PtpOperatorConfig;
use crate::error::Result;
use crate::metrics::EventPublisherStatus;
use async_trait::async_trait;
use kube::api::Api;
use kube::Client;
use tracing::debug;

/// Name of the singleton PtpOperatorConfig
pub const OPERATOR_CONFIG_NAME: &str = "default";

/// Whether the PtpOperatorConfig enables the cloud-event publisher
pub fn event_publisher_enabled(config: &PtpOperatorConfig) -> bool {
    config
        .spec
        .ptp_event_config
        .as_ref()
        .and_then(|c| c.enable_event_publisher)
        .unwrap_or(false)
}

/// Reads the operator's `ptpEventConfig.enableEventPublisher`
#[derive(Clone)]
pub struct PtpOperatorConfigReader {
    client: Client,
    namespace: String,
}

impl PtpOperatorConfigReader {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl EventPublisherStatus for PtpOperatorConfigReader {
    async fn events_enabled(&self) -> Result<bool> {
        let api: Api<PtpOperatorConfig> = Api::namespaced(self.client.clone(), &self.namespace);
        let enabled = match api.get_opt(OPERATOR_CONFIG_NAME).await? {
            Some(config) => event_publisher_enabled(&config),
            None => false,
        };
        debug!(namespace = %self.namespace, enabled = enabled, "Checked PTP event publisher");
        Ok(enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_publisher_flag() {
        let enabled: PtpOperatorConfig = serde_json::from_value(json!({
            "apiVersion": "ptp.openshift.io/v1",
            "kind": "PtpOperatorConfig",
            "metadata": {"name": "default", "namespace": "openshift-ptp"},
            "spec": {"ptpEventConfig": {"enableEventPublisher": true}}
        }))
        .unwrap();
        assert!(event_publisher_enabled(&enabled));

        let bare: PtpOperatorConfig = serde_json::from_value(json!({
            "apiVersion": "ptp.openshift.io/v1",
            "kind": "PtpOperatorConfig",
            "metadata": {"name": "default"},
            "spec": {}
        }))
        .unwrap();
        assert!(!event_publisher_enabled(&bare));
    }
}
