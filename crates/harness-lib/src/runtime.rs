//! Wiring of the harness components against a live cluster
//!
//! One [`Harness`] is built per run from the loaded configuration and hands
//! out the components that share its client, pod backend and logger.

use crate::config::{worker_label_selector, HarnessConfig};
use crate::drivers::{daemon_query, PtpDrivers};
use crate::error::{HarnessError, Result};
use crate::events::{ConsumerEventSource, EventConsumer};
use crate::exec::{DebugPodExecutor, KubePodBackend, NodeExecutor, PodBackend, PodQuery};
use crate::logs::{LogCollector, LogTailer};
use crate::metrics::{JointAsserter, MetricAsserter, PrometheusClient};
use crate::mustgather::MustGather;
use crate::nicinfo::{NicRegistry, NicReporter};
use crate::observability::StructuredLogger;
use crate::ptp::{build_node_infos, KubePtpConfigApi, NodeInfoMap, NodeLabels, ProfileMutator, PtpConfigApi, PtpOperatorConfigReader, TopologyScanner};
use crate::sriov::SriovEnvironment;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct Harness {
    config: Arc<HarnessConfig>,
    client: Client,
    backend: Arc<dyn PodBackend>,
    logger: StructuredLogger,
}

impl Harness {
    /// Connect with the ambient kubeconfig or in-cluster service account
    pub async fn connect(config: HarnessConfig, suite: &str) -> Result<Self> {
        let client = Client::try_default().await?;
        info!(suite = %suite, ptp_namespace = %config.ptp_namespace, "Connected to cluster");
        Ok(Self::with_client(client, Arc::new(config), suite))
    }

    pub fn with_client(client: Client, config: Arc<HarnessConfig>, suite: &str) -> Self {
        Self {
            backend: Arc::new(KubePodBackend::new(client.clone())),
            logger: StructuredLogger::new(suite),
            config,
            client,
        }
    }

    pub fn config(&self) -> &Arc<HarnessConfig> {
        &self.config
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn backend(&self) -> &Arc<dyn PodBackend> {
        &self.backend
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub fn executor(&self) -> NodeExecutor {
        NodeExecutor::new(self.backend.clone(), daemon_query(&self.config))
    }

    /// Host-namespace executor whose debug pods live in the SR-IOV test namespace
    pub fn host_executor(&self) -> DebugPodExecutor {
        DebugPodExecutor::new(
            self.client.clone(),
            self.backend.clone(),
            &self.config.sriov_test_namespace,
            &self.config.debug_pod_image,
        )
    }

    pub fn tailer(&self) -> LogTailer {
        LogTailer::new(self.backend.clone(), daemon_query(&self.config))
    }

    pub fn collector(&self) -> LogCollector {
        LogCollector::new(self.backend.clone(), daemon_query(&self.config))
    }

    pub fn nic_reporter(&self) -> NicReporter {
        NicReporter::new(self.executor())
    }

    pub fn scanner(&self) -> TopologyScanner {
        TopologyScanner::new(self.executor())
    }

    pub fn ptp_configs(&self) -> Arc<dyn PtpConfigApi> {
        Arc::new(KubePtpConfigApi::new(self.client.clone(), &self.config.ptp_namespace))
    }

    pub fn mutator(&self) -> ProfileMutator {
        ProfileMutator::new(self.ptp_configs(), self.logger.clone())
    }

    pub fn event_consumer(&self) -> EventConsumer {
        let consumer = PodQuery::new(
            &self.config.event_consumer_namespace,
            &self.config.event_consumer_label_selector,
        )
        .with_container(&self.config.event_consumer_container);
        EventConsumer::new(Arc::new(ConsumerEventSource::new(
            self.backend.clone(),
            consumer,
            &self.config.event_store_path,
        )))
    }

    /// Metric asserter over the configured Thanos querier
    pub async fn metric_asserter(&self) -> Result<MetricAsserter> {
        let Some(url) = self.config.prometheus_url.as_deref() else {
            return Err(HarnessError::Precondition(
                "prometheus_url is not configured".to_string(),
            ));
        };
        let client = PrometheusClient::from_cluster(
            self.client.clone(),
            url,
            &self.config.prometheus_sa_namespace,
            self.config.prometheus_insecure_skip_verify,
        )
        .await?;
        Ok(MetricAsserter::new(Arc::new(client), self.logger.clone()))
    }

    pub fn operator_config(&self) -> Arc<PtpOperatorConfigReader> {
        Arc::new(PtpOperatorConfigReader::new(self.client.clone(), &self.config.ptp_namespace))
    }

    pub async fn joint_asserter(&self) -> Result<JointAsserter> {
        Ok(JointAsserter::new(
            self.metric_asserter().await?,
            self.event_consumer(),
            self.operator_config(),
        ))
    }

    pub async fn drivers(&self, registry: NicRegistry) -> Result<PtpDrivers> {
        Ok(PtpDrivers::new(
            self.client.clone(),
            self.config.clone(),
            self.backend.clone(),
            self.joint_asserter().await?,
            self.operator_config(),
            self.mutator(),
            registry,
            self.logger.clone(),
        ))
    }

    pub fn sriov(&self) -> SriovEnvironment {
        SriovEnvironment::new(self.client.clone(), self.config.clone(), self.backend.clone())
    }

    pub fn must_gather(&self) -> MustGather {
        MustGather::new(
            self.client.clone(),
            self.backend.clone(),
            &self.config.must_gather_image,
            self.logger.clone(),
        )
    }

    /// Names and labels of the worker nodes
    pub async fn worker_nodes(&self) -> Result<Vec<NodeLabels>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&worker_label_selector(&self.config.worker_label));
        Ok(nodes
            .list(&params)
            .await?
            .items
            .into_iter()
            .map(|node| NodeLabels {
                name: node.name_any(),
                labels: node.labels().clone(),
            })
            .collect())
    }

    /// Resolve every PtpConfig against the workers and scan each node
    ///
    /// A node whose scan fails stays in the map without on-node data.
    pub async fn discover_topology(&self) -> Result<NodeInfoMap> {
        let configs = self.ptp_configs().list().await?;
        let nodes = self.worker_nodes().await?;
        let mut map = build_node_infos(&configs, &nodes);
        let scanner = self.scanner();

        for node in map.values_mut() {
            if let Err(e) = scanner.populate(node).await {
                warn!(node = %node.name, error = %e, "Topology scan failed");
            }
        }

        info!(nodes = map.len(), configs = configs.len(), "Discovered PTP topology");
        Ok(map)
    }
}
