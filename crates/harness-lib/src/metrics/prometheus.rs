//! Instant-query client for the cluster's Thanos querier

use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client as KubeClient;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const READER_SERVICE_ACCOUNT: &str = "telco-e2e-prometheus-reader";
const READER_CLUSTER_ROLE: &str = "cluster-monitoring-view";
const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

/// One labelled series of an instant vector
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

/// Seam over the Prometheus HTTP API
#[async_trait]
pub trait MetricsApi: Send + Sync {
    /// Evaluate `promql` at the current time
    async fn instant_query(&self, promql: &str) -> Result<Vec<MetricSample>>;
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<VectorSample>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    /// `[<unix seconds>, "<value>"]`
    value: (f64, String),
}

/// Prometheus client authenticated with a bearer token
pub struct PrometheusClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl PrometheusClient {
    pub fn new(base_url: &str, token: Option<String>, insecure_skip_verify: bool) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(insecure_skip_verify)
            .build()?;

        let base_url = Url::parse(base_url)
            .map_err(|e| HarnessError::InvalidArgument(format!("invalid Prometheus URL {:?}: {}", base_url, e)))?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    /// Build a client whose token is minted once for a reader service account
    pub async fn from_cluster(
        kube: KubeClient,
        base_url: &str,
        namespace: &str,
        insecure_skip_verify: bool,
    ) -> Result<Self> {
        let token = mint_reader_token(kube, namespace).await?;
        Self::new(base_url, Some(token), insecure_skip_verify)
    }
}

/// Treat "already exists" as success
fn tolerate_conflict<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Create the reader service account and binding, then request a token for it
async fn mint_reader_token(kube: KubeClient, namespace: &str) -> Result<String> {
    let accounts: Api<ServiceAccount> = Api::namespaced(kube.clone(), namespace);
    let account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(READER_SERVICE_ACCOUNT.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    tolerate_conflict(accounts.create(&PostParams::default(), &account).await)?;

    let bindings: Api<ClusterRoleBinding> = Api::all(kube.clone());
    let binding = ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", READER_SERVICE_ACCOUNT, namespace)),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: READER_CLUSTER_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: READER_SERVICE_ACCOUNT.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    };
    tolerate_conflict(bindings.create(&PostParams::default(), &binding).await)?;

    let request = TokenRequest {
        spec: TokenRequestSpec {
            audiences: vec![],
            expiration_seconds: Some(TOKEN_TTL_SECS),
            ..Default::default()
        },
        ..Default::default()
    };
    let response: TokenRequest = accounts
        .create_subresource(
            "token",
            READER_SERVICE_ACCOUNT,
            &PostParams::default(),
            serde_json::to_vec(&request)?,
        )
        .await?;

    let token = response
        .status
        .map(|status| status.token)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| HarnessError::Contract("token request returned no token".to_string()))?;

    info!(namespace = %namespace, service_account = READER_SERVICE_ACCOUNT, "Minted Prometheus reader token");
    Ok(token)
}

#[async_trait]
impl MetricsApi for PrometheusClient {
    async fn instant_query(&self, promql: &str) -> Result<Vec<MetricSample>> {
        let url = self
            .base_url
            .join("api/v1/query")
            .map_err(|e| HarnessError::InvalidArgument(e.to_string()))?;

        let mut request = self.client.get(url).query(&[("query", promql)]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        debug!(query = %promql, "Prometheus instant query");
        let response = request
            .send()
            .await
            .map_err(|e| HarnessError::transient("prometheus query", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| HarnessError::transient("prometheus query", e))?;

        let parsed: QueryResponse = serde_json::from_str(&body).map_err(|e| {
            HarnessError::transient("prometheus query", format!("HTTP {}: {}: {}", status, e, body))
        })?;

        if parsed.status != "success" {
            return Err(HarnessError::transient(
                "prometheus query",
                format!(
                    "{}: {}",
                    parsed.error_type.unwrap_or_default(),
                    parsed.error.unwrap_or_default()
                ),
            ));
        }

        let data = parsed
            .data
            .ok_or_else(|| HarnessError::transient("prometheus query", "response has no data"))?;
        if data.result_type != "vector" {
            return Err(HarnessError::Contract(format!(
                "expected an instant vector, got {}",
                data.result_type
            )));
        }

        data.result
            .into_iter()
            .map(|sample| {
                let value = sample.value.1.parse::<f64>().map_err(|e| {
                    HarnessError::transient("prometheus query", format!("bad sample value {:?}: {}", sample.value.1, e))
                })?;
                Ok(MetricSample {
                    labels: sample.metric,
                    value,
                })
            })
            .collect()
    }
}
