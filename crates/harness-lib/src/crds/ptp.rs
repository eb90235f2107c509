//! `ptp.openshift.io/v1` resources

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// PtpConfig: a set of linuxptp profiles and the rules binding them to nodes
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "ptp.openshift.io",
    version = "v1",
    kind = "PtpConfig",
    namespaced,
    schema = "disabled",
    derive = "PartialEq"
)]
pub struct PtpConfigSpec {
    #[serde(default)]
    pub profile: Vec<PtpProfile>,
    #[serde(default)]
    pub recommend: Vec<PtpRecommend>,
}

/// One linuxptp profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtpProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptp4l_opts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptp4l_conf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phc2sys_opts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phc2sys_conf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts2phc_opts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts2phc_conf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chronyd_opts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chronyd_conf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptp_scheduling_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptp_scheduling_priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptp_clock_threshold: Option<PtpClockThreshold>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptp_settings: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugins: Option<BTreeMap<String, Value>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtpClockThreshold {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_over_timeout: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_offset_threshold: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_offset_threshold: Option<i64>,
}

/// Binds a profile to nodes by name or label
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PtpRecommend {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_rules: Option<Vec<MatchRule>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

/// PtpOperatorConfig: operator-wide settings, including event publishing
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "ptp.openshift.io",
    version = "v1",
    kind = "PtpOperatorConfig",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PtpOperatorConfigSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub daemon_node_selector: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptp_event_config: Option<PtpEventConfig>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtpEventConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_event_publisher: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_host: Option<String>,
}

impl PtpProfile {
    /// Profile name, empty when unset
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    /// Names of the plugins enabled on this profile
    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins
            .as_ref()
            .map(|plugins| plugins.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}
