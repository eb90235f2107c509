//! `sriovnetwork.openshift.io/v1` resources

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Requests VFs on matching nodes and advertises them as a device-plugin resource
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "sriovnetwork.openshift.io",
    version = "v1",
    kind = "SriovNetworkNodePolicy",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct SriovNetworkNodePolicySpec {
    pub resource_name: String,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<i32>,
    pub num_vfs: i32,
    pub nic_selector: SriovNicSelector,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_rdma: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SriovNicSelector {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(rename = "deviceID", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pf_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_devices: Option<Vec<String>>,
}

/// Renders a NetworkAttachmentDefinition for a VF resource in a target namespace
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "sriovnetwork.openshift.io",
    version = "v1",
    kind = "SriovNetwork",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct SriovNetworkSpec {
    pub resource_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipam: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vlan: Option<i32>,
    #[serde(rename = "vlanQoS", skip_serializing_if = "Option::is_none")]
    pub vlan_qos: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spoof_chk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_tx_rate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tx_rate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<String>,
}

/// Per-node view of SR-IOV capable interfaces and the sync progress of the config daemon
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "sriovnetwork.openshift.io",
    version = "v1",
    kind = "SriovNetworkNodeState",
    namespaced,
    schema = "disabled",
    status = "SriovNetworkNodeStateStatus"
)]
pub struct SriovNetworkNodeStateSpec {
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SriovNetworkNodeStateStatus {
    #[serde(default)]
    pub interfaces: Vec<InterfaceExt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceExt {
    pub name: String,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(rename = "deviceID", default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub pci_address: Option<String>,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub link_type: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub num_vfs: Option<i32>,
    #[serde(rename = "totalvfs", default)]
    pub total_vfs: Option<i32>,
}
