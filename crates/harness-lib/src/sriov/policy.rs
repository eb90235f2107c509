//! SriovNetworkNodePolicy construction and NIC discovery

use crate::crds::{SriovNetworkNodePolicy, SriovNetworkNodePolicySpec, SriovNetworkNodeState, SriovNicSelector};
use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Broadcom PCI vendor ID; its NICs are not exercised with vfio-pci
pub const BCM_VENDOR_ID: &str = "14e4";

const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// How VFs are exposed to pods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    #[serde(rename = "netdevice")]
    Netdevice,
    #[serde(rename = "vfio-pci")]
    VfioPci,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Netdevice => "netdevice",
            DeviceType::VfioPci => "vfio-pci",
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "netdevice" => Ok(DeviceType::Netdevice),
            "vfio-pci" => Ok(DeviceType::VfioPci),
            other => Err(HarnessError::InvalidArgument(format!("unknown device type {:?}", other))),
        }
    }
}

/// A policy to place on the first candidate node that accepts it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRequest {
    pub name: String,
    pub resource_name: String,
    pub vendor: String,
    pub device_id: String,
    /// Interface name to prefer when several PFs match
    pub interface_name: Option<String>,
    pub device_type: DeviceType,
    pub num_vfs: u32,
    pub candidate_nodes: Vec<String>,
}

impl PolicyRequest {
    pub fn validate(&self) -> Result<()> {
        if self.num_vfs == 0 {
            return Err(HarnessError::InvalidArgument(format!(
                "policy {} requests zero VFs",
                self.name
            )));
        }
        if self.candidate_nodes.is_empty() {
            return Err(HarnessError::Precondition(format!(
                "no candidate nodes for policy {}",
                self.name
            )));
        }
        if self.device_type == DeviceType::VfioPci && is_bcm_vendor(&self.vendor) {
            return Err(HarnessError::Skip(format!(
                "vfio-pci is not exercised on Broadcom NICs (vendor {})",
                self.vendor
            )));
        }
        Ok(())
    }
}

/// Policy that converged, with where it landed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedPolicy {
    pub name: String,
    pub node: String,
    pub interface: String,
    pub resource_name: String,
}

/// `0x15B3` and `15b3` name the same PCI ID
pub fn normalize_pci_id(id: &str) -> String {
    let id = id.trim().to_ascii_lowercase();
    id.strip_prefix("0x").map(str::to_string).unwrap_or(id)
}

pub fn is_bcm_vendor(vendor: &str) -> bool {
    normalize_pci_id(vendor) == BCM_VENDOR_ID
}

/// VF range selector: `<iface>#0-<vfs-1>`
pub fn pf_names(interface: &str, num_vfs: u32) -> String {
    format!("{}#0-{}", interface, num_vfs.saturating_sub(1))
}

/// First interface of the node state matching vendor and device
///
/// `preferred` wins when it matches too.
pub fn find_interface(
    state: &SriovNetworkNodeState,
    vendor: &str,
    device_id: &str,
    preferred: Option<&str>,
) -> Option<String> {
    let vendor = normalize_pci_id(vendor);
    let device_id = normalize_pci_id(device_id);
    let interfaces = &state.status.as_ref()?.interfaces;

    let matching: Vec<&str> = interfaces
        .iter()
        .filter(|i| i.vendor.as_deref().map(normalize_pci_id).as_deref() == Some(vendor.as_str()))
        .filter(|i| i.device_id.as_deref().map(normalize_pci_id).as_deref() == Some(device_id.as_str()))
        .map(|i| i.name.as_str())
        .collect();

    preferred
        .and_then(|p| matching.iter().find(|name| **name == p))
        .or_else(|| matching.first())
        .map(|name| name.to_string())
}

/// Policy pinned to `node` by hostname, exposing `num_vfs` VFs of `interface`
pub fn build_policy(request: &PolicyRequest, namespace: &str, node: &str, interface: &str) -> SriovNetworkNodePolicy {
    let spec = SriovNetworkNodePolicySpec {
        resource_name: request.resource_name.clone(),
        node_selector: BTreeMap::from([(HOSTNAME_LABEL.to_string(), node.to_string())]),
        priority: Some(99),
        mtu: None,
        num_vfs: request.num_vfs as i32,
        nic_selector: SriovNicSelector {
            vendor: Some(normalize_pci_id(&request.vendor)),
            device_id: Some(normalize_pci_id(&request.device_id)),
            pf_names: Some(vec![pf_names(interface, request.num_vfs)]),
            root_devices: None,
        },
        device_type: Some(request.device_type.as_str().to_string()),
        is_rdma: None,
    };
    let mut policy = SriovNetworkNodePolicy::new(&request.name, spec);
    policy.metadata.namespace = Some(namespace.to_string());
    policy
}
