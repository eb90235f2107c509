//! SriovNetwork construction

use crate::crds::{SriovNetwork, SriovNetworkSpec};
use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};

/// Secondary network backed by a VF resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub name: String,
    pub resource_name: String,
    /// Namespace the NetworkAttachmentDefinition is rendered into
    pub network_namespace: String,
    pub spoof_check: Option<bool>,
    pub trust: Option<bool>,
    pub vlan: Option<i64>,
    pub vlan_qos: Option<i64>,
    pub min_tx_rate: Option<i64>,
    pub max_tx_rate: Option<i64>,
    /// `auto`, `enable` or `disable`
    pub link_state: Option<String>,
}

fn on_off(value: bool) -> String {
    if value { "on" } else { "off" }.to_string()
}

/// Reject values that do not fit an unsigned 16-bit field
fn checked_u16(field: &str, value: Option<i64>) -> Result<Option<i32>> {
    match value {
        None => Ok(None),
        Some(v) if (0..=i64::from(u16::MAX)).contains(&v) => Ok(Some(v as i32)),
        Some(v) => Err(HarnessError::InvalidArgument(format!(
            "{} = {} does not fit in 16 bits",
            field, v
        ))),
    }
}

/// Build the SriovNetwork for `request` in the operator namespace
pub fn build_network(request: &NetworkRequest, operator_namespace: &str) -> Result<SriovNetwork> {
    if let Some(state) = &request.link_state {
        if !matches!(state.as_str(), "auto" | "enable" | "disable") {
            return Err(HarnessError::InvalidArgument(format!("unknown link state {:?}", state)));
        }
    }

    let spec = SriovNetworkSpec {
        resource_name: request.resource_name.clone(),
        network_namespace: Some(request.network_namespace.clone()),
        ipam: Some(r#"{"type": "static"}"#.to_string()),
        vlan: checked_u16("vlan", request.vlan)?,
        vlan_qos: checked_u16("vlanQoS", request.vlan_qos)?,
        spoof_chk: request.spoof_check.map(on_off),
        trust: request.trust.map(on_off),
        min_tx_rate: checked_u16("minTxRate", request.min_tx_rate)?,
        max_tx_rate: checked_u16("maxTxRate", request.max_tx_rate)?,
        link_state: request.link_state.clone(),
        capabilities: Some(r#"{"mac": true, "ips": true}"#.to_string()),
    };

    let mut network = SriovNetwork::new(&request.name, spec);
    network.metadata.namespace = Some(operator_namespace.to_string());
    Ok(network)
}
