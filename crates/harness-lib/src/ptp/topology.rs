//! Node → profile → interface model of the cluster's PTP deployment
//!
//! Profiles live in a per-node arena (`NodeInfo::profiles`). Interfaces refer
//! to their profile and to their parent interface by index, never by
//! pointer, so cloning a node cannot alias the original.

use super::pmc::{
    clock_identity, parse_config_indices, parse_parent_data_set, parse_port_properties,
    parse_profile_header, pmc_command, ptp4l_config_path, CONFIG_INDEX_SCRIPT,
};
use super::profile::{classify, profile_interfaces, ClockType, ProfileType};
use crate::crds::PtpConfig;
use crate::error::{HarnessError, Result};
use crate::exec::{ExecOptions, NodeExecutor};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

/// Where a profile is defined: `(namespace, name)` of the config plus position and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileReference {
    pub config_namespace: String,
    pub config_name: String,
    pub profile_index: usize,
    pub profile_name: String,
}

impl ProfileReference {
    pub fn config_key(&self) -> (&str, &str) {
        (&self.config_namespace, &self.config_name)
    }
}

/// Address of an interface inside a [`NodeInfo`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceId {
    pub profile: usize,
    pub interface: String,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub clock_type: ClockType,
    pub port_identity: Option<String>,
    pub parent_port_identity: Option<String>,
    /// Local interface serving this one, set by [`NodeInfo::link_interfaces_by_port_identities`]
    pub parent: Option<InterfaceId>,
    /// Index of the owning profile in [`NodeInfo::profiles`]
    pub profile: usize,
}

/// Cloning drops the parent link; the clone must be relinked explicitly
impl Clone for InterfaceInfo {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            clock_type: self.clock_type,
            port_identity: self.port_identity.clone(),
            parent_port_identity: self.parent_port_identity.clone(),
            parent: None,
            profile: self.profile,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub profile_type: ProfileType,
    pub reference: ProfileReference,
    pub interfaces: BTreeMap<String, InterfaceInfo>,
    /// `N` of `/var/run/ptp4l.N.config`; absent for HA profiles
    pub config_index: Option<u32>,
}

impl ProfileInfo {
    pub fn name(&self) -> &str {
        &self.reference.profile_name
    }

    pub fn config_path(&self) -> Option<String> {
        self.config_index.map(ptp4l_config_path)
    }

    pub fn interfaces_by_clock_type(&self, clock_type: ClockType) -> Vec<&InterfaceInfo> {
        self.interfaces
            .values()
            .filter(|iface| iface.clock_type == clock_type)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub counts: BTreeMap<ProfileType, usize>,
    pub profiles: Vec<ProfileInfo>,
}

/// Every PTP node by name
pub type NodeInfoMap = BTreeMap<String, NodeInfo>;

/// What a node looks like to recommend matching
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeLabels {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Append a profile, keeping counts and interface back-references consistent
    pub fn add_profile(&mut self, profile_type: ProfileType, reference: ProfileReference, interfaces: BTreeMap<String, ClockType>) -> usize {
        let index = self.profiles.len();
        let interfaces = interfaces
            .into_iter()
            .map(|(name, clock_type)| {
                let info = InterfaceInfo {
                    name: name.clone(),
                    clock_type,
                    port_identity: None,
                    parent_port_identity: None,
                    parent: None,
                    profile: index,
                };
                (name, info)
            })
            .collect();

        self.profiles.push(ProfileInfo {
            profile_type,
            reference,
            interfaces,
            config_index: None,
        });
        *self.counts.entry(profile_type).or_insert(0) += 1;
        index
    }

    pub fn profiles_by_types(&self, types: &[ProfileType]) -> Vec<&ProfileInfo> {
        self.profiles
            .iter()
            .filter(|profile| types.contains(&profile.profile_type))
            .collect()
    }

    pub fn profile_by_name(&self, name: &str) -> Option<&ProfileInfo> {
        self.profiles.iter().find(|profile| profile.name() == name)
    }

    pub fn profile_by_config_index(&self, index: u32) -> Option<&ProfileInfo> {
        self.profiles
            .iter()
            .find(|profile| profile.config_index == Some(index))
    }

    pub fn interfaces_by_clock_type(&self, clock_type: ClockType) -> Vec<&InterfaceInfo> {
        self.profiles
            .iter()
            .flat_map(|profile| profile.interfaces_by_clock_type(clock_type))
            .collect()
    }

    pub fn interface(&self, id: &InterfaceId) -> Option<&InterfaceInfo> {
        self.profiles.get(id.profile)?.interfaces.get(&id.interface)
    }

    pub fn profile_of(&self, interface: &InterfaceInfo) -> Option<&ProfileInfo> {
        self.profiles.get(interface.profile)
    }

    pub fn parent_of(&self, interface: &InterfaceInfo) -> Option<&InterfaceInfo> {
        self.interface(interface.parent.as_ref()?)
    }

    /// Bind `(profile name, index)` pairs; one profile with two indices is a contract violation
    pub fn set_config_indices(&mut self, pairs: &[(String, u32)]) -> Result<()> {
        let mut seen: HashMap<&str, u32> = HashMap::new();
        for (name, index) in pairs {
            if let Some(previous) = seen.insert(name.as_str(), *index) {
                if previous != *index {
                    return Err(HarnessError::Contract(format!(
                        "profile {} on node {} has two config indices: {} and {}",
                        name, self.name, previous, index
                    )));
                }
            }
        }

        for profile in &mut self.profiles {
            if let Some(index) = seen.get(profile.reference.profile_name.as_str()) {
                profile.config_index = Some(*index);
            }
        }
        Ok(())
    }

    /// Recompute every parent link from port identities
    ///
    /// An interface's parent is the other local interface whose port identity
    /// equals its parent port identity. Self links are never made.
    pub fn link_interfaces_by_port_identities(&mut self) {
        let mut by_identity: HashMap<String, InterfaceId> = HashMap::new();
        for (index, profile) in self.profiles.iter_mut().enumerate() {
            for iface in profile.interfaces.values_mut() {
                iface.parent = None;
                if let Some(identity) = iface.port_identity.as_ref().filter(|id| !id.is_empty()) {
                    by_identity.insert(
                        identity.clone(),
                        InterfaceId {
                            profile: index,
                            interface: iface.name.clone(),
                        },
                    );
                }
            }
        }

        for (index, profile) in self.profiles.iter_mut().enumerate() {
            for iface in profile.interfaces.values_mut() {
                let Some(parent_identity) = iface.parent_port_identity.as_ref() else { continue };
                if let Some(parent) = by_identity.get(parent_identity) {
                    let is_self = parent.profile == index && parent.interface == iface.name;
                    if !is_self {
                        iface.parent = Some(parent.clone());
                    }
                }
            }
        }
    }

    /// Apply pmc results to one profile's interfaces
    ///
    /// Every interface is resolved before any is written, so an error leaves
    /// the profile untouched.
    pub(crate) fn apply_port_identities(
        &mut self,
        profile_index: usize,
        ports: &HashMap<String, String>,
        parents: &HashMap<String, String>,
    ) -> Result<()> {
        let node = self.name.clone();
        let Some(profile) = self.profiles.get_mut(profile_index) else {
            return Err(HarnessError::InvalidArgument(format!("no profile {} on {}", profile_index, node)));
        };
        let profile_name = profile.reference.profile_name.clone();

        let mut resolved = Vec::with_capacity(profile.interfaces.len());
        for iface in profile.interfaces.values() {
            let port = ports.get(&iface.name).ok_or_else(|| {
                HarnessError::Contract(format!(
                    "no port identity for {} of profile {} on {}",
                    iface.name, profile_name, node
                ))
            })?;
            let parent = parents.get(&clock_identity(port)?).ok_or_else(|| {
                HarnessError::Contract(format!(
                    "no parent port identity for {} of profile {} on {}",
                    iface.name, profile_name, node
                ))
            })?;
            resolved.push((iface.name.clone(), port.clone(), parent.clone()));
        }

        for (name, port, parent) in resolved {
            if let Some(iface) = profile.interfaces.get_mut(&name) {
                iface.port_identity = Some(port);
                iface.parent_port_identity = Some(parent);
            }
        }
        Ok(())
    }
}

fn rule_matches(rule: &crate::crds::MatchRule, node: &NodeLabels) -> bool {
    if let Some(name) = rule.node_name.as_deref() {
        if name == node.name {
            return true;
        }
    }
    if let Some(label) = rule.node_label.as_deref() {
        let (key, value) = match label.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (label, None),
        };
        if let Some(actual) = node.labels.get(key) {
            return value.map_or(true, |v| v == actual);
        }
    }
    false
}

/// Resolve every config's recommends against the node set
///
/// Each matched `(config, profile)` is added once per node. Unclassifiable
/// profiles are skipped.
pub fn build_node_infos(configs: &[PtpConfig], nodes: &[NodeLabels]) -> NodeInfoMap {
    let mut map = NodeInfoMap::new();

    for config in configs {
        let namespace = config.namespace().unwrap_or_default();
        let config_name = config.name_any();

        for recommend in &config.spec.recommend {
            let Some(profile_name) = recommend.profile.as_deref() else { continue };
            let Some((profile_index, profile)) = config
                .spec
                .profile
                .iter()
                .enumerate()
                .find(|(_, p)| p.name() == profile_name)
            else {
                debug!(config = %config_name, profile = %profile_name, "Recommend names a missing profile");
                continue;
            };
            let Some(profile_type) = classify(profile) else {
                debug!(config = %config_name, profile = %profile_name, "Unclassified profile skipped");
                continue;
            };

            let rules = recommend.match_rules.as_deref().unwrap_or_default();
            for node in nodes.iter().filter(|node| rules.iter().any(|rule| rule_matches(rule, node))) {
                let info = map.entry(node.name.clone()).or_insert_with(|| NodeInfo::new(&node.name));
                let already = info.profiles.iter().any(|p| {
                    p.reference.config_name == config_name
                        && p.reference.config_namespace == namespace
                        && p.reference.profile_name == profile_name
                });
                if already {
                    continue;
                }
                info.add_profile(
                    profile_type,
                    ProfileReference {
                        config_namespace: namespace.clone(),
                        config_name: config_name.clone(),
                        profile_index,
                        profile_name: profile_name.to_string(),
                    },
                    profile_interfaces(profile),
                );
            }
        }
    }

    map
}

/// Nodes carrying at least one profile of any of `types`
pub fn nodes_with_profile_types<'a>(map: &'a NodeInfoMap, types: &[ProfileType]) -> Vec<&'a NodeInfo> {
    map.values()
        .filter(|node| !node.profiles_by_types(types).is_empty())
        .collect()
}

/// Fills the on-node parts of the model (config indices, port identities)
#[derive(Clone)]
pub struct TopologyScanner {
    executor: NodeExecutor,
}

impl TopologyScanner {
    pub fn new(executor: NodeExecutor) -> Self {
        Self { executor }
    }

    fn options() -> ExecOptions {
        ExecOptions::default()
            .attempts(3)
            .retry_on_error(true)
            .retry_delay(Duration::from_secs(5))
    }

    pub async fn set_config_indices(&self, node: &mut NodeInfo) -> Result<()> {
        let output = self
            .executor
            .exec(&node.name, CONFIG_INDEX_SCRIPT, &Self::options())
            .await?;
        let pairs = parse_config_indices(&output);
        debug!(node = %node.name, pairs = ?pairs, "Config indices");
        node.set_config_indices(&pairs)
    }

    /// Query pmc for every profile with a config file
    ///
    /// Profiles whose config file is missing (HA) are skipped.
    pub async fn set_port_identities(&self, node: &mut NodeInfo) -> Result<()> {
        for index in 0..node.profiles.len() {
            let profile = &node.profiles[index];
            let Some(path) = profile.config_path() else { continue };
            let is_ha = profile.profile_type == ProfileType::Ha;
            let node_name = node.name.clone();

            let exists = self
                .executor
                .exec(&node_name, &format!("test -f {} && echo present || echo missing", path), &Self::options())
                .await?;
            if exists.trim() != "present" {
                debug!(node = %node_name, config = %path, "Config file missing, skipping port identities");
                continue;
            }

            let ports = parse_port_properties(
                &self
                    .executor
                    .exec(&node_name, &pmc_command(&path, "GET PORT_PROPERTIES_NP"), &Self::options().retry_on_empty(true))
                    .await?,
            );
            let parents = parse_parent_data_set(
                &self
                    .executor
                    .exec(&node_name, &pmc_command(&path, "GET PARENT_DATA_SET"), &Self::options().retry_on_empty(true))
                    .await?,
            );

            match node.apply_port_identities(index, &ports, &parents) {
                Err(e) if is_ha => debug!(node = %node_name, error = %e, "Ignoring HA port identity gap"),
                other => other?,
            }
        }
        Ok(())
    }

    /// Config indices, port identities, then links
    pub async fn populate(&self, node: &mut NodeInfo) -> Result<()> {
        self.set_config_indices(node)
            .await
            .map_err(|e| e.context("set config indices", &node.name))?;
        self.set_port_identities(node)
            .await
            .map_err(|e| e.context("set port identities", &node.name))?;
        node.link_interfaces_by_port_identities();
        info!(node = %node.name, profiles = node.profiles.len(), "Topology populated");
        Ok(())
    }

    /// Profile whose ptp4l config file is `path`, read from the file's header line
    pub async fn profile_by_config_path<'a>(&self, node: &'a NodeInfo, path: &str) -> Result<Option<&'a ProfileInfo>> {
        let header = self
            .executor
            .exec(&node.name, &format!("head -1 {}", path), &Self::options())
            .await?;
        Ok(parse_profile_header(&header).and_then(|name| node.profile_by_name(&name)))
    }
}
