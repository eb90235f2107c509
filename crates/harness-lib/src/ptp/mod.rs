//! PTP topology discovery and PtpConfig management
//!
//! This module provides:
//! - `pmc` query construction and response parsing
//! - Profile classification and the node/profile/interface model
//! - PtpConfig snapshot, mutation and restoration
//! - The operator's event publisher setting

pub mod pmc;
mod mutation;
mod operator;
mod profile;
mod store;
mod topology;

pub use mutation::{
    remove_profile, replace_chronyd_servers, set_log_reduce, set_ts2phc_holdover,
    wait_for_profile_load, ProfileMutator, PROFILE_LOAD_MARKER,
};
pub use operator::{event_publisher_enabled, PtpOperatorConfigReader, OPERATOR_CONFIG_NAME};
pub use profile::{classify, profile_interfaces, ptp4l_conf_interfaces, ClockType, ProfileType, GM_PLUGINS};
pub use store::{KubePtpConfigApi, PtpConfigApi};
pub use topology::{
    build_node_infos, nodes_with_profile_types, InterfaceId, InterfaceInfo, NodeInfo, NodeInfoMap,
    NodeLabels, ProfileInfo, ProfileReference, TopologyScanner,
};
