//! Typed custom resources the harness reads and writes
//!
//! Only the fields the harness inspects are modelled. Unknown fields are kept
//! in flattened maps where the harness writes the object back, so an update
//! never drops data it did not understand.

mod machineconfig;
mod nad;
mod ptp;
mod sriov;

pub use machineconfig::{
    MachineConfigPool, MachineConfigPoolCondition, MachineConfigPoolSpec, MachineConfigPoolStatus,
};
pub use nad::{NetworkAttachmentDefinition, NetworkAttachmentDefinitionSpec};
pub use ptp::{
    MatchRule, PtpClockThreshold, PtpConfig, PtpConfigSpec, PtpEventConfig, PtpOperatorConfig,
    PtpOperatorConfigSpec, PtpProfile, PtpRecommend,
};
pub use sriov::{
    InterfaceExt, SriovNetwork, SriovNetworkNodePolicy, SriovNetworkNodePolicySpec,
    SriovNetworkNodeState, SriovNetworkNodeStateSpec, SriovNetworkNodeStateStatus,
    SriovNetworkSpec, SriovNicSelector,
};
