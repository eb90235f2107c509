//! GNSS receiver fault injection through `ubxtool`

use crate::crds::PtpProfile;
use crate::error::{HarnessError, Result};

/// `CFG-NAVSPG-INFIL_NCNOTHRS` value no receiver can satisfy
pub const GNSS_LOSS_THRESHOLD: u32 = 50;
pub const GNSS_RESTORE_THRESHOLD: u32 = 0;

/// u-blox protocol version for the GM plugin in use
pub fn ubx_protocol_version(plugins: &[&str]) -> Option<&'static str> {
    if plugins.iter().any(|p| *p == "e825" || *p == "e830") {
        Some("29.25")
    } else if plugins.contains(&"e810") {
        Some("29.20")
    } else {
        None
    }
}

pub fn profile_protocol_version(profile: &PtpProfile) -> Result<&'static str> {
    ubx_protocol_version(&profile.plugin_names()).ok_or_else(|| {
        HarnessError::Skip(format!(
            "profile {} has no GNSS-capable plugin",
            profile.name()
        ))
    })
}

pub fn ubxtool_command(protocol: &str, threshold: u32) -> String {
    format!(
        "ubxtool -P {} -w 1 -v 3 -z CFG-NAVSPG-INFIL_NCNOTHRS,{},1",
        protocol, threshold
    )
}

/// `chronyc activity` with no reachable NTP source
pub fn chrony_sources_offline(activity: &str) -> bool {
    activity.contains("0 sources online")
}
