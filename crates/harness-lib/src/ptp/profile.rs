//! Profile classification from PtpConfig fields

use crate::crds::PtpProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Role a profile plays on its node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProfileType {
    #[serde(rename = "OC")]
    Oc,
    #[serde(rename = "TwoPortOC")]
    TwoPortOc,
    #[serde(rename = "BC")]
    Bc,
    #[serde(rename = "HA")]
    Ha,
    #[serde(rename = "GM")]
    Gm,
    #[serde(rename = "MultiNICGM")]
    MultiNicGm,
    #[serde(rename = "NTPFallback")]
    NtpFallback,
}

impl ProfileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileType::Oc => "OC",
            ProfileType::TwoPortOc => "TwoPortOC",
            ProfileType::Bc => "BC",
            ProfileType::Ha => "HA",
            ProfileType::Gm => "GM",
            ProfileType::MultiNicGm => "MultiNICGM",
            ProfileType::NtpFallback => "NTPFallback",
        }
    }
}

impl std::fmt::Display for ProfileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProfileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "oc" => Ok(ProfileType::Oc),
            "twoportoc" => Ok(ProfileType::TwoPortOc),
            "bc" => Ok(ProfileType::Bc),
            "ha" => Ok(ProfileType::Ha),
            "gm" => Ok(ProfileType::Gm),
            "multinicgm" => Ok(ProfileType::MultiNicGm),
            "ntpfallback" => Ok(ProfileType::NtpFallback),
            other => Err(format!("unknown profile type {:?}", other)),
        }
    }
}

/// Direction of an interface relative to this clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockType {
    /// Receives time (follower port)
    Client,
    /// Serves time (leader port)
    Server,
}

/// ptp4l.conf sections that do not name an interface
const NON_INTERFACE_SECTIONS: &[&str] = &["global", "unicast_master_table", "nmea"];

/// Plugins that drive a GNSS-disciplined grandmaster
pub const GM_PLUGINS: &[&str] = &["e810", "e825", "e830"];

/// Interfaces declared as `[iface]` sections of a ptp4l.conf, with their role
pub fn ptp4l_conf_interfaces(conf: &str) -> BTreeMap<String, ClockType> {
    let mut interfaces = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in conf.lines() {
        let line = line.trim();
        if let Some(section) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            let section = section.trim();
            current = if NON_INTERFACE_SECTIONS.contains(&section) || section.is_empty() {
                None
            } else {
                interfaces.insert(section.to_string(), ClockType::Client);
                Some(section.to_string())
            };
            continue;
        }

        let Some(name) = &current else { continue };
        let mut fields = line.split_whitespace();
        if let (Some(key), Some(value)) = (fields.next(), fields.next()) {
            if (key == "masterOnly" || key == "serverOnly") && value == "1" {
                interfaces.insert(name.clone(), ClockType::Server);
            }
        }
    }

    interfaces
}

fn has_text(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|s| !s.trim().is_empty())
}

/// NICs whose pins a grandmaster plugin drives
fn gm_plugin_nics(profile: &PtpProfile) -> usize {
    let Some(plugins) = &profile.plugins else { return 0 };
    GM_PLUGINS
        .iter()
        .filter_map(|name| plugins.get(*name))
        .filter_map(|plugin| plugin.get("pins").and_then(|pins| pins.as_object()))
        .map(|pins| pins.len())
        .sum()
}

/// Interfaces of a profile: ptp4l.conf sections, else the legacy `interface` field as a client
pub fn profile_interfaces(profile: &PtpProfile) -> BTreeMap<String, ClockType> {
    let mut interfaces = profile
        .ptp4l_conf
        .as_deref()
        .map(ptp4l_conf_interfaces)
        .unwrap_or_default();

    if interfaces.is_empty() {
        if let Some(iface) = profile.interface.as_deref().filter(|i| !i.is_empty()) {
            interfaces.insert(iface.to_string(), ClockType::Client);
        }
    }

    interfaces
}

/// Classify a profile, `None` when its shape matches no known role
pub fn classify(profile: &PtpProfile) -> Option<ProfileType> {
    if profile
        .ptp_settings
        .as_ref()
        .is_some_and(|settings| settings.contains_key("haProfiles"))
    {
        return Some(ProfileType::Ha);
    }

    let has_gm_plugin = profile.plugin_names().iter().any(|name| GM_PLUGINS.contains(name));
    if has_text(&profile.ts2phc_conf) || has_gm_plugin {
        if has_text(&profile.chronyd_conf) {
            return Some(ProfileType::NtpFallback);
        }
        if gm_plugin_nics(profile) > 1 {
            return Some(ProfileType::MultiNicGm);
        }
        return Some(ProfileType::Gm);
    }

    let interfaces = profile_interfaces(profile);
    let clients = interfaces.values().filter(|t| **t == ClockType::Client).count();
    let servers = interfaces.len() - clients;

    match (clients, servers) {
        (c, s) if c > 0 && s > 0 => Some(ProfileType::Bc),
        (1, 0) => Some(ProfileType::Oc),
        (2, 0) => Some(ProfileType::TwoPortOc),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile(value: serde_json::Value) -> PtpProfile {
        serde_json::from_value(value).unwrap()
    }

    const BC_CONF: &str = "[ens1f0]\nmasterOnly 0\n[ens1f1]\nmasterOnly 1\n[global]\ndomainNumber 24\n";

    #[test]
    fn test_ptp4l_conf_interfaces() {
        let interfaces = ptp4l_conf_interfaces(BC_CONF);
        assert_eq!(interfaces.len(), 2);
        assert_eq!(interfaces["ens1f0"], ClockType::Client);
        assert_eq!(interfaces["ens1f1"], ClockType::Server);
    }

    #[test]
    fn test_classify_clients_and_servers() {
        assert_eq!(classify(&profile(json!({"name": "bc", "ptp4lConf": BC_CONF}))), Some(ProfileType::Bc));
        assert_eq!(
            classify(&profile(json!({"name": "oc", "ptp4lConf": "[ens1f0]\nmasterOnly 0\n[global]\n"}))),
            Some(ProfileType::Oc)
        );
        assert_eq!(
            classify(&profile(json!({"name": "oc2", "ptp4lConf": "[ens1f0]\n[ens2f0]\n[global]\n"}))),
            Some(ProfileType::TwoPortOc)
        );
        assert_eq!(classify(&profile(json!({"name": "legacy", "interface": "ens3f0"}))), Some(ProfileType::Oc));
        assert_eq!(classify(&profile(json!({"name": "empty"}))), None);
    }

    #[test]
    fn test_classify_grandmasters() {
        assert_eq!(
            classify(&profile(json!({"name": "gm", "ts2phcConf": "[global]", "plugins": {"e810": {"pins": {"ens4f0": {}}}}}))),
            Some(ProfileType::Gm)
        );
        assert_eq!(
            classify(&profile(json!({"name": "gm2", "plugins": {"e810": {"pins": {"ens4f0": {}, "ens5f0": {}}}}}))),
            Some(ProfileType::MultiNicGm)
        );
        assert_eq!(
            classify(&profile(json!({"name": "fb", "ts2phcConf": "[global]", "chronydConf": "server 1.1.1.1 iburst"}))),
            Some(ProfileType::NtpFallback)
        );
    }

    #[test]
    fn test_classify_ha() {
        assert_eq!(
            classify(&profile(json!({"name": "ha", "ptpSettings": {"haProfiles": "oc1,oc2"}}))),
            Some(ProfileType::Ha)
        );
    }

    #[test]
    fn test_profile_type_parse() {
        assert_eq!("twoportoc".parse::<ProfileType>().unwrap(), ProfileType::TwoPortOc);
        assert_eq!("NTPFallback".parse::<ProfileType>().unwrap(), ProfileType::NtpFallback);
        assert!("xx".parse::<ProfileType>().is_err());
    }
}
