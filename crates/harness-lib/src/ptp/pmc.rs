//! Parsers for on-node PTP tooling output

use crate::error::{HarnessError, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Prints `<profile> <index>` for every `ptp4l.<index>.config` under /var/run
pub const CONFIG_INDEX_SCRIPT: &str = r#"for f in /var/run/ptp4l.*.config; do [ -e "$f" ] || continue; p=$(head -1 "$f" | sed -n 's/^#profile: *//p'); i=${f%.config}; i=${i##*.}; echo "$p $i"; done"#;

pub fn ptp4l_config_path(index: u32) -> String {
    format!("/var/run/ptp4l.{}.config", index)
}

/// `pmc` invocation against the ptp4l instance owning `config_path`
pub fn pmc_command(config_path: &str, request: &str) -> String {
    format!("pmc -u -b 0 -f {} \"{}\"", config_path, request)
}

/// Parse `<profile> <index>` pairs printed by [`CONFIG_INDEX_SCRIPT`]
///
/// Lines without a profile name or with a non-numeric index are ignored.
pub fn parse_config_indices(output: &str) -> Vec<(String, u32)> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let profile = fields.next()?;
            let index = fields.next()?.parse::<u32>().ok()?;
            Some((profile.to_string(), index))
        })
        .collect()
}

/// Profile name from the first line of a ptp4l config (`#profile: <name>`)
pub fn parse_profile_header(first_line: &str) -> Option<String> {
    first_line
        .trim()
        .strip_prefix("#profile:")
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Map interface name to port identity from `GET PORT_PROPERTIES_NP`
pub fn parse_port_properties(output: &str) -> HashMap<String, String> {
    let mut identities = HashMap::new();
    let mut current: Option<&str> = None;

    for line in output.lines() {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("portIdentity"), Some(id)) => current = Some(id),
            (Some("interface"), Some(name)) => {
                if let Some(id) = current.take() {
                    identities.insert(name.to_string(), id.to_string());
                }
            }
            _ => {}
        }
    }

    identities
}

fn parent_header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(\S+-0)\s+seq\s+\d+\s+RESPONSE\s+MANAGEMENT\s+PARENT_DATA_SET")
            .expect("parent data set header regex is valid")
    })
}

/// Map clock identity (`<clock id>-0`) to parent port identity from `GET PARENT_DATA_SET`
pub fn parse_parent_data_set(output: &str) -> HashMap<String, String> {
    let mut parents = HashMap::new();
    let mut current: Option<String> = None;

    for line in output.lines() {
        if let Some(caps) = parent_header_regex().captures(line) {
            current = caps.get(1).map(|m| m.as_str().to_string());
            continue;
        }
        let mut fields = line.split_whitespace();
        if let (Some("parentPortIdentity"), Some(id)) = (fields.next(), fields.next()) {
            if let Some(clock) = current.take() {
                parents.insert(clock, id.to_string());
            }
        }
    }

    parents
}

/// Clock identity of a port: its trailing `-<port>` replaced by `-0`
pub fn clock_identity(port_identity: &str) -> Result<String> {
    match port_identity.rsplit_once('-') {
        Some((clock, port)) if !clock.is_empty() && port.parse::<u32>().is_ok() => {
            Ok(format!("{}-0", clock))
        }
        _ => Err(HarnessError::Contract(format!(
            "malformed port identity {:?}",
            port_identity
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORT_PROPERTIES: &str = "sending: GET PORT_PROPERTIES_NP
	507c6f.fffe.1fb16c-1 seq 0 RESPONSE MANAGEMENT PORT_PROPERTIES_NP
		portIdentity            507c6f.fffe.1fb16c-1
		portState               SLAVE
		timestamping            HARDWARE
		interface               ens7f0
	507c6f.fffe.1fb16c-2 seq 0 RESPONSE MANAGEMENT PORT_PROPERTIES_NP
		portIdentity            507c6f.fffe.1fb16c-2
		portState               MASTER
		timestamping            HARDWARE
		interface               ens7f1
";

    const PARENT_DATA_SET: &str = "sending: GET PARENT_DATA_SET
	507c6f.fffe.1fb16c-0 seq 0 RESPONSE MANAGEMENT PARENT_DATA_SET
		parentPortIdentity                    ec4670.fffe.0a9a0c-5
		parentStats                           0
		observedParentOffsetScaledLogVariance 0xffff
		grandmasterIdentity                   ec4670.fffe.0a9a0c
";

    #[test]
    fn test_parse_port_properties() {
        let identities = parse_port_properties(PORT_PROPERTIES);
        assert_eq!(identities.len(), 2);
        assert_eq!(identities["ens7f0"], "507c6f.fffe.1fb16c-1");
        assert_eq!(identities["ens7f1"], "507c6f.fffe.1fb16c-2");
    }

    #[test]
    fn test_parse_parent_data_set() {
        let parents = parse_parent_data_set(PARENT_DATA_SET);
        assert_eq!(parents["507c6f.fffe.1fb16c-0"], "ec4670.fffe.0a9a0c-5");
    }

    #[test]
    fn test_clock_identity() {
        assert_eq!(clock_identity("507c6f.fffe.1fb16c-2").unwrap(), "507c6f.fffe.1fb16c-0");
        assert!(clock_identity("no-port-x").is_err());
        assert!(clock_identity("plain").is_err());
    }

    #[test]
    fn test_parse_config_indices() {
        let pairs = parse_config_indices("bc-profile 0\nslave 1\n 2\nbroken x\n");
        assert_eq!(pairs, vec![("bc-profile".to_string(), 0), ("slave".to_string(), 1)]);
    }

    #[test]
    fn test_parse_profile_header() {
        assert_eq!(parse_profile_header("#profile: oc-profile\n"), Some("oc-profile".to_string()));
        assert_eq!(parse_profile_header("[global]"), None);
    }
}
