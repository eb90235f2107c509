//! NIC grouping and egress detection for interface flaps

use std::collections::{BTreeMap, BTreeSet};

/// Bridge that carries node traffic on OVN-Kubernetes clusters
pub const EGRESS_BRIDGE: &str = "br-ex";

/// NIC an interface belongs to: the name without its trailing port number
pub fn nic_name(interface: &str) -> &str {
    let trimmed = interface.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.is_empty() {
        interface
    } else {
        trimmed
    }
}

pub fn group_by_nic<S: AsRef<str>>(interfaces: &[S]) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for interface in interfaces {
        let interface = interface.as_ref();
        groups
            .entry(nic_name(interface).to_string())
            .or_default()
            .push(interface.to_string());
    }
    for members in groups.values_mut() {
        members.sort();
        members.dedup();
    }
    groups
}

/// Device of the default route in `ip route show default` output
pub fn default_route_device(output: &str) -> Option<&str> {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("default"))
        .find_map(|line| {
            let mut words = line.split_whitespace();
            words.by_ref().find(|w| *w == "dev")?;
            words.next()
        })
}

/// Interfaces that carry egress traffic: the route device, or the bridge's ports
pub fn egress_interfaces(route_output: &str, bridge_ports: &str) -> BTreeSet<String> {
    let Some(device) = default_route_device(route_output) else {
        return BTreeSet::new();
    };
    if device == EGRESS_BRIDGE {
        bridge_ports
            .lines()
            .map(str::trim)
            .filter(|port| !port.is_empty() && !port.starts_with("patch-"))
            .map(str::to_string)
            .collect()
    } else {
        BTreeSet::from([device.to_string()])
    }
}

/// NIC groups that do not own an egress interface
pub fn flappable_nics(
    groups: BTreeMap<String, Vec<String>>,
    egress: &BTreeSet<String>,
) -> BTreeMap<String, Vec<String>> {
    let egress_nics: BTreeSet<&str> = egress.iter().map(|i| nic_name(i)).collect();
    groups
        .into_iter()
        .filter(|(nic, _)| !egress_nics.contains(nic.as_str()))
        .collect()
}

pub fn link_down_command(interface: &str) -> String {
    format!("nmcli device set {0} managed no; ip link set {0} down", interface)
}

pub fn link_up_command(interface: &str) -> String {
    format!("ip link set {0} up; nmcli device set {0} managed yes", interface)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_by_nic() {
        let groups = group_by_nic(&["ens1f1", "ens1f0", "ens2f0", "ens1f0"]);
        assert_eq!(groups["ens1f"], vec!["ens1f0", "ens1f1"]);
        assert_eq!(groups["ens2f"], vec!["ens2f0"]);
        assert_eq!(nic_name("1234"), "1234");
    }

    #[test]
    fn test_egress_via_route_device() {
        let route = "default via 10.0.0.1 dev ens2f0 proto dhcp src 10.0.0.5 metric 100\n";
        assert_eq!(default_route_device(route), Some("ens2f0"));
        assert_eq!(egress_interfaces(route, ""), BTreeSet::from(["ens2f0".to_string()]));
    }

    #[test]
    fn test_egress_via_ovs_bridge() {
        let route = "default via 10.0.0.1 dev br-ex proto dhcp metric 48\n";
        let ports = "ens1f1\npatch-br-ex_n0-to-br-int\n";
        let egress = egress_interfaces(route, ports);
        assert_eq!(egress, BTreeSet::from(["ens1f1".to_string()]));

        let groups = group_by_nic(&["ens1f0", "ens1f1", "ens2f0"]);
        let flappable = flappable_nics(groups, &egress);
        assert_eq!(flappable.keys().collect::<Vec<_>>(), vec!["ens2f"]);
    }

    #[test]
    fn test_no_default_route() {
        assert!(egress_interfaces("10.0.0.0/24 dev ens2f0 proto kernel\n", "").is_empty());
    }
}
