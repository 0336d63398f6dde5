//! Guest customization spec construction.
//!
//! Turns per-interface addressing requests plus global gateway/DNS settings
//! into the platform's customization payload. Each family's gateway is handed
//! to the first interface whose subnet contains it; later interfaces on the
//! same subnet are left without one.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::{VsphereError, VsphereResult};
use crate::net::{self, Cidr};

// ── Platform payload ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinuxPrep {
    pub host_name: String,
    pub domain: String,
    pub time_zone: String,
    pub hw_clock_utc: bool,
}

impl LinuxPrep {
    /// Linux identity with the default clock settings (UTC, hardware clock in UTC).
    pub fn new(host_name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            domain: domain.into(),
            time_zone: "UTC".into(),
            hw_clock_utc: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Identity {
    LinuxPrep(LinuxPrep),
    /// Raw unattend/sysprep answer file contents.
    SysprepText { value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpGenerator {
    FixedIp { ip_address: String },
    Dhcp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixedIpv6 {
    pub ip_address: String,
    pub subnet_mask: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ipv6Settings {
    pub ip: Vec<FixedIpv6>,
    #[serde(default)]
    pub gateway: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpSettings {
    pub ip: IpGenerator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_mask: Option<String>,
    #[serde(default)]
    pub gateway: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Settings>,
    #[serde(default)]
    pub dns_server_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterMapping {
    pub adapter: IpSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GlobalIpSettings {
    #[serde(default)]
    pub dns_server_list: Vec<String>,
    #[serde(default)]
    pub dns_suffix_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomizationSpec {
    pub identity: Identity,
    pub global_ip_settings: GlobalIpSettings,
    pub nic_setting_map: Vec<AdapterMapping>,
}

// ── Request side ────────────────────────────────────────────────────

/// Addressing request for one network adapter, in adapter order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkInterfaceCustomization {
    #[serde(default)]
    pub dns_server_list: Vec<String>,
    #[serde(default)]
    pub dns_domain: String,
    #[serde(default)]
    pub ipv4_address: String,
    #[serde(default)]
    pub ipv4_netmask: u8,
    #[serde(default)]
    pub ipv6_address: String,
    #[serde(default)]
    pub ipv6_netmask: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GlobalGateways {
    #[serde(default)]
    pub ipv4_gateway: String,
    #[serde(default)]
    pub ipv6_gateway: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GlobalDns {
    #[serde(default)]
    pub dns_server_list: Vec<String>,
    #[serde(default)]
    pub dns_suffix_list: Vec<String>,
}

/// Dotted-decimal form of an IPv4 prefix length (24 -> "255.255.255.0").
pub fn v4_cidr_mask_to_dotted(prefix: u8) -> String {
    let m = net::v4_mask(prefix).to_be_bytes();
    format!("{}.{}.{}.{}", m[0], m[1], m[2], m[3])
}

/// Whether `gateway` lies in the subnet `address/prefix`.
pub fn match_gateway(address: &str, prefix: u8, gateway: &str) -> bool {
    let (Ok(ip), Ok(gw)) = (address.parse::<IpAddr>(), gateway.parse::<IpAddr>()) else {
        return false;
    };
    net::same_network(&ip, &gw, prefix)
}

pub fn build_spec(
    identity: Identity,
    interfaces: &[NetworkInterfaceCustomization],
    gateways: &GlobalGateways,
    dns: &GlobalDns,
) -> VsphereResult<CustomizationSpec> {
    if interfaces.is_empty() {
        return Err(VsphereError::config("one or more `network_interface` must be provided"));
    }

    let mut v4_gateway_found = false;
    let mut v6_gateway_found = false;
    let mut nic_setting_map = Vec::with_capacity(interfaces.len());

    for (i, nic) in interfaces.iter().enumerate() {
        let (adapter, v4_found, v6_found) =
            ip_settings(i, nic, gateways, !v4_gateway_found, !v6_gateway_found)?;
        v4_gateway_found |= v4_found;
        v6_gateway_found |= v6_found;
        nic_setting_map.push(AdapterMapping { adapter });
    }

    if !gateways.ipv4_gateway.is_empty() && !v4_gateway_found {
        return Err(VsphereError::config(format!(
            "ipv4_gateway {} is not reachable from any network_interface",
            gateways.ipv4_gateway
        )));
    }
    if !gateways.ipv6_gateway.is_empty() && !v6_gateway_found {
        return Err(VsphereError::config(format!(
            "ipv6_gateway {} is not reachable from any network_interface",
            gateways.ipv6_gateway
        )));
    }

    Ok(CustomizationSpec {
        identity,
        global_ip_settings: GlobalIpSettings {
            dns_server_list: dns.dns_server_list.clone(),
            dns_suffix_list: dns.dns_suffix_list.clone(),
        },
        nic_setting_map,
    })
}

fn ip_settings(
    index: usize,
    nic: &NetworkInterfaceCustomization,
    gateways: &GlobalGateways,
    v4_gateway_wanted: bool,
    v6_gateway_wanted: bool,
) -> VsphereResult<(IpSettings, bool, bool)> {
    let mut v4_found = false;

    let (ip, subnet_mask, gateway) = if nic.ipv4_address.is_empty() {
        (IpGenerator::Dhcp, None, Vec::new())
    } else {
        check_address(index, "ipv4", &nic.ipv4_address, nic.ipv4_netmask, true)?;
        let mut gateway = Vec::new();
        if v4_gateway_wanted
            && !gateways.ipv4_gateway.is_empty()
            && match_gateway(&nic.ipv4_address, nic.ipv4_netmask, &gateways.ipv4_gateway)
        {
            gateway.push(gateways.ipv4_gateway.clone());
            v4_found = true;
        }
        (
            IpGenerator::FixedIp { ip_address: nic.ipv4_address.clone() },
            Some(v4_cidr_mask_to_dotted(nic.ipv4_netmask)),
            gateway,
        )
    };

    let (ipv6, v6_found) = ipv6_settings(index, nic, gateways, v6_gateway_wanted)?;

    let settings = IpSettings {
        ip,
        subnet_mask,
        gateway,
        ipv6,
        dns_server_list: nic.dns_server_list.clone(),
        dns_domain: (!nic.dns_domain.is_empty()).then(|| nic.dns_domain.clone()),
    };
    Ok((settings, v4_found, v6_found))
}

fn ipv6_settings(
    index: usize,
    nic: &NetworkInterfaceCustomization,
    gateways: &GlobalGateways,
    gateway_wanted: bool,
) -> VsphereResult<(Option<Ipv6Settings>, bool)> {
    if nic.ipv6_address.is_empty() {
        return Ok((None, false));
    }
    check_address(index, "ipv6", &nic.ipv6_address, nic.ipv6_netmask, false)?;

    let mut settings = Ipv6Settings {
        ip: vec![FixedIpv6 {
            ip_address: nic.ipv6_address.clone(),
            subnet_mask: nic.ipv6_netmask,
        }],
        gateway: Vec::new(),
    };
    let mut found = false;
    if gateway_wanted
        && !gateways.ipv6_gateway.is_empty()
        && match_gateway(&nic.ipv6_address, nic.ipv6_netmask, &gateways.ipv6_gateway)
    {
        settings.gateway.push(gateways.ipv6_gateway.clone());
        found = true;
    }
    Ok((Some(settings), found))
}

fn check_address(index: usize, family: &str, address: &str, prefix: u8, v4: bool) -> VsphereResult<()> {
    let ip: IpAddr = address.parse().map_err(|_| {
        VsphereError::config(format!(
            "network_interface[{index}].{family}_address '{address}' is not a valid address"
        ))
    })?;
    if ip.is_ipv4() != v4 {
        return Err(VsphereError::config(format!(
            "network_interface[{index}].{family}_address '{address}' has the wrong address family"
        )));
    }
    Cidr::new(ip, prefix).map_err(|_| {
        VsphereError::config(format!(
            "network_interface[{index}].{family}_netmask {prefix} is out of range"
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux() -> Identity {
        Identity::LinuxPrep(LinuxPrep::new("builder", "lab.local"))
    }

    fn v4(addr: &str, mask: u8) -> NetworkInterfaceCustomization {
        NetworkInterfaceCustomization {
            ipv4_address: addr.into(),
            ipv4_netmask: mask,
            ..Default::default()
        }
    }

    #[test]
    fn dotted_masks() {
        assert_eq!(v4_cidr_mask_to_dotted(24), "255.255.255.0");
        assert_eq!(v4_cidr_mask_to_dotted(32), "255.255.255.255");
        assert_eq!(v4_cidr_mask_to_dotted(0), "0.0.0.0");
        assert_eq!(v4_cidr_mask_to_dotted(20), "255.255.240.0");
    }

    #[test]
    fn gateway_matching() {
        assert!(match_gateway("10.0.0.5", 24, "10.0.0.1"));
        assert!(!match_gateway("10.0.0.5", 24, "10.0.1.1"));
        assert!(match_gateway("fd00::5", 64, "fd00::1"));
        assert!(!match_gateway("10.0.0.5", 24, "garbage"));
    }

    #[test]
    fn first_matching_interface_gets_gateway() {
        let gateways = GlobalGateways { ipv4_gateway: "10.0.0.1".into(), ..Default::default() };
        let spec = build_spec(
            linux(),
            &[v4("10.0.0.5", 24), v4("10.0.0.9", 24)],
            &gateways,
            &GlobalDns::default(),
        )
        .unwrap();
        assert_eq!(spec.nic_setting_map[0].adapter.gateway, vec!["10.0.0.1".to_string()]);
        assert!(spec.nic_setting_map[1].adapter.gateway.is_empty());
    }

    #[test]
    fn gateway_skips_non_matching_interfaces() {
        let gateways = GlobalGateways { ipv4_gateway: "192.168.10.1".into(), ..Default::default() };
        let spec = build_spec(
            linux(),
            &[v4("10.0.0.5", 24), v4("192.168.10.20", 24)],
            &gateways,
            &GlobalDns::default(),
        )
        .unwrap();
        assert!(spec.nic_setting_map[0].adapter.gateway.is_empty());
        assert_eq!(spec.nic_setting_map[1].adapter.gateway, vec!["192.168.10.1".to_string()]);
    }

    #[test]
    fn unreachable_gateway_is_rejected() {
        let gateways = GlobalGateways { ipv4_gateway: "10.9.9.1".into(), ..Default::default() };
        let err = build_spec(linux(), &[v4("10.0.0.5", 24)], &gateways, &GlobalDns::default())
            .unwrap_err();
        assert!(err.message.contains("not reachable"));
    }

    #[test]
    fn dhcp_when_no_address() {
        let spec = build_spec(
            linux(),
            &[NetworkInterfaceCustomization::default()],
            &GlobalGateways::default(),
            &GlobalDns::default(),
        )
        .unwrap();
        let adapter = &spec.nic_setting_map[0].adapter;
        assert_eq!(adapter.ip, IpGenerator::Dhcp);
        assert_eq!(adapter.subnet_mask, None);
        assert!(adapter.ipv6.is_none());
    }

    #[test]
    fn ipv6_path_is_independent() {
        let nic = NetworkInterfaceCustomization {
            ipv6_address: "fd00:10::5".into(),
            ipv6_netmask: 64,
            ..Default::default()
        };
        let gateways = GlobalGateways { ipv6_gateway: "fd00:10::1".into(), ..Default::default() };
        let spec = build_spec(linux(), &[nic], &gateways, &GlobalDns::default()).unwrap();
        let adapter = &spec.nic_setting_map[0].adapter;
        assert_eq!(adapter.ip, IpGenerator::Dhcp);
        let v6 = adapter.ipv6.as_ref().unwrap();
        assert_eq!(v6.ip[0].subnet_mask, 64);
        assert_eq!(v6.gateway, vec!["fd00:10::1".to_string()]);
    }

    #[test]
    fn dns_populated_both_ways() {
        let nic = NetworkInterfaceCustomization {
            dns_server_list: vec!["10.0.0.2".into()],
            dns_domain: "corp.local".into(),
            ..v4("10.0.0.5", 24)
        };
        let dns = GlobalDns {
            dns_server_list: vec!["1.1.1.1".into()],
            dns_suffix_list: vec!["lab.local".into()],
        };
        let spec = build_spec(linux(), &[nic], &GlobalGateways::default(), &dns).unwrap();
        assert_eq!(spec.nic_setting_map[0].adapter.dns_server_list, vec!["10.0.0.2".to_string()]);
        assert_eq!(spec.nic_setting_map[0].adapter.dns_domain.as_deref(), Some("corp.local"));
        assert_eq!(spec.global_ip_settings.dns_suffix_list, vec!["lab.local".to_string()]);
    }

    #[test]
    fn empty_interfaces_rejected() {
        let err = build_spec(linux(), &[], &GlobalGateways::default(), &GlobalDns::default())
            .unwrap_err();
        assert_eq!(err.message, "one or more `network_interface` must be provided");
    }

    #[test]
    fn bad_address_rejected() {
        let err = build_spec(
            linux(),
            &[v4("10.0.0.300", 24)],
            &GlobalGateways::default(),
            &GlobalDns::default(),
        )
        .unwrap_err();
        assert!(err.message.contains("network_interface[0].ipv4_address"));
    }

    #[test]
    fn linux_defaults() {
        let prep = LinuxPrep::new("h", "d");
        assert_eq!(prep.time_zone, "UTC");
        assert!(prep.hw_clock_utc);
    }
}
