//! Address/prefix arithmetic shared by customization and the IP waiter.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::VsphereError;

/// An address with a prefix length, e.g. `10.0.0.0/24` or `fd00::/64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, VsphereError> {
        let max = max_prefix(&addr);
        if prefix > max {
            return Err(VsphereError::config(format!(
                "prefix length {prefix} out of range for {addr} (max {max})"
            )));
        }
        Ok(Self { addr, prefix })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Whether `ip` falls inside this network. Mixed families never match.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        same_network(&self.addr, ip, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = VsphereError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| VsphereError::config(format!("invalid address in '{s}'")))?;
        let prefix = match prefix {
            Some(p) => p
                .trim()
                .parse::<u8>()
                .map_err(|_| VsphereError::config(format!("invalid prefix length in '{s}'")))?,
            None => max_prefix(&addr),
        };
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

pub fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

pub fn v4_mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    }
}

pub fn v6_mask(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p if p >= 128 => u128::MAX,
        p => u128::MAX << (128 - p),
    }
}

/// Compare two addresses under a prefix mask.
pub fn same_network(a: &IpAddr, b: &IpAddr, prefix: u8) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            let m = v4_mask(prefix);
            u32::from(*a) & m == u32::from(*b) & m
        }
        (IpAddr::V6(a), IpAddr::V6(b)) => {
            let m = v6_mask(prefix);
            u128::from(*a) & m == u128::from(*b) & m
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_contains() {
        let net: Cidr = "10.0.0.0/24".parse().unwrap();
        assert!(net.contains(&"10.0.0.77".parse().unwrap()));
        assert!(!net.contains(&"10.0.1.1".parse().unwrap()));
        assert!(!net.contains(&"fd00::1".parse().unwrap()));
    }

    #[test]
    fn bare_address_is_host_route() {
        let net: Cidr = "192.168.1.10".parse().unwrap();
        assert_eq!(net.prefix(), 32);
        assert!(net.contains(&"192.168.1.10".parse().unwrap()));
        assert!(!net.contains(&"192.168.1.11".parse().unwrap()));
    }

    #[test]
    fn v6_networks() {
        let net: Cidr = "fd00:1::/64".parse().unwrap();
        assert!(net.contains(&"fd00:1::abcd".parse().unwrap()));
        assert!(!net.contains(&"fd00:2::1".parse().unwrap()));
    }

    #[test]
    fn rejects_bad_input() {
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("nope/8".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
    }

    #[test]
    fn zero_prefix_matches_family() {
        let net: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(net.contains(&"8.8.8.8".parse().unwrap()));
    }
}
