//! Subnet membership
//!
//! `10.0.0.0/8`, `2001:db8::/32` or a bare address (a single host).
//! IPv4-mapped IPv6 clients (`::ffff:10.1.2.3`) match IPv4 networks.

use crate::error::{FilegateError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An IP network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Create a network; host bits of `address` are cleared
    pub fn new(address: IpAddr, prefix: u8) -> Result<Self> {
        let max = max_prefix(&address);
        if prefix > max {
            return Err(FilegateError::invalid(format!(
                "prefix /{} too long for {}",
                prefix, address
            )));
        }

        let network = match address {
            IpAddr::V4(v4) => IpAddr::from((u32::from(v4) & mask_v4(prefix)).to_be_bytes()),
            IpAddr::V6(v6) => IpAddr::from((u128::from(v6) & mask_v6(prefix)).to_be_bytes()),
        };
        Ok(Self { network, prefix })
    }

    /// Network address
    pub fn network(&self) -> IpAddr {
        self.network
    }

    /// Prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Whether `ip` belongs to this network
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, normalize(ip)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                u32::from(ip) & mask_v4(self.prefix) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(ip) & mask_v6(self.prefix) == u128::from(net)
            }
            _ => false,
        }
    }
}

fn normalize(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(*ip),
        v4 => *v4,
    }
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask_v4(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
}

fn mask_v6(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0)
}

impl FromStr for Cidr {
    type Err = FilegateError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (address, prefix) = match s.split_once('/') {
            Some((address, prefix)) => (address, Some(prefix)),
            None => (s, None),
        };

        let address: IpAddr = address
            .parse()
            .map_err(|_| FilegateError::invalid(format!("invalid network '{}'", s)))?;
        let prefix: Option<u8> = prefix
            .map(|p| p.parse())
            .transpose()
            .map_err(|_| FilegateError::invalid(format!("invalid prefix in '{}'", s)))?;

        match address {
            // ::ffff:a.b.c.d/104 is the IPv4 network a.b.c.d/8
            IpAddr::V6(v6) if v6.to_ipv4_mapped().is_some() => {
                let prefix = prefix.unwrap_or(128);
                if prefix < 96 {
                    return Err(FilegateError::invalid(format!(
                        "prefix of mapped network '{}' must be at least 96",
                        s
                    )));
                }
                Cidr::new(normalize(&address), prefix - 96)
            }
            _ => Cidr::new(address, prefix.unwrap_or(max_prefix(&address))),
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_v4_boundaries() {
        let net: Cidr = "192.168.1.0/24".parse().unwrap();
        assert!(net.contains(&ip("192.168.1.0")));
        assert!(net.contains(&ip("192.168.1.255")));
        assert!(!net.contains(&ip("192.168.2.0")));
        assert!(!net.contains(&ip("192.168.0.255")));
        let net: Cidr = "10.1.1.0/24".parse().unwrap();
        assert!(!net.contains(&ip("10.1.10.1")));
    }

    #[test]
    fn test_host_and_any() {
        let host: Cidr = "10.0.0.7".parse().unwrap();
        assert_eq!(host.prefix(), 32);
        assert!(host.contains(&ip("10.0.0.7")));
        assert!(!host.contains(&ip("10.0.0.8")));

        let any: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains(&ip("203.0.113.9")));
        assert!(!any.contains(&ip("2001:db8::1")));
    }

    #[test]
    fn test_host_bits_cleared() {
        let net: Cidr = "10.1.2.3/8".parse().unwrap();
        assert_eq!(net.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn test_v6_and_mapped() {
        let net: Cidr = "2001:db8::/32".parse().unwrap();
        assert!(net.contains(&ip("2001:db8:ffff::1")));
        assert!(!net.contains(&ip("2001:db9::1")));

        let v4: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(v4.contains(&ip("::ffff:10.2.3.4")));

        let mapped: Cidr = "::ffff:10.0.0.0/104".parse().unwrap();
        assert_eq!(mapped, v4);
    }

    #[test]
    fn test_invalid() {
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("nope".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_serde() {
        let nets: Vec<Cidr> = serde_json::from_str(r#"["10.0.0.0/8", "::1"]"#).unwrap();
        assert_eq!(nets[1].prefix(), 128);
        assert_eq!(serde_json::to_string(&nets[0]).unwrap(), r#""10.0.0.0/8""#);
    }

    proptest! {
        #[test]
        fn prop_v4_membership_matches_arithmetic(addr: u32, other: u32, prefix in 0u8..=32) {
            let net = Cidr::new(IpAddr::V4(Ipv4Addr::from(addr)), prefix).unwrap();
            let shift = 32 - u32::from(prefix);
            let same = u64::from(addr) >> shift == u64::from(other) >> shift;
            prop_assert_eq!(net.contains(&IpAddr::V4(Ipv4Addr::from(other))), same);
        }

        #[test]
        fn prop_network_contains_itself(addr: u128, prefix in 0u8..=128) {
            let net = Cidr::new(IpAddr::V6(Ipv6Addr::from(addr)), prefix).unwrap();
            let IpAddr::V6(network) = net.network() else { unreachable!() };
            prop_assume!(network.to_ipv4_mapped().is_none());
            prop_assert!(net.contains(&net.network()));
        }
    }
}
