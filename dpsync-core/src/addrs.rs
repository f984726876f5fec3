//! IP address and network helpers
//!
//! Desired state carries addresses as strings, exactly as the operator wrote
//! them.  Comparing those strings directly would treat `10.0.0.1/24` and
//! `10.0.0.0/24`, or `FE80::1` and `fe80::1`, as different objects, so every
//! comparison here parses first and only falls back to a case-insensitive
//! string compare when parsing fails.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;

/// IPv4 address matching any destination.
pub const IPV4_ADDR_ANY: &str = "0.0.0.0";
/// IPv6 address matching any destination.
pub const IPV6_ADDR_ANY: &str = "::";

/// Failure to parse a network in CIDR notation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkParseError {
    #[error("network {0:?} has no prefix length")]
    MissingPrefix(String),
    #[error("network {0:?} has an invalid address")]
    InvalidAddress(String),
    #[error("network {0:?} has an invalid prefix length")]
    InvalidPrefix(String),
}

/// An IP network: an address masked down to its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    /// Build a network from any address inside it.
    ///
    /// Returns `None` when the prefix is longer than the address family allows.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Option<Self> {
        let addr = match addr {
            IpAddr::V4(v4) if prefix_len <= 32 => {
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask_v4(prefix_len)))
            }
            IpAddr::V6(v6) if prefix_len <= 128 => {
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask_v6(prefix_len)))
            }
            _ => return None,
        };
        Some(Self { addr, prefix_len })
    }

    /// The network matching every destination of one family.
    pub fn any(ipv6: bool) -> Self {
        let addr = if ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        Self { addr, prefix_len: 0 }
    }

    /// Network address (host bits cleared).
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// `true` when the network covers every destination of its family.
    pub fn is_any(&self) -> bool {
        self.prefix_len == 0
    }

    /// Returns `true` if `ip` lies inside this network.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                u32::from(*ip) & mask_v4(self.prefix_len) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(*ip) & mask_v6(self.prefix_len) == u128::from(net)
            }
            _ => false,
        }
    }

    /// `true` for IPv6 link-local unicast networks (`fe80::/10`).
    pub fn is_ipv6_link_local(&self) -> bool {
        match self.addr {
            IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 == 0xfe80,
            IpAddr::V4(_) => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = NetworkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| NetworkParseError::MissingPrefix(s.to_string()))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| NetworkParseError::InvalidAddress(s.to_string()))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| NetworkParseError::InvalidPrefix(s.to_string()))?;
        Self::new(addr, prefix_len).ok_or_else(|| NetworkParseError::InvalidPrefix(s.to_string()))
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

fn mask_v4(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

fn mask_v6(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix_len))
    }
}

/// Compares two IP addresses for equality.
pub fn equal_addrs(addr1: &str, addr2: &str) -> bool {
    match (addr1.trim().parse::<IpAddr>(), addr2.trim().parse::<IpAddr>()) {
        (Ok(a1), Ok(a2)) => a1 == a2,
        _ => addr1.to_lowercase() == addr2.to_lowercase(),
    }
}

/// Compares two IP networks for equality.
pub fn equal_networks(net1: &str, net2: &str) -> bool {
    match (net1.parse::<IpNetwork>(), net2.parse::<IpNetwork>()) {
        (Ok(n1), Ok(n2)) => n1 == n2,
        _ => net1.to_lowercase() == net2.to_lowercase(),
    }
}

/// Reports whether an address or network literal is IPv6.
///
/// Unparsable input counts as IPv6 only if it contains a colon.
pub fn is_ipv6(addr: &str) -> bool {
    if let Ok(net) = addr.parse::<IpNetwork>() {
        return net.is_ipv6();
    }
    match addr.trim().parse::<IpAddr>() {
        Ok(ip) => ip.is_ipv6(),
        Err(_) => addr.contains(':'),
    }
}
