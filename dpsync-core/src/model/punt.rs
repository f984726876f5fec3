//! Dataplane punt-to-host model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix of all punt-to-host keys.
pub const PUNT_TO_HOST_KEY_PREFIX: &str = "vpp/config/punt/tohost/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum L3Protocol {
    #[default]
    #[serde(rename = "UNDEFINED_L3")]
    Undefined,
    #[serde(rename = "IPv4")]
    Ipv4,
    #[serde(rename = "IPv6")]
    Ipv6,
    #[serde(rename = "ALL")]
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum L4Protocol {
    #[default]
    #[serde(rename = "UNDEFINED_L4")]
    Undefined,
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl fmt::Display for L3Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "UNDEFINED_L3"),
            Self::Ipv4 => write!(f, "IPv4"),
            Self::Ipv6 => write!(f, "IPv6"),
            Self::All => write!(f, "ALL"),
        }
    }
}

impl FromStr for L3Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNDEFINED_L3" => Ok(Self::Undefined),
            "IPv4" => Ok(Self::Ipv4),
            "IPv6" => Ok(Self::Ipv6),
            "ALL" => Ok(Self::All),
            _ => Err(()),
        }
    }
}

impl fmt::Display for L4Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "UNDEFINED_L4"),
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
        }
    }
}

impl FromStr for L4Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNDEFINED_L4" => Ok(Self::Undefined),
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            _ => Err(()),
        }
    }
}

/// Punts matching traffic to the host stack, or to a unix domain socket
/// when `socket_path` is set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PuntToHost {
    pub l3_protocol: L3Protocol,
    pub l4_protocol: L4Protocol,
    pub port: u32,
    pub socket_path: String,
}

impl PuntToHost {
    pub fn key(&self) -> String {
        punt_to_host_key(self.l3_protocol, self.l4_protocol, self.port)
    }
}

/// `vpp/config/punt/tohost/l3/{l3}/l4/{l4}/port/{port}`
pub fn punt_to_host_key(l3: L3Protocol, l4: L4Protocol, port: u32) -> String {
    format!("{PUNT_TO_HOST_KEY_PREFIX}l3/{l3}/l4/{l4}/port/{port}")
}

pub fn parse_punt_to_host_key(key: &str) -> Option<(L3Protocol, L4Protocol, u32)> {
    let rest = key.strip_prefix(PUNT_TO_HOST_KEY_PREFIX)?;
    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        ["l3", l3, "l4", l4, "port", port] => {
            Some((l3.parse().ok()?, l4.parse().ok()?, port.parse().ok()?))
        }
        _ => None,
    }
}
