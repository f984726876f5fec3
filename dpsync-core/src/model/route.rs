//! Linux static route model.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::addrs::IpNetwork;

/// Prefix of all static route keys.
pub const ROUTE_KEY_PREFIX: &str = "linux/config/l3/route/";

/// Prefix of the keys derived from link-local routes.
pub const LINK_LOCAL_ROUTE_KEY_PREFIX: &str = "linux/l3/link-local-route/";

/// Route scope as configured from the northbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteScope {
    #[default]
    Undefined,
    Global,
    Site,
    Host,
    Link,
}

impl fmt::Display for RouteScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "UNDEFINED"),
            Self::Global => write!(f, "GLOBAL"),
            Self::Site => write!(f, "SITE"),
            Self::Host => write!(f, "HOST"),
            Self::Link => write!(f, "LINK"),
        }
    }
}

/// Desired (or discovered) configuration of one Linux static route.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticRoute {
    /// Interface the route points out of.
    pub outgoing_interface: String,
    pub scope: RouteScope,
    /// Destination network in CIDR notation.
    pub dst_network: String,
    /// Gateway address; empty for directly connected destinations.
    pub gw_addr: String,
    pub metric: u32,
}

impl StaticRoute {
    /// Key under which this route is stored.
    pub fn key(&self) -> String {
        route_key(&self.dst_network, &self.outgoing_interface)
    }
}

/// `linux/config/l3/route/{outgoing-interface}/{dst-address}/{prefix-len}`
///
/// The destination is canonicalized to its network address when it parses.
pub fn route_key(dst_network: &str, outgoing_interface: &str) -> String {
    format!(
        "{ROUTE_KEY_PREFIX}{outgoing_interface}/{}",
        canonical_network(dst_network)
    )
}

/// Parses a route key into the outgoing interface and destination.
pub fn parse_route_key(key: &str) -> Option<(String, IpNetwork)> {
    parse_network_key(key, ROUTE_KEY_PREFIX)
}

/// `linux/l3/link-local-route/{outgoing-interface}/{dst-address}/{prefix-len}`
pub fn link_local_route_key(dst_network: &str, outgoing_interface: &str) -> String {
    format!(
        "{LINK_LOCAL_ROUTE_KEY_PREFIX}{outgoing_interface}/{}",
        canonical_network(dst_network)
    )
}

/// Parses a link-local route key into the destination and outgoing interface.
pub fn parse_link_local_route_key(key: &str) -> Option<(IpNetwork, String)> {
    parse_network_key(key, LINK_LOCAL_ROUTE_KEY_PREFIX).map(|(if_name, dst)| (dst, if_name))
}

fn canonical_network(dst_network: &str) -> String {
    match dst_network.parse::<IpNetwork>() {
        Ok(net) => net.to_string(),
        Err(_) => dst_network.trim().to_string(),
    }
}

fn parse_network_key(key: &str, prefix: &str) -> Option<(String, IpNetwork)> {
    let rest = key.strip_prefix(prefix)?;
    let (if_name, dst) = rest.split_once('/')?;
    if if_name.is_empty() {
        return None;
    }
    let dst = dst.parse::<IpNetwork>().ok()?;
    Some((if_name.to_string(), dst))
}
