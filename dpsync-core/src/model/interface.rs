//! Keys published by the interface plugin.
//!
//! Interfaces are reconciled outside this crate; their state and addresses
//! only appear here as keys that routes depend on.

use crate::addrs::IpNetwork;

/// Prefix of keys announcing the operational state of an interface.
pub const INTERFACE_STATE_KEY_PREFIX: &str = "linux/interface/state/";

/// Prefix of keys announcing an IP address assigned to an interface.
pub const INTERFACE_ADDRESS_KEY_PREFIX: &str = "linux/interface/address/";

/// `linux/interface/state/{name}/{UP|DOWN}`
pub fn interface_state_key(if_name: &str, up: bool) -> String {
    let state = if up { "UP" } else { "DOWN" };
    format!("{INTERFACE_STATE_KEY_PREFIX}{if_name}/{state}")
}

/// Parses an interface state key into the interface name and its up flag.
pub fn parse_interface_state_key(key: &str) -> Option<(String, bool)> {
    let rest = key.strip_prefix(INTERFACE_STATE_KEY_PREFIX)?;
    let (if_name, state) = rest.rsplit_once('/')?;
    if if_name.is_empty() {
        return None;
    }
    match state {
        "UP" => Some((if_name.to_string(), true)),
        "DOWN" => Some((if_name.to_string(), false)),
        _ => None,
    }
}

/// `linux/interface/address/{name}/{addr}/{prefix-len}`
pub fn interface_address_key(if_name: &str, address: &str) -> String {
    format!("{INTERFACE_ADDRESS_KEY_PREFIX}{if_name}/{address}")
}

/// Parses an interface address key into the interface name and the local
/// network the address belongs to.
pub fn parse_interface_address_key(key: &str) -> Option<(String, IpNetwork)> {
    let rest = key.strip_prefix(INTERFACE_ADDRESS_KEY_PREFIX)?;
    let (if_name, address) = rest.split_once('/')?;
    if if_name.is_empty() {
        return None;
    }
    let network = address.parse::<IpNetwork>().ok()?;
    Some((if_name.to_string(), network))
}
