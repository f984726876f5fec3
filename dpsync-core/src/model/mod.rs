//! Value types and key layouts of the configuration objects.
//!
//! Keys double as directory paths and as dependency references, so every
//! key builder here has a matching parser.

pub mod interface;
pub mod punt;
pub mod route;

pub use interface::{
    interface_address_key, interface_state_key, parse_interface_address_key,
    parse_interface_state_key,
};
pub use punt::{parse_punt_to_host_key, punt_to_host_key, L3Protocol, L4Protocol, PuntToHost};
pub use route::{
    link_local_route_key, parse_link_local_route_key, parse_route_key, route_key, RouteScope,
    StaticRoute,
};
