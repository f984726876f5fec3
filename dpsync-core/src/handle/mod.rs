//! Resource Handles - synchronous operations against one resource domain
//!
//! Handles take fully resolved, resource-native representations: addresses
//! are parsed and interface names already turned into kernel indices.  They
//! block for the duration of the underlying call and never retry on their
//! own; classifying failures is left to the descriptor that called them.

pub mod dryrun;

use std::net::IpAddr;
use thiserror::Error;

use crate::addrs::IpNetwork;
use crate::model::PuntToHost;

pub use dryrun::{DryRunPuntHandle, DryRunRouteHandle, DryRunSwitcher};

/// Failure reported by a resource handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("system call failed: {0}")]
    Os(#[from] nix::errno::Errno),
    #[error("dataplane rejected the request (retval {retval}): {message}")]
    Rejected { retval: i32, message: String },
}

/// Route scope as understood by rtnetlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelScope(pub u8);

impl KernelScope {
    pub const UNIVERSE: Self = Self(0);
    pub const SITE: Self = Self(200);
    pub const LINK: Self = Self(253);
    pub const HOST: Self = Self(254);
    pub const NOWHERE: Self = Self(255);
}

/// A route in kernel representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRoute {
    pub link_index: i32,
    /// `None` for default routes as reported by the kernel.
    pub dst: Option<IpNetwork>,
    pub gw: Option<IpAddr>,
    pub scope: KernelScope,
    pub priority: u32,
}

/// Static route operations, executed in the caller's current namespace.
pub trait RouteHandle: Send + Sync {
    fn add_static_route(&self, route: &KernelRoute) -> Result<(), HandleError>;
    fn replace_static_route(&self, route: &KernelRoute) -> Result<(), HandleError>;
    fn del_static_route(&self, route: &KernelRoute) -> Result<(), HandleError>;

    /// Routes pointing out of one interface, split into IPv4 and IPv6.
    fn get_static_routes(
        &self,
        link_index: i32,
    ) -> Result<(Vec<KernelRoute>, Vec<KernelRoute>), HandleError>;
}

/// Dataplane punt operations.
pub trait PuntHandle: Send + Sync {
    fn add_punt(&self, punt: &PuntToHost) -> Result<(), HandleError>;
    fn register_punt_socket(&self, punt: &PuntToHost) -> Result<(), HandleError>;
    fn deregister_punt_socket(&self, punt: &PuntToHost) -> Result<(), HandleError>;
}
