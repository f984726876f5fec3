//! Namespace Context - scoped execution inside a network namespace
//!
//! Resource operations for an interface must run inside the network
//! namespace that owns the interface.  Entering a namespace changes the
//! state of the calling OS thread, so entry hands back a [`NamespaceGuard`]
//! that restores the previous namespace exactly once when it is dropped,
//! on every exit path including early returns on error.

pub mod netns;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub use netns::NetnsSwitcher;

/// Directory where named network namespaces are bind-mounted.
pub const NAMED_NETNS_DIR: &str = "/var/run/netns";

/// Reference to a network namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceRef {
    /// The namespace the agent itself runs in.
    #[default]
    Default,
    /// A named namespace under [`NAMED_NETNS_DIR`].
    Named(String),
    /// The namespace of a running process.
    Pid(u32),
    /// An explicit namespace file.
    Path(PathBuf),
}

impl NamespaceRef {
    /// File to open for `setns(2)`; `None` for the agent's own namespace.
    pub fn path(&self) -> Option<PathBuf> {
        match self {
            Self::Default => None,
            Self::Named(name) => Some(PathBuf::from(NAMED_NETNS_DIR).join(name)),
            Self::Pid(pid) => Some(PathBuf::from(format!("/proc/{pid}/ns/net"))),
            Self::Path(path) => Some(path.clone()),
        }
    }
}

impl fmt::Display for NamespaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "<default>"),
            Self::Named(name) => write!(f, "netns:{name}"),
            Self::Pid(pid) => write!(f, "pid:{pid}"),
            Self::Path(path) => write!(f, "file:{}", path.display()),
        }
    }
}

#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("namespace {0} does not exist")]
    NotFound(NamespaceRef),
    #[error("failed to open namespace {ns}: {source}")]
    Open {
        ns: NamespaceRef,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to switch into namespace {ns}: {source}")]
    Switch {
        ns: NamespaceRef,
        #[source]
        source: nix::errno::Errno,
    },
}

impl NamespaceError {
    /// `true` when the namespace is legitimately gone rather than unreachable.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Restores the previous namespace of the calling thread when dropped.
#[must_use = "dropping the guard immediately reverts the namespace switch"]
pub struct NamespaceGuard {
    namespace: NamespaceRef,
    revert: Option<Box<dyn FnOnce() + Send>>,
}

impl NamespaceGuard {
    pub fn new(namespace: NamespaceRef, revert: impl FnOnce() + Send + 'static) -> Self {
        Self {
            namespace,
            revert: Some(Box::new(revert)),
        }
    }

    /// A guard for a switch that did not change anything.
    pub fn noop(namespace: NamespaceRef) -> Self {
        Self {
            namespace,
            revert: None,
        }
    }

    /// Namespace the thread is in while the guard lives.
    pub fn namespace(&self) -> &NamespaceRef {
        &self.namespace
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Some(revert) = self.revert.take() {
            revert();
        }
    }
}

impl fmt::Debug for NamespaceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceGuard")
            .field("namespace", &self.namespace)
            .field("pending_revert", &self.revert.is_some())
            .finish()
    }
}

/// Moves the calling thread into a namespace for the lifetime of the guard.
pub trait NamespaceSwitcher: Send + Sync {
    fn switch_to(&self, ns: &NamespaceRef) -> Result<NamespaceGuard, NamespaceError>;
}
