//! Network namespace switching via `setns(2)`
//!
//! `setns` changes the namespace of the calling thread only.  The switcher
//! therefore records the thread's current namespace before entering the
//! target and the returned guard moves the same thread back.  Callers must
//! keep the guard on the thread that created it, which holds for the
//! blocking workers the engine and the dump pool run descriptors on.
//!
//! Entering a namespace other than the agent's own requires `CAP_SYS_ADMIN`.

use nix::errno::Errno;
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, error};

use super::{NamespaceError, NamespaceGuard, NamespaceRef, NamespaceSwitcher};

/// Namespace file of the calling thread.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Switches the calling thread between Linux network namespaces.
#[derive(Debug, Clone)]
pub struct NetnsSwitcher {
    thread_netns: PathBuf,
}

impl NetnsSwitcher {
    pub fn new() -> Self {
        Self {
            thread_netns: PathBuf::from(THREAD_NETNS),
        }
    }
}

impl Default for NetnsSwitcher {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceSwitcher for NetnsSwitcher {
    fn switch_to(&self, ns: &NamespaceRef) -> Result<NamespaceGuard, NamespaceError> {
        let Some(path) = ns.path() else {
            return Ok(NamespaceGuard::noop(ns.clone()));
        };

        let target = File::open(&path).map_err(|source| {
            if source.kind() == ErrorKind::NotFound {
                NamespaceError::NotFound(ns.clone())
            } else {
                NamespaceError::Open {
                    ns: ns.clone(),
                    source,
                }
            }
        })?;

        // Opened before switching so the way back is known to exist.
        let original = File::open(&self.thread_netns).map_err(|source| NamespaceError::Open {
            ns: NamespaceRef::Path(self.thread_netns.clone()),
            source,
        })?;

        set_netns(&target).map_err(|source| NamespaceError::Switch {
            ns: ns.clone(),
            source,
        })?;
        debug!(namespace = %ns, "Switched network namespace");

        let entered = ns.clone();
        Ok(NamespaceGuard::new(ns.clone(), move || {
            match set_netns(&original) {
                Ok(()) => debug!(namespace = %entered, "Reverted network namespace"),
                Err(err) => error!(
                    namespace = %entered,
                    error = %err,
                    "Failed to revert network namespace"
                ),
            }
        }))
    }
}

/// Moves the calling thread into the network namespace behind `file`.
fn set_netns(file: &File) -> Result<(), Errno> {
    setns(file, CloneFlags::CLONE_NEWNET)
}
