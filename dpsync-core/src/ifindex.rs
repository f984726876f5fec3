//! Interface Index - logical interface name to runtime metadata
//!
//! The index is maintained by the interface plugin; descriptors only read
//! it.  Entries may disappear between two reads, which callers treat as
//! "not resolvable yet" rather than as a fatal condition.

use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::debug;

use crate::namespace::NamespaceRef;

/// Runtime metadata of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceMeta {
    /// Kernel interface index inside the owning namespace.
    pub linux_if_index: i32,
    /// Namespace the interface lives in.
    pub namespace: NamespaceRef,
}

/// Read-only view of the interface index.
pub trait InterfaceIndex: Send + Sync {
    fn lookup_by_name(&self, name: &str) -> Option<InterfaceMeta>;

    /// All interface names in a stable order.
    fn list_all(&self) -> Vec<String>;
}

/// Lock-guarded interface index owned by the interface plugin.
///
/// Mutation is the owner's business; everything inside this crate goes
/// through the [`InterfaceIndex`] view.
#[derive(Debug, Default)]
pub struct SharedInterfaceIndex {
    entries: RwLock<BTreeMap<String, InterfaceMeta>>,
}

impl SharedInterfaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the metadata of an interface.
    pub fn put(&self, name: impl Into<String>, meta: InterfaceMeta) {
        let name = name.into();
        debug!(interface = %name, if_index = meta.linux_if_index, "Interface indexed");
        self.entries
            .write()
            .expect("interface index lock poisoned during put")
            .insert(name, meta);
    }

    /// Remove an interface, returning its last metadata.
    pub fn remove(&self, name: &str) -> Option<InterfaceMeta> {
        let removed = self
            .entries
            .write()
            .expect("interface index lock poisoned during remove")
            .remove(name);
        if removed.is_some() {
            debug!(interface = %name, "Interface removed from index");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("interface index lock poisoned during len")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InterfaceIndex for SharedInterfaceIndex {
    fn lookup_by_name(&self, name: &str) -> Option<InterfaceMeta> {
        self.entries
            .read()
            .expect("interface index lock poisoned during lookup")
            .get(name)
            .cloned()
    }

    fn list_all(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("interface index lock poisoned during list")
            .keys()
            .cloned()
            .collect()
    }
}
