//! Versioned set of satisfied keys.
//!
//! A key is satisfied while its object is configured, while an external
//! collaborator announces it, or while it is derived from a configured
//! value.  Dependency predicates are evaluated against this set on every
//! readiness check, so a change made by one job is seen immediately by the
//! jobs still waiting in the same pass.

use std::collections::BTreeSet;
use std::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    keys: BTreeSet<String>,
    version: u64,
}

#[derive(Debug, Default)]
pub struct SatisfiedKeys {
    inner: RwLock<Inner>,
}

impl SatisfiedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the key was not satisfied before.
    pub fn insert(&self, key: impl Into<String>) -> bool {
        let mut inner = self
            .inner
            .write()
            .expect("satisfied set poisoned during insert");
        let inserted = inner.keys.insert(key.into());
        if inserted {
            inner.version += 1;
        }
        inserted
    }

    /// Returns `true` if the key was satisfied before.
    pub fn remove(&self, key: &str) -> bool {
        let mut inner = self
            .inner
            .write()
            .expect("satisfied set poisoned during remove");
        let removed = inner.keys.remove(key);
        if removed {
            inner.version += 1;
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .read()
            .expect("satisfied set poisoned during contains")
            .keys
            .contains(key)
    }

    /// `true` if any satisfied key matches `predicate`.
    pub fn any(&self, mut predicate: impl FnMut(&str) -> bool) -> bool {
        self.inner
            .read()
            .expect("satisfied set poisoned during any")
            .keys
            .iter()
            .any(|key| predicate(key))
    }

    /// Bumped on every change.
    pub fn version(&self) -> u64 {
        self.inner
            .read()
            .expect("satisfied set poisoned during version")
            .version
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("satisfied set poisoned during snapshot")
            .keys
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("satisfied set poisoned during len")
            .keys
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_tracks_changes_only() {
        let set = SatisfiedKeys::new();
        assert_eq!(set.version(), 0);

        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert_eq!(set.version(), 1);

        assert!(!set.remove("b"));
        assert_eq!(set.version(), 1);
        assert!(set.remove("a"));
        assert_eq!(set.version(), 2);
        assert!(set.is_empty());
    }

    #[test]
    fn test_any_and_snapshot() {
        let set = SatisfiedKeys::new();
        set.insert("linux/interface/state/eth1/UP");
        set.insert("linux/interface/state/eth0/UP");

        assert!(set.any(|key| key.ends_with("eth0/UP")));
        assert!(!set.any(|key| key.ends_with("DOWN")));
        assert_eq!(
            set.snapshot(),
            vec![
                "linux/interface/state/eth0/UP",
                "linux/interface/state/eth1/UP"
            ]
        );
        assert_eq!(set.len(), 2);
    }
}
