//! Resync - full re-discovery of the system and correlation with desired state
//!
//! The engine dumps every descriptor that supports it, in the order given
//! by their dump dependencies, and classifies each discovered object with
//! [`correlate`].  The dump itself is spread over a bounded [`DumpPool`].

pub mod pool;
pub mod source;

use serde::{Deserialize, Serialize};

use crate::engine::ReconcileReport;

pub use pool::{stride, worker_count, Discovery, DumpPool};
pub use source::{DesiredStateSource, FileSource, ResyncRequest};

/// What to do with a discovered object nobody asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwantedPolicy {
    /// Delete it from the system.
    #[default]
    Remove,
    /// Leave it alone and do not track it.
    Ignore,
}

/// Decision for one discovered object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// Exists exactly as desired.
    Adopt,
    /// Desired with a different value.
    Modify,
    /// Not desired; will be deleted.
    RemoveUnwanted,
    /// Not desired; left alone.
    IgnoreUnwanted,
}

pub fn correlate(desired_matches: Option<bool>, policy: UnwantedPolicy) -> Correlation {
    match (desired_matches, policy) {
        (Some(true), _) => Correlation::Adopt,
        (Some(false), _) => Correlation::Modify,
        (None, UnwantedPolicy::Remove) => Correlation::RemoveUnwanted,
        (None, UnwantedPolicy::Ignore) => Correlation::IgnoreUnwanted,
    }
}

/// Dump failure of one descriptor; its partial results were still used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpFailure {
    pub descriptor: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Descriptors dumped, in dump order.
    pub dumped: Vec<String>,
    /// Descriptors whose objects cannot be enumerated.
    pub skipped: Vec<String>,
    pub discovered: usize,
    pub adopted: usize,
    pub to_modify: usize,
    pub to_remove: usize,
    pub ignored: usize,
    /// Tracked objects missing from a complete dump.
    pub vanished: usize,
    pub dump_failures: Vec<DumpFailure>,
    /// The reconciliation pass that followed the correlation.
    pub reconcile: ReconcileReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_table() {
        assert_eq!(correlate(Some(true), UnwantedPolicy::Ignore), Correlation::Adopt);
        assert_eq!(correlate(Some(false), UnwantedPolicy::Remove), Correlation::Modify);
        assert_eq!(correlate(None, UnwantedPolicy::Remove), Correlation::RemoveUnwanted);
        assert_eq!(correlate(None, UnwantedPolicy::Ignore), Correlation::IgnoreUnwanted);
    }

    #[test]
    fn test_policy_serde() {
        let policy: UnwantedPolicy = serde_json::from_str(r#""ignore""#).unwrap();
        assert_eq!(policy, UnwantedPolicy::Ignore);
        assert_eq!(UnwantedPolicy::default(), UnwantedPolicy::Remove);
    }
}
