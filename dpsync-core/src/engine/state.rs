//! Per-key bookkeeping and the reports handed back to callers.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::descriptor::{KvDescriptor, Metadata, Origin, Value};

/// Lifecycle of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum KeyState {
    /// Known to the engine, nothing attempted yet.
    Unknown,
    /// Waiting for dependencies to become satisfied.
    PendingDependencies,
    /// An operation is in flight.
    Applying,
    Configured,
    /// Last operation failed; terminal failures wait for a new value.
    Failed { retriable: bool },
    /// Deleted from the system.
    Removed,
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::PendingDependencies => write!(f, "pending-dependencies"),
            Self::Applying => write!(f, "applying"),
            Self::Configured => write!(f, "configured"),
            Self::Failed { retriable: true } => write!(f, "failed (retriable)"),
            Self::Failed { retriable: false } => write!(f, "failed (terminal)"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// What currently exists in the system for a key.
#[derive(Clone)]
pub(crate) struct Applied {
    pub value: Value,
    pub metadata: Option<Metadata>,
    /// Derived keys published while this value is applied.
    pub derived: Vec<String>,
}

pub(crate) struct KeyRecord {
    pub descriptor: Arc<dyn KvDescriptor>,
    pub desired: Option<Value>,
    pub applied: Option<Applied>,
    pub state: KeyState,
    pub origin: Origin,
    pub last_error: Option<String>,
    /// Attempts made for the current desired value.
    pub attempts: u32,
    /// Value of the last Add/Modify attempt.
    pub last_attempted: Option<Value>,
}

impl KeyRecord {
    pub fn new(descriptor: Arc<dyn KvDescriptor>, origin: Origin) -> Self {
        Self {
            descriptor,
            desired: None,
            applied: None,
            state: KeyState::Unknown,
            origin,
            last_error: None,
            attempts: 0,
            last_attempted: None,
        }
    }

    /// `true` while the desired value is the one that last failed terminally.
    pub fn is_terminally_failed(&self, key: &str) -> bool {
        if self.state != (KeyState::Failed { retriable: false }) {
            return false;
        }
        match (&self.desired, &self.last_attempted) {
            (Some(desired), Some(attempted)) => {
                self.descriptor.equivalent(key, attempted, desired)
            }
            _ => false,
        }
    }

    /// Forgets the last outcome after discovery replaced the applied value.
    /// A terminal failure stays until the desired value changes.
    pub fn rediscovered(&mut self) {
        if self.state != (KeyState::Failed { retriable: false }) {
            self.state = KeyState::Unknown;
        }
    }

    pub fn status(&self, key: &str) -> KeyStatus {
        KeyStatus {
            key: key.to_string(),
            descriptor: self.descriptor.name().to_string(),
            state: self.state,
            origin: self.origin,
            desired: self.desired.clone(),
            applied: self.applied.is_some(),
            last_error: self.last_error.clone(),
            attempts: self.attempts,
        }
    }
}

/// Everything the engine tracks, guarded by one lock.
#[derive(Default)]
pub(crate) struct EngineState {
    pub records: BTreeMap<String, KeyRecord>,
}

/// Point-in-time view of one key.
#[derive(Debug, Clone)]
pub struct KeyStatus {
    pub key: String,
    pub descriptor: String,
    pub state: KeyState,
    pub origin: Origin,
    pub desired: Option<Value>,
    /// `true` if the object exists in the system as far as the engine knows.
    pub applied: bool,
    pub last_error: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFailure {
    pub key: String,
    pub error: String,
    pub retriable: bool,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Keys added or changed.
    pub applied: Vec<String>,
    /// Keys deleted, unwanted ones included.
    pub removed: Vec<String>,
    /// Keys taken down because a dependency went away.
    pub unapplied: Vec<String>,
    pub failed: Vec<KeyFailure>,
    /// Keys left waiting for dependencies.
    pub pending: Vec<String>,
}

impl ReconcileReport {
    pub fn is_converged(&self) -> bool {
        self.failed.is_empty() && self.pending.is_empty()
    }

    pub fn has_retriable_failures(&self) -> bool {
        self.failed.iter().any(|f| f.retriable)
    }

    pub fn failure(&self, key: &str) -> Option<&KeyFailure> {
        self.failed.iter().find(|f| f.key == key)
    }
}
