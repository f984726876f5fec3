//! Descriptor Contract - one pluggable handler per object type
//!
//! A descriptor owns everything type-specific about a class of keys: which
//! keys belong to it, how two values compare, how to create, change and
//! remove the real object, which other keys it needs first, which synthetic
//! keys it publishes, which of its errors are worth retrying, and how to
//! enumerate what already exists.
//!
//! Descriptors are written against their own value, metadata and error
//! types through [`Descriptor`].  The engine only sees the type-erased
//! [`KvDescriptor`] produced by [`DescriptorAdapter`], so object types can be
//! mixed freely in one [`DescriptorRegistry`].

pub mod adapter;
pub mod punt;
pub mod registry;
pub mod route;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

use crate::engine::graph::SatisfiedKeys;
use crate::resync::pool::Discovery;

pub use adapter::{AdapterError, DescriptorAdapter, Discovered, KvDescriptor};
pub use punt::{PuntDescriptor, PuntError, PuntValidationError};
pub use registry::{DescriptorRegistry, RegistryError};
pub use route::{RouteDescriptor, RouteError, RouteMetadata, RouteValidationError};

/// Object-safe view of a value payload.
pub trait ValueData: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + fmt::Debug + Send + Sync> ValueData for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Immutable, type-erased value of one key.
///
/// Cloning shares the payload; values are never mutated in place.
#[derive(Clone)]
pub struct Value {
    type_name: &'static str,
    data: Arc<dyn ValueData>,
}

impl Value {
    pub fn new<T: Any + fmt::Debug + Send + Sync>(data: T) -> Self {
        Self {
            type_name: type_name::<T>(),
            data: Arc::new(data),
        }
    }

    /// Payload of derived values that only mark a condition.
    pub fn empty() -> Self {
        Self::new(Empty)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        let data: &dyn ValueData = &*self.data;
        data.as_any().downcast_ref()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.downcast_ref::<T>().is_some()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.data, f)
    }
}

/// Empty marker value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Empty;

/// Type-erased descriptor metadata of a configured key.
pub type Metadata = Arc<dyn Any + Send + Sync>;

/// A key together with its value.
#[derive(Debug, Clone)]
pub struct KeyValue {
    pub key: String,
    pub value: Value,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Where a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Requested through the desired state.
    Northbound,
    /// Found in the system by a dump; nobody has claimed it yet.
    Unknown,
}

/// A key/value pair with optional metadata, as exchanged by dumps.
#[derive(Debug, Clone)]
pub struct KvWithMetadata<V, M> {
    pub key: String,
    pub value: V,
    pub metadata: Option<M>,
    pub origin: Origin,
}

/// Precondition that has to hold before a value may be applied.
#[derive(Clone)]
pub enum Dependency {
    /// A concrete key must be satisfied.
    Key { label: String, key: String },
    /// Any satisfied key matching the predicate will do.
    AnyOf {
        label: String,
        predicate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    },
}

impl Dependency {
    pub fn key(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Key {
            label: label.into(),
            key: key.into(),
        }
    }

    pub fn any_of(
        label: impl Into<String>,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::AnyOf {
            label: label.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Key { label, .. } | Self::AnyOf { label, .. } => label,
        }
    }

    /// Evaluated against the live set, so keys satisfied mid-pass count.
    pub fn is_satisfied(&self, satisfied: &SatisfiedKeys) -> bool {
        match self {
            Self::Key { key, .. } => satisfied.contains(key),
            Self::AnyOf { predicate, .. } => satisfied.any(|key| predicate(key)),
        }
    }

    /// `true` if `key` alone could satisfy this dependency.
    pub fn references(&self, key: &str) -> bool {
        match self {
            Self::Key { key: required, .. } => required == key,
            Self::AnyOf { predicate, .. } => predicate(key),
        }
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key { label, key } => f
                .debug_struct("Key")
                .field("label", label)
                .field("key", key)
                .finish(),
            Self::AnyOf { label, .. } => f
                .debug_struct("AnyOf")
                .field("label", label)
                .finish_non_exhaustive(),
        }
    }
}

/// Handler for one object type, written against its own types.
///
/// CRUD methods block for the duration of the underlying resource call and
/// are run by the engine on blocking worker threads.  Everything else must
/// be pure.
pub trait Descriptor: Send + Sync + 'static {
    type Value: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static;
    type Metadata: Clone + fmt::Debug + Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Unique descriptor name, also used in dump ordering hints.
    fn name(&self) -> &str;

    fn value_type_name(&self) -> &'static str {
        type_name::<Self::Value>()
    }

    /// Pure prefix/structure test; must not claim keys of other types.
    fn is_key(&self, key: &str) -> bool;

    /// `true` when switching from `old` to `new` changes nothing real.
    fn equivalent(&self, key: &str, old: &Self::Value, new: &Self::Value) -> bool;

    fn add(&self, key: &str, value: &Self::Value) -> Result<Self::Metadata, Self::Error>;

    fn delete(
        &self,
        key: &str,
        value: &Self::Value,
        metadata: Option<&Self::Metadata>,
    ) -> Result<(), Self::Error>;

    /// In-place update.  Types without atomic replace keep the default,
    /// which removes the old object and creates the new one.
    fn modify(
        &self,
        key: &str,
        old: &Self::Value,
        new: &Self::Value,
        old_metadata: Option<&Self::Metadata>,
    ) -> Result<Self::Metadata, Self::Error> {
        self.delete(key, old, old_metadata)?;
        self.add(key, new)
    }

    /// Ask the engine to run Delete then Add instead of [`Descriptor::modify`].
    fn modify_with_recreate(
        &self,
        _key: &str,
        _old: &Self::Value,
        _new: &Self::Value,
        _metadata: Option<&Self::Metadata>,
    ) -> bool {
        false
    }

    fn dependencies(&self, _key: &str, _value: &Self::Value) -> Vec<Dependency> {
        Vec::new()
    }

    fn derived_values(&self, _key: &str, _value: &Self::Value) -> Vec<KeyValue> {
        Vec::new()
    }

    /// Closed membership test against the descriptor's terminal errors.
    fn is_retriable_failure(&self, err: &Self::Error) -> bool;

    /// `false` when the resource offers no way to enumerate its objects.
    fn dump_supported(&self) -> bool {
        true
    }

    /// Enumerates existing objects; items gathered before a fatal error are
    /// still returned.
    fn dump(
        &self,
        correlate: &[KvWithMetadata<Self::Value, Self::Metadata>],
    ) -> Discovery<KvWithMetadata<Self::Value, Self::Metadata>, Self::Error>;

    /// Descriptors whose dump has to run before this one.
    fn dump_dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn parse_value(&self, raw: serde_json::Value) -> Result<Self::Value, serde_json::Error> {
        serde_json::from_value(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StaticRoute;

    #[test]
    fn test_value_downcast() {
        let value = Value::new(StaticRoute {
            outgoing_interface: "eth0".into(),
            ..Default::default()
        });
        assert!(value.is::<StaticRoute>());
        assert!(!value.is::<Empty>());
        assert_eq!(
            value.downcast_ref::<StaticRoute>().unwrap().outgoing_interface,
            "eth0"
        );
        assert!(value.type_name().ends_with("StaticRoute"));
        assert!(Value::empty().is::<Empty>());
    }

    #[test]
    fn test_dependency_satisfaction_is_live() {
        let satisfied = SatisfiedKeys::new();
        let by_key = Dependency::key("interface", "linux/interface/state/eth0/UP");
        let any = Dependency::any_of("prefix", |key| key.starts_with("linux/l3/"));

        assert!(!by_key.is_satisfied(&satisfied));
        assert!(!any.is_satisfied(&satisfied));

        satisfied.insert("linux/interface/state/eth0/UP");
        satisfied.insert("linux/l3/link-local-route/eth0/10.0.0.0/24");
        assert!(by_key.is_satisfied(&satisfied));
        assert!(any.is_satisfied(&satisfied));

        assert!(any.references("linux/l3/anything"));
        assert!(!by_key.references("linux/interface/state/eth0/DOWN"));
        assert_eq!(any.label(), "prefix");
    }
}
