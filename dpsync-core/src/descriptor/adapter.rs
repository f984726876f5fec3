//! Type erasure between typed descriptors and the engine.

use std::any::Any;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use super::{Dependency, Descriptor, KeyValue, KvWithMetadata, Metadata, Value};
use crate::resync::pool::Discovery;

/// Dumped or correlated item in type-erased form.
pub type Discovered = KvWithMetadata<Value, Metadata>;

/// A value or metadata reached a descriptor that does not own its type.
///
/// Such errors come from wiring mistakes, so they are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("descriptor {descriptor} expects values of type {expected}, got {found}")]
    ValueType {
        descriptor: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("descriptor {descriptor} received metadata of a foreign type")]
    MetadataType { descriptor: String },
}

/// Descriptor interface as seen by the engine and the registry.
pub trait KvDescriptor: Send + Sync {
    fn name(&self) -> &str;
    fn value_type_name(&self) -> &'static str;
    fn is_key(&self, key: &str) -> bool;
    fn equivalent(&self, key: &str, old: &Value, new: &Value) -> bool;
    fn add(&self, key: &str, value: &Value) -> anyhow::Result<Metadata>;
    fn delete(&self, key: &str, value: &Value, metadata: Option<&Metadata>) -> anyhow::Result<()>;
    fn modify(
        &self,
        key: &str,
        old: &Value,
        new: &Value,
        old_metadata: Option<&Metadata>,
    ) -> anyhow::Result<Metadata>;
    fn modify_with_recreate(
        &self,
        key: &str,
        old: &Value,
        new: &Value,
        metadata: Option<&Metadata>,
    ) -> bool;
    fn dependencies(&self, key: &str, value: &Value) -> Vec<Dependency>;
    fn derived_values(&self, key: &str, value: &Value) -> Vec<KeyValue>;
    fn is_retriable_failure(&self, err: &anyhow::Error) -> bool;
    fn dump_supported(&self) -> bool;
    fn dump(&self, correlate: &[Discovered]) -> Discovery<Discovered, anyhow::Error>;
    fn dump_dependencies(&self) -> Vec<String>;
    fn parse_value(&self, raw: serde_json::Value) -> anyhow::Result<Value>;
}

/// Wraps a typed [`Descriptor`] into a [`KvDescriptor`].
#[derive(Debug)]
pub struct DescriptorAdapter<D> {
    inner: D,
}

impl<D: Descriptor> DescriptorAdapter<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn value<'a>(&self, value: &'a Value) -> Result<&'a D::Value, AdapterError> {
        value
            .downcast_ref::<D::Value>()
            .ok_or_else(|| AdapterError::ValueType {
                descriptor: self.inner.name().to_string(),
                expected: self.inner.value_type_name(),
                found: value.type_name(),
            })
    }

    fn metadata<'a>(
        &self,
        metadata: Option<&'a Metadata>,
    ) -> Result<Option<&'a D::Metadata>, AdapterError> {
        match metadata {
            None => Ok(None),
            Some(meta) => {
                let any: &(dyn Any + Send + Sync) = &**meta;
                any.downcast_ref::<D::Metadata>()
                    .map(Some)
                    .ok_or_else(|| AdapterError::MetadataType {
                        descriptor: self.inner.name().to_string(),
                    })
            }
        }
    }
}

fn erase_metadata<M: Send + Sync + 'static>(metadata: M) -> Metadata {
    Arc::new(metadata)
}

impl<D: Descriptor> KvDescriptor for DescriptorAdapter<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn value_type_name(&self) -> &'static str {
        self.inner.value_type_name()
    }

    fn is_key(&self, key: &str) -> bool {
        self.inner.is_key(key)
    }

    fn equivalent(&self, key: &str, old: &Value, new: &Value) -> bool {
        match (self.value(old), self.value(new)) {
            (Ok(old), Ok(new)) => self.inner.equivalent(key, old, new),
            _ => false,
        }
    }

    fn add(&self, key: &str, value: &Value) -> anyhow::Result<Metadata> {
        let value = self.value(value)?;
        let metadata = self.inner.add(key, value)?;
        Ok(erase_metadata(metadata))
    }

    fn delete(&self, key: &str, value: &Value, metadata: Option<&Metadata>) -> anyhow::Result<()> {
        let value = self.value(value)?;
        let metadata = self.metadata(metadata)?;
        self.inner.delete(key, value, metadata)?;
        Ok(())
    }

    fn modify(
        &self,
        key: &str,
        old: &Value,
        new: &Value,
        old_metadata: Option<&Metadata>,
    ) -> anyhow::Result<Metadata> {
        let old = self.value(old)?;
        let new = self.value(new)?;
        let old_metadata = self.metadata(old_metadata)?;
        let metadata = self.inner.modify(key, old, new, old_metadata)?;
        Ok(erase_metadata(metadata))
    }

    fn modify_with_recreate(
        &self,
        key: &str,
        old: &Value,
        new: &Value,
        metadata: Option<&Metadata>,
    ) -> bool {
        match (self.value(old), self.value(new)) {
            (Ok(old), Ok(new)) => {
                let metadata = self.metadata(metadata).ok().flatten();
                self.inner.modify_with_recreate(key, old, new, metadata)
            }
            _ => true,
        }
    }

    fn dependencies(&self, key: &str, value: &Value) -> Vec<Dependency> {
        self.value(value)
            .map(|value| self.inner.dependencies(key, value))
            .unwrap_or_default()
    }

    fn derived_values(&self, key: &str, value: &Value) -> Vec<KeyValue> {
        self.value(value)
            .map(|value| self.inner.derived_values(key, value))
            .unwrap_or_default()
    }

    fn is_retriable_failure(&self, err: &anyhow::Error) -> bool {
        if let Some(err) = err.downcast_ref::<D::Error>() {
            return self.inner.is_retriable_failure(err);
        }
        !err.is::<AdapterError>()
    }

    fn dump_supported(&self) -> bool {
        self.inner.dump_supported()
    }

    fn dump(&self, correlate: &[Discovered]) -> Discovery<Discovered, anyhow::Error> {
        let typed: Vec<_> = correlate
            .iter()
            .filter_map(|kv| {
                let value = self.value(&kv.value).ok()?.clone();
                let metadata = self.metadata(kv.metadata.as_ref()).ok().flatten().cloned();
                Some(KvWithMetadata {
                    key: kv.key.clone(),
                    value,
                    metadata,
                    origin: kv.origin,
                })
            })
            .collect();
        if typed.len() != correlate.len() {
            warn!(
                descriptor = self.inner.name(),
                skipped = correlate.len() - typed.len(),
                "Correlation hints of a foreign type dropped"
            );
        }

        let discovery = self.inner.dump(&typed);
        Discovery {
            items: discovery
                .items
                .into_iter()
                .map(|kv| KvWithMetadata {
                    key: kv.key,
                    value: Value::new(kv.value),
                    metadata: kv.metadata.map(erase_metadata),
                    origin: kv.origin,
                })
                .collect(),
            error: discovery.error.map(anyhow::Error::from),
        }
    }

    fn dump_dependencies(&self) -> Vec<String> {
        self.inner.dump_dependencies()
    }

    fn parse_value(&self, raw: serde_json::Value) -> anyhow::Result<Value> {
        let value = self.inner.parse_value(raw)?;
        Ok(Value::new(value))
    }
}
