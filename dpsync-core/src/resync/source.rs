//! Where the desired state for a resync comes from.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::descriptor::{DescriptorRegistry, KeyValue, Value};
use crate::model::{PuntToHost, StaticRoute};

/// Provides the complete desired state at resync time.
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    async fn load(&self, registry: &DescriptorRegistry) -> Result<Vec<KeyValue>>;
}

/// Desired state kept in a JSON document of `{"key": value}` pairs.
///
/// Each value is parsed by the descriptor owning its key.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DesiredStateSource for FileSource {
    async fn load(&self, registry: &DescriptorRegistry) -> Result<Vec<KeyValue>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read desired state {}", self.path.display()))?;
        let document: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse desired state {}", self.path.display()))?;

        let mut pairs = Vec::with_capacity(document.len());
        for (key, raw) in document {
            let value = registry.parse_value(&key, raw)?;
            pairs.push(KeyValue::new(key, value));
        }
        debug!(path = %self.path.display(), keys = pairs.len(), "Desired state loaded");
        Ok(pairs)
    }
}

/// Builder for a complete desired state; keys are derived from the values.
#[derive(Debug, Clone, Default)]
pub struct ResyncRequest {
    values: BTreeMap<String, Value>,
}

impl ResyncRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn linux_route(self, route: StaticRoute) -> Self {
        let key = route.key();
        self.put(key, Value::new(route))
    }

    pub fn punt_to_host(self, punt: PuntToHost) -> Self {
        let key = punt.key();
        self.put(key, Value::new(punt))
    }

    /// Any key/value; a later value for the same key replaces the earlier one.
    pub fn put(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_pairs(self) -> Vec<KeyValue> {
        self.values
            .into_iter()
            .map(|(key, value)| KeyValue::new(key, value))
            .collect()
    }
}

#[async_trait]
impl DesiredStateSource for ResyncRequest {
    async fn load(&self, _registry: &DescriptorRegistry) -> Result<Vec<KeyValue>> {
        Ok(self.clone().into_pairs())
    }
}
