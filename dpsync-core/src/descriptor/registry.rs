//! Descriptor registry
//!
//! Descriptors are registered once at startup and read on every pass, so
//! the table sits behind a read-heavy `RwLock` and hands out `Arc` clones.
//! Lookup by key walks descriptors in registration order and returns the
//! first one whose key predicate matches.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};

use super::{Descriptor, DescriptorAdapter, KvDescriptor, Value};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("descriptor {0} is already registered")]
    Duplicate(String),
    #[error("dump dependencies form a cycle among: {}", .0.join(", "))]
    DumpCycle(Vec<String>),
    #[error("no descriptor handles key {0}")]
    NoDescriptor(String),
    #[error("invalid value for key {key}: {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Thread-safe table of the registered descriptors.
#[derive(Default, Clone)]
pub struct DescriptorRegistry {
    descriptors: Arc<RwLock<Vec<Arc<dyn KvDescriptor>>>>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed descriptor.
    pub fn register<D: Descriptor>(&self, descriptor: D) -> Result<(), RegistryError> {
        self.register_kv(Arc::new(DescriptorAdapter::new(descriptor)))
    }

    /// Register an already type-erased descriptor.
    pub fn register_kv(&self, descriptor: Arc<dyn KvDescriptor>) -> Result<(), RegistryError> {
        let mut descriptors = self
            .descriptors
            .write()
            .expect("registry lock poisoned during register");
        if descriptors.iter().any(|d| d.name() == descriptor.name()) {
            return Err(RegistryError::Duplicate(descriptor.name().to_string()));
        }
        info!(
            descriptor = descriptor.name(),
            value_type = descriptor.value_type_name(),
            "Descriptor registered"
        );
        descriptors.push(descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn KvDescriptor>> {
        self.descriptors
            .read()
            .expect("registry lock poisoned during get")
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    /// Descriptor owning `key`, if any.
    pub fn for_key(&self, key: &str) -> Option<Arc<dyn KvDescriptor>> {
        self.descriptors
            .read()
            .expect("registry lock poisoned during for_key")
            .iter()
            .find(|d| d.is_key(key))
            .cloned()
    }

    /// Registered names, in registration order.
    pub fn list_names(&self) -> Vec<String> {
        self.descriptors
            .read()
            .expect("registry lock poisoned during list_names")
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<dyn KvDescriptor>> {
        self.descriptors
            .read()
            .expect("registry lock poisoned during all")
            .clone()
    }

    /// Order in which descriptors have to be dumped.
    ///
    /// Kahn's algorithm over `dump_dependencies`, ties broken by
    /// registration order.  Dependencies on descriptors that are not
    /// registered are ignored.
    pub fn dump_order(&self) -> Result<Vec<Arc<dyn KvDescriptor>>, RegistryError> {
        let descriptors = self.all();
        let position: HashMap<String, usize> = descriptors
            .iter()
            .enumerate()
            .map(|(idx, d)| (d.name().to_string(), idx))
            .collect();

        let mut in_degree = vec![0usize; descriptors.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); descriptors.len()];
        for (idx, descriptor) in descriptors.iter().enumerate() {
            for dep in descriptor.dump_dependencies() {
                match position.get(&dep) {
                    Some(&dep_idx) => {
                        in_degree[idx] += 1;
                        dependents[dep_idx].push(idx);
                    }
                    None => debug!(
                        descriptor = descriptor.name(),
                        dependency = %dep,
                        "Dump dependency not registered, ignored"
                    ),
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..descriptors.len())
            .filter(|&idx| in_degree[idx] == 0)
            .collect();
        let mut order = Vec::with_capacity(descriptors.len());
        while let Some(idx) = ready.pop_front() {
            order.push(idx);
            for &next in &dependents[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() != descriptors.len() {
            let stuck = (0..descriptors.len())
                .filter(|&idx| in_degree[idx] > 0)
                .map(|idx| descriptors[idx].name().to_string())
                .collect();
            return Err(RegistryError::DumpCycle(stuck));
        }
        Ok(order
            .into_iter()
            .map(|idx| descriptors[idx].clone())
            .collect())
    }

    /// Parse a raw JSON value through the descriptor owning `key`.
    pub fn parse_value(&self, key: &str, raw: serde_json::Value) -> Result<Value, RegistryError> {
        let descriptor = self
            .for_key(key)
            .ok_or_else(|| RegistryError::NoDescriptor(key.to_string()))?;
        descriptor
            .parse_value(raw)
            .map_err(|source| RegistryError::InvalidValue {
                key: key.to_string(),
                source,
            })
    }
}
