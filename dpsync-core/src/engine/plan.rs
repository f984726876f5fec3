//! Turning the difference between desired and applied state into jobs.
//!
//! Planning runs under the state lock and never touches a resource.  It
//! also withdraws from the satisfied set every key that is about to go away
//! (deleted, recreated, or taken down because its own dependencies broke),
//! so nothing new starts on top of an object that is on its way out.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::graph::SatisfiedKeys;
use super::state::{Applied, EngineState, KeyRecord, KeyState};
use crate::descriptor::{Dependency, KvDescriptor, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobKind {
    Add,
    /// In-place change through the descriptor.
    Modify,
    /// Delete the old value, then add the new one.
    Recreate,
    /// Remove an object that is no longer desired.
    Delete,
    /// Remove an object whose dependencies broke; it is added back once
    /// they are satisfied again.
    Unapply,
}

impl JobKind {
    pub fn is_removal(self) -> bool {
        matches!(self, Self::Delete | Self::Unapply)
    }
}

#[derive(Clone)]
pub(crate) struct Job {
    pub key: String,
    pub kind: JobKind,
    pub descriptor: Arc<dyn KvDescriptor>,
    /// What exists now; absent for Add.
    pub old: Option<Applied>,
    /// What should exist afterwards; absent for removals.
    pub new: Option<Value>,
    /// Dependencies of `new`.
    pub dependencies: Vec<Dependency>,
    /// Dependencies of `old`; dependents are removed before what they need.
    pub old_dependencies: Vec<Dependency>,
}

impl Job {
    pub fn add(key: &str, descriptor: &Arc<dyn KvDescriptor>, value: Value) -> Self {
        Self {
            key: key.to_string(),
            kind: JobKind::Add,
            descriptor: descriptor.clone(),
            old: None,
            dependencies: descriptor.dependencies(key, &value),
            new: Some(value),
            old_dependencies: Vec::new(),
        }
    }

    fn change(key: &str, record: &KeyRecord, old: Applied, new: Value, recreate: bool) -> Self {
        Self {
            key: key.to_string(),
            kind: if recreate {
                JobKind::Recreate
            } else {
                JobKind::Modify
            },
            descriptor: record.descriptor.clone(),
            dependencies: record.descriptor.dependencies(key, &new),
            old_dependencies: record.descriptor.dependencies(key, &old.value),
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn removal(kind: JobKind, key: &str, descriptor: &Arc<dyn KvDescriptor>, old: Applied) -> Self {
        Self {
            key: key.to_string(),
            kind,
            descriptor: descriptor.clone(),
            old_dependencies: descriptor.dependencies(key, &old.value),
            old: Some(old),
            new: None,
            dependencies: Vec::new(),
        }
    }

    /// Whether the job may start now.
    ///
    /// Adds and changes wait for their dependencies.  Removals wait while
    /// another pending removal still depends on this key or on one of its
    /// derived keys.
    pub fn is_ready<'a>(
        &self,
        satisfied: &SatisfiedKeys,
        others: impl IntoIterator<Item = &'a Job>,
    ) -> bool {
        if !self.kind.is_removal() {
            return self.dependencies.iter().all(|dep| dep.is_satisfied(satisfied));
        }
        let derived: &[String] = self
            .old
            .as_ref()
            .map_or(&[][..], |old| old.derived.as_slice());
        !others.into_iter().any(|other| {
            other.key != self.key
                && other.kind.is_removal()
                && other.old_dependencies.iter().any(|dep| {
                    dep.references(&self.key) || derived.iter().any(|d| dep.references(d))
                })
        })
    }
}

/// Makes a configured value visible to dependency checks.
pub(crate) fn publish(satisfied: &SatisfiedKeys, key: &str, applied: &Applied) {
    satisfied.insert(key);
    for derived in &applied.derived {
        satisfied.insert(derived.as_str());
    }
}

/// Withdraws a value and everything derived from it.
pub(crate) fn retract(satisfied: &SatisfiedKeys, key: &str, applied: Option<&Applied>) {
    satisfied.remove(key);
    for derived in applied.map(|a| a.derived.as_slice()).unwrap_or_default() {
        satisfied.remove(derived);
    }
}

/// Keys derived from `value`.
pub(crate) fn derived_keys(descriptor: &dyn KvDescriptor, key: &str, value: &Value) -> Vec<String> {
    descriptor
        .derived_values(key, value)
        .into_iter()
        .map(|kv| kv.key)
        .collect()
}

/// Plans one pass over every tracked key.
pub(crate) fn plan(state: &mut EngineState, satisfied: &SatisfiedKeys) -> Vec<Job> {
    state
        .records
        .retain(|_, record| record.desired.is_some() || record.applied.is_some());

    let mut jobs = Vec::new();
    for (key, record) in state.records.iter_mut() {
        let desired = record.desired.clone();
        let applied = record.applied.clone();
        match (desired, applied) {
            (None, None) => {}
            (None, Some(applied)) => {
                retract(satisfied, key, Some(&applied));
                jobs.push(Job::removal(JobKind::Delete, key, &record.descriptor, applied));
            }
            (Some(desired), None) => {
                if record.is_terminally_failed(key) {
                    continue;
                }
                jobs.push(Job::add(key, &record.descriptor, desired));
            }
            (Some(desired), Some(applied)) => {
                if record.descriptor.equivalent(key, &applied.value, &desired) {
                    if record.state == KeyState::Configured {
                        continue;
                    }
                    let deps = record.descriptor.dependencies(key, &applied.value);
                    if deps.iter().all(|dep| dep.is_satisfied(satisfied)) {
                        debug!(key = %key, "Applied value matches desired, marked configured");
                        record.state = KeyState::Configured;
                        record.last_error = None;
                        publish(satisfied, key, &applied);
                    } else {
                        retract(satisfied, key, Some(&applied));
                        jobs.push(Job::removal(JobKind::Unapply, key, &record.descriptor, applied));
                    }
                    continue;
                }

                if record.is_terminally_failed(key) {
                    continue;
                }
                let recreate = record.descriptor.modify_with_recreate(
                    key,
                    &applied.value,
                    &desired,
                    applied.metadata.as_ref(),
                );
                if recreate {
                    retract(satisfied, key, Some(&applied));
                } else {
                    let fresh = derived_keys(record.descriptor.as_ref(), key, &desired);
                    for stale in applied.derived.iter().filter(|d| !fresh.contains(*d)) {
                        satisfied.remove(stale);
                    }
                }
                jobs.push(Job::change(key, record, applied, desired, recreate));
            }
        }
    }

    cascade(state, satisfied, &mut jobs);
    jobs
}

/// Schedules Unapply for configured keys whose dependencies no longer hold,
/// until nothing else breaks.
pub(crate) fn cascade(state: &EngineState, satisfied: &SatisfiedKeys, jobs: &mut Vec<Job>) {
    let mut scheduled: HashSet<String> = jobs.iter().map(|job| job.key.clone()).collect();
    loop {
        let mut broken = Vec::new();
        for (key, record) in &state.records {
            if record.state != KeyState::Configured || scheduled.contains(key) {
                continue;
            }
            let Some(applied) = &record.applied else {
                continue;
            };
            let deps = record.descriptor.dependencies(key, &applied.value);
            if !deps.iter().all(|dep| dep.is_satisfied(satisfied)) {
                broken.push((key.clone(), record.descriptor.clone(), applied.clone()));
            }
        }
        if broken.is_empty() {
            return;
        }
        for (key, descriptor, applied) in broken {
            debug!(key = %key, "Dependency lost, scheduling unapply");
            retract(satisfied, &key, Some(&applied));
            scheduled.insert(key.clone());
            jobs.push(Job::removal(JobKind::Unapply, &key, &descriptor, applied));
        }
    }
}
