//! Reconciliation engine
//!
//! The engine holds the desired state of every key, what it believes is
//! applied in the system, and the set of satisfied keys dependencies are
//! checked against.  A pass plans jobs from the difference and walks them:
//! every job whose dependencies hold is started on a blocking worker, up to
//! `max_parallel_ops` at once, and each completion may unblock more jobs in
//! the same pass.
//!
//! Passes never overlap.  [`Engine::resync`] takes the same pass lock, so a
//! dump never observes a half-applied pass.

pub mod graph;
pub(crate) mod plan;
pub mod retry;
pub mod state;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::descriptor::{
    Discovered, DescriptorRegistry, KeyValue, KvDescriptor, KvWithMetadata, Metadata, Origin,
    RegistryError, Value,
};
use crate::perf::{ScopedTimer, SyncMetrics, TimerType};
use crate::resync::{
    correlate, Correlation, DesiredStateSource, Discovery, DumpFailure, ResyncReport,
};

pub use graph::SatisfiedKeys;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use state::{KeyFailure, KeyState, KeyStatus, ReconcileReport};

use plan::{Job, JobKind};
use state::{Applied, EngineState, KeyRecord};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no descriptor handles key {0}")]
    UnknownKey(String),
    #[error("value for {key} has type {found}, descriptor {descriptor} expects {expected}")]
    ValueType {
        key: String,
        descriptor: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Result of one CRUD call made on a blocking worker.
struct Outcome {
    result: anyhow::Result<Option<Metadata>>,
    /// A recreate got past deleting the old value.
    deleted_old: bool,
}

type OpResult = (String, Result<Outcome, JoinError>);

pub struct Engine {
    registry: DescriptorRegistry,
    config: AgentConfig,
    state: Mutex<EngineState>,
    satisfied: SatisfiedKeys,
    pass_lock: tokio::sync::Mutex<()>,
    trigger: Notify,
    retry_round: AtomicU32,
    metrics: Arc<SyncMetrics>,
}

impl Engine {
    pub fn new(registry: DescriptorRegistry, config: AgentConfig) -> Self {
        info!(
            descriptors = ?registry.list_names(),
            max_parallel_ops = config.engine.max_parallel_ops,
            "Creating reconciliation engine"
        );
        Self {
            registry,
            config,
            state: Mutex::new(EngineState::default()),
            satisfied: SatisfiedKeys::new(),
            pass_lock: tokio::sync::Mutex::new(()),
            trigger: Notify::new(),
            retry_round: AtomicU32::new(0),
            metrics: SyncMetrics::new(),
        }
    }

    pub fn registry(&self) -> &DescriptorRegistry {
        &self.registry
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<SyncMetrics> {
        self.metrics.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine state poisoned")
    }

    /// Finds the owning descriptor and checks the value's type against it.
    fn resolve(&self, key: &str, value: &Value) -> Result<Arc<dyn KvDescriptor>, EngineError> {
        let descriptor = self
            .registry
            .for_key(key)
            .ok_or_else(|| EngineError::UnknownKey(key.to_string()))?;
        if value.type_name() != descriptor.value_type_name() {
            return Err(EngineError::ValueType {
                key: key.to_string(),
                descriptor: descriptor.name().to_string(),
                expected: descriptor.value_type_name(),
                found: value.type_name(),
            });
        }
        Ok(descriptor)
    }

    /// Records `value` as desired for `key`; applied by the next pass.
    pub fn set_desired(&self, key: impl Into<String>, value: Value) -> Result<(), EngineError> {
        let key = key.into();
        let descriptor = self.resolve(&key, &value)?;
        let mut state = self.lock_state();
        set_desired_locked(&mut state, key, descriptor, value);
        Ok(())
    }

    /// Drops the desired value; the next pass deletes what was applied.
    /// Returns `false` for keys the engine does not track.
    pub fn remove_desired(&self, key: &str) -> bool {
        let mut state = self.lock_state();
        match state.records.get_mut(key) {
            Some(record) => {
                debug!(key = %key, "Desired value removed");
                record.desired = None;
                true
            }
            None => false,
        }
    }

    /// Announces a key managed outside the engine, such as interface state
    /// or addresses.  Values depending on it are reconsidered by the next
    /// pass.
    pub fn notify_external(&self, key: impl Into<String>, present: bool) {
        let key = key.into();
        let changed = if present {
            self.satisfied.insert(key.clone())
        } else {
            self.satisfied.remove(&key)
        };
        if changed {
            debug!(key = %key, present, "External key changed");
        }
    }

    pub fn is_satisfied(&self, key: &str) -> bool {
        self.satisfied.contains(key)
    }

    /// Wakes the agent loop for a reconciliation pass.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn status(&self, key: &str) -> Option<KeyStatus> {
        self.lock_state()
            .records
            .get(key)
            .map(|record| record.status(key))
    }

    pub fn statuses(&self) -> Vec<KeyStatus> {
        self.lock_state()
            .records
            .iter()
            .map(|(key, record)| record.status(key))
            .collect()
    }

    /// Runs one reconciliation pass.
    pub async fn reconcile(&self) -> ReconcileReport {
        let _pass = self.pass_lock.lock().await;
        self.run_pass().await
    }

    /// Replaces the whole desired state, re-discovers the system and
    /// reconciles.
    ///
    /// Every key is validated before anything changes; one unknown key
    /// rejects the whole request.
    pub async fn resync(&self, desired: Vec<KeyValue>) -> Result<ResyncReport, EngineError> {
        let _pass = self.pass_lock.lock().await;
        let _timer = ScopedTimer::new(&self.metrics, TimerType::Resync);

        let order = self.registry.dump_order()?;
        let mut resolved = Vec::with_capacity(desired.len());
        for kv in desired {
            let descriptor = self.resolve(&kv.key, &kv.value)?;
            resolved.push((kv.key, descriptor, kv.value));
        }
        info!(keys = resolved.len(), "Starting resync");
        self.replace_desired(resolved);

        let mut report = ResyncReport::default();
        for descriptor in order {
            let name = descriptor.name().to_string();
            if !descriptor.dump_supported() {
                debug!(descriptor = %name, "Dump not supported, keeping own view");
                report.skipped.push(name);
                continue;
            }

            let hints = self.correlation_hints(&name);
            let dumper = descriptor.clone();
            let discovery = tokio::task::spawn_blocking(move || dumper.dump(&hints))
                .await
                .unwrap_or_else(|err| Discovery {
                    items: Vec::new(),
                    error: Some(anyhow::anyhow!("dump task failed: {err}")),
                });
            if let Some(err) = &discovery.error {
                warn!(descriptor = %name, error = %format!("{err:#}"), "Dump incomplete");
                report.dump_failures.push(DumpFailure {
                    descriptor: name.clone(),
                    error: format!("{err:#}"),
                });
            }
            self.metrics.record_discovered(discovery.items.len());
            report.discovered += discovery.items.len();
            self.correlate_discovery(&descriptor, discovery, &mut report);
            report.dumped.push(name);
        }

        report.reconcile = self.run_pass().await;
        info!(
            discovered = report.discovered,
            adopted = report.adopted,
            to_modify = report.to_modify,
            to_remove = report.to_remove,
            vanished = report.vanished,
            failed = report.reconcile.failed.len(),
            pending = report.reconcile.pending.len(),
            "Resync done"
        );
        Ok(report)
    }

    fn replace_desired(&self, desired: Vec<(String, Arc<dyn KvDescriptor>, Value)>) {
        let mut state = self.lock_state();
        let keys: HashSet<&str> = desired.iter().map(|(key, _, _)| key.as_str()).collect();
        for (key, record) in state.records.iter_mut() {
            if !keys.contains(key.as_str()) && record.desired.take().is_some() {
                debug!(key = %key, "No longer desired");
            }
        }
        for (key, descriptor, value) in desired {
            set_desired_locked(&mut state, key, descriptor, value);
        }
    }

    /// Desired values of one descriptor, handed to its dump.
    fn correlation_hints(&self, descriptor: &str) -> Vec<Discovered> {
        self.lock_state()
            .records
            .iter()
            .filter(|(_, record)| record.descriptor.name() == descriptor)
            .filter_map(|(key, record)| {
                let value = record.desired.clone()?;
                Some(KvWithMetadata {
                    key: key.clone(),
                    value,
                    metadata: record.applied.as_ref().and_then(|a| a.metadata.clone()),
                    origin: Origin::Northbound,
                })
            })
            .collect()
    }

    fn correlate_discovery(
        &self,
        descriptor: &Arc<dyn KvDescriptor>,
        discovery: Discovery<Discovered, anyhow::Error>,
        report: &mut ResyncReport,
    ) {
        let complete = discovery.is_complete();
        let policy = self.config.unwanted.policy_for(descriptor.name());
        let mut seen = HashSet::new();
        let mut state = self.lock_state();

        for item in discovery.items {
            if !descriptor.is_key(&item.key) {
                warn!(key = %item.key, descriptor = descriptor.name(), "Dumped foreign key, ignored");
                continue;
            }
            seen.insert(item.key.clone());
            let matches = state
                .records
                .get(&item.key)
                .and_then(|record| record.desired.as_ref())
                .map(|desired| descriptor.equivalent(&item.key, &item.value, desired));
            let key = item.key;
            let applied = Applied {
                derived: plan::derived_keys(descriptor.as_ref(), &key, &item.value),
                value: item.value,
                metadata: item.metadata,
            };

            match correlate(matches, policy) {
                Correlation::Adopt => {
                    let Some(record) = state.records.get_mut(&key) else {
                        continue;
                    };
                    plan::retract(&self.satisfied, &key, record.applied.as_ref());
                    plan::publish(&self.satisfied, &key, &applied);
                    record.applied = Some(applied);
                    record.state = KeyState::Configured;
                    record.origin = Origin::Northbound;
                    record.last_error = None;
                    debug!(key = %key, "Discovered value adopted");
                    report.adopted += 1;
                }
                Correlation::Modify => {
                    let Some(record) = state.records.get_mut(&key) else {
                        continue;
                    };
                    plan::retract(&self.satisfied, &key, record.applied.as_ref());
                    record.applied = Some(applied);
                    record.rediscovered();
                    debug!(key = %key, "Discovered value differs from desired");
                    report.to_modify += 1;
                }
                Correlation::RemoveUnwanted => {
                    let record = state
                        .records
                        .entry(key.clone())
                        .or_insert_with(|| KeyRecord::new(descriptor.clone(), Origin::Unknown));
                    plan::retract(&self.satisfied, &key, record.applied.as_ref());
                    record.applied = Some(applied);
                    record.state = KeyState::Unknown;
                    debug!(key = %key, "Discovered value not desired, scheduled for removal");
                    report.to_remove += 1;
                }
                Correlation::IgnoreUnwanted => {
                    debug!(key = %key, "Discovered value not desired, ignored");
                    report.ignored += 1;
                }
            }
        }

        if !complete {
            return;
        }
        for (key, record) in state.records.iter_mut() {
            if record.descriptor.name() != descriptor.name() || seen.contains(key) {
                continue;
            }
            if let Some(applied) = record.applied.take() {
                debug!(key = %key, "Applied value no longer exists");
                plan::retract(&self.satisfied, key, Some(&applied));
                record.rediscovered();
                report.vanished += 1;
            }
        }
    }

    async fn run_pass(&self) -> ReconcileReport {
        let _timer = ScopedTimer::new(&self.metrics, TimerType::Pass);
        let mut jobs = {
            let mut state = self.lock_state();
            plan::plan(&mut state, &self.satisfied)
        };
        let mut report = ReconcileReport::default();
        if jobs.is_empty() {
            return report;
        }
        debug!(jobs = jobs.len(), "Reconciliation pass planned");

        let limit = self.config.engine.max_parallel_ops.max(1);
        let mut tasks: JoinSet<OpResult> = JoinSet::new();
        let mut in_flight: HashMap<String, Job> = HashMap::new();
        let mut changes_unapplied = false;

        loop {
            let mut idx = 0;
            while idx < jobs.len() && in_flight.len() < limit {
                let job = &jobs[idx];
                let ready = !in_flight.contains_key(&job.key)
                    && job.is_ready(&self.satisfied, jobs.iter().chain(in_flight.values()));
                if ready {
                    let job = jobs.remove(idx);
                    self.start(&mut tasks, &mut in_flight, job);
                } else {
                    idx += 1;
                }
            }

            if in_flight.is_empty() {
                if jobs.is_empty() {
                    break;
                }
                if let Some(pos) = jobs.iter().position(|job| job.kind.is_removal()) {
                    let job = jobs.remove(pos);
                    warn!(key = %job.key, "Removals depend on each other, forcing removal");
                    self.start(&mut tasks, &mut in_flight, job);
                    continue;
                }
                if !changes_unapplied {
                    changes_unapplied = true;
                    if self.unapply_blocked_changes(&mut jobs) {
                        continue;
                    }
                }
                let mut state = self.lock_state();
                for job in jobs.drain(..) {
                    debug!(key = %job.key, "Waiting for dependencies");
                    if let Some(record) = state.records.get_mut(&job.key) {
                        record.state = KeyState::PendingDependencies;
                    }
                    report.pending.push(job.key);
                }
                break;
            }

            match tasks.join_next().await {
                Some(Ok((key, result))) => {
                    if let Some(job) = in_flight.remove(&key) {
                        self.finish(job, result, &mut jobs, &mut report);
                    }
                }
                Some(Err(err)) => {
                    error!(error = %err, "Operation task lost, abandoning running operations");
                    tasks.shutdown().await;
                    let lost: Vec<Job> = in_flight.drain().map(|(_, job)| job).collect();
                    for job in lost {
                        let outcome = Outcome {
                            result: Err(anyhow::anyhow!("operation abandoned: {err}")),
                            deleted_old: false,
                        };
                        self.finish(job, Ok(outcome), &mut jobs, &mut report);
                    }
                }
                None => in_flight.clear(),
            }
        }

        info!(
            applied = report.applied.len(),
            removed = report.removed.len(),
            unapplied = report.unapplied.len(),
            failed = report.failed.len(),
            pending = report.pending.len(),
            "Reconciliation pass done"
        );
        report
    }

    /// Turns changes stuck on their new dependencies into removals of the
    /// old value.  Returns `true` if any job changed.
    fn unapply_blocked_changes(&self, jobs: &mut Vec<Job>) -> bool {
        let mut changed = false;
        for job in jobs.iter_mut() {
            if !matches!(job.kind, JobKind::Modify | JobKind::Recreate) {
                continue;
            }
            let Some(old) = job.old.clone() else {
                continue;
            };
            debug!(key = %job.key, "New value blocked, removing the old one");
            plan::retract(&self.satisfied, &job.key, Some(&old));
            *job = Job::removal(JobKind::Unapply, &job.key, &job.descriptor, old);
            changed = true;
        }
        if changed {
            let state = self.lock_state();
            plan::cascade(&state, &self.satisfied, jobs);
        }
        changed
    }

    fn start(&self, tasks: &mut JoinSet<OpResult>, in_flight: &mut HashMap<String, Job>, job: Job) {
        {
            let mut state = self.lock_state();
            if let Some(record) = state.records.get_mut(&job.key) {
                record.state = KeyState::Applying;
                record.attempts += 1;
                if !job.kind.is_removal() {
                    record.last_attempted = job.new.clone();
                }
            }
        }
        debug!(key = %job.key, kind = ?job.kind, "Starting operation");

        let op = job.clone();
        tasks.spawn(async move {
            let key = op.key.clone();
            let result = tokio::task::spawn_blocking(move || execute(&op)).await;
            (key, result)
        });
        in_flight.insert(job.key.clone(), job);
    }

    fn finish(
        &self,
        job: Job,
        result: Result<Outcome, JoinError>,
        jobs: &mut Vec<Job>,
        report: &mut ReconcileReport,
    ) {
        let (result, deleted_old, panicked) = match result {
            Ok(outcome) => (outcome.result, outcome.deleted_old, false),
            Err(err) => (
                Err(anyhow::anyhow!("operation task failed: {err}")),
                false,
                true,
            ),
        };

        let mut state = self.lock_state();
        let Some(record) = state.records.get_mut(&job.key) else {
            return;
        };

        let err = match result {
            Ok(metadata) => {
                self.succeed(&job, record, metadata, jobs, report);
                return;
            }
            Err(err) => err,
        };

        let retriable = panicked || job.descriptor.is_retriable_failure(&err);
        let message = format!("{err:#}");
        error!(key = %job.key, kind = ?job.kind, retriable, error = %message, "Operation failed");
        plan::retract(&self.satisfied, &job.key, record.applied.as_ref());
        if job.kind == JobKind::Recreate && deleted_old {
            record.applied = None;
        }
        record.state = KeyState::Failed { retriable };
        record.last_error = Some(message.clone());
        self.metrics.record_failure();
        report.failed.push(KeyFailure {
            key: job.key,
            error: message,
            retriable,
        });

        let mut broken: Vec<Job> = Vec::new();
        plan::cascade(&state, &self.satisfied, &mut broken);
        broken.retain(|new| !jobs.iter().any(|job| job.key == new.key));
        jobs.extend(broken);
    }

    fn succeed(
        &self,
        job: &Job,
        record: &mut KeyRecord,
        metadata: Option<Metadata>,
        jobs: &mut Vec<Job>,
        report: &mut ReconcileReport,
    ) {
        record.last_error = None;
        match job.kind {
            JobKind::Add | JobKind::Modify | JobKind::Recreate => {
                let Some(value) = job.new.clone() else {
                    return;
                };
                let applied = Applied {
                    derived: plan::derived_keys(job.descriptor.as_ref(), &job.key, &value),
                    value,
                    metadata,
                };
                plan::publish(&self.satisfied, &job.key, &applied);
                record.applied = Some(applied);
                record.state = KeyState::Configured;
                if job.kind == JobKind::Add {
                    self.metrics.record_add();
                } else {
                    self.metrics.record_modify();
                }
                debug!(key = %job.key, kind = ?job.kind, "Configured");
                report.applied.push(job.key.clone());
            }
            JobKind::Delete => {
                record.applied = None;
                record.state = KeyState::Removed;
                self.metrics.record_delete();
                debug!(key = %job.key, "Removed");
                report.removed.push(job.key.clone());
            }
            JobKind::Unapply => {
                record.applied = None;
                self.metrics.record_delete();
                report.unapplied.push(job.key.clone());
                match record.desired.clone() {
                    Some(desired) => {
                        debug!(key = %job.key, "Unapplied, waiting to be added back");
                        record.state = KeyState::PendingDependencies;
                        jobs.push(Job::add(&job.key, &record.descriptor, desired));
                    }
                    None => record.state = KeyState::Removed,
                }
            }
        }
    }

    fn schedule_retry(&self, report: &ReconcileReport) -> Option<Instant> {
        if !report.has_retriable_failures() {
            self.retry_round.store(0, Ordering::Relaxed);
            return None;
        }
        let policy = &self.config.engine.retry;
        let round = self.retry_round.fetch_add(1, Ordering::Relaxed);
        if !policy.should_retry(round) {
            warn!(rounds = round, "Retries exhausted, waiting for the next resync");
            return None;
        }
        let delay = policy.delay(round);
        debug!(round, delay_ms = delay.as_millis() as u64, "Retry scheduled");
        Some(Instant::now() + delay)
    }

    /// Agent loop: periodic resync from `source`, a pass on every
    /// [`Engine::trigger`], and retries of retriable failures.  Returns once
    /// `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        source: Arc<dyn DesiredStateSource>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut resync_timer = tokio::time::interval(self.config.resync.interval());
        resync_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !self.config.resync.on_startup {
            resync_timer.tick().await;
        }
        let mut retry_at: Option<Instant> = None;
        info!(
            resync_interval_secs = self.config.resync.interval_secs,
            "Engine loop started"
        );

        loop {
            let deadline = retry_at;
            let retry = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            let report = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Engine loop stopped");
                    return Ok(());
                }
                _ = resync_timer.tick() => {
                    self.retry_round.store(0, Ordering::Relaxed);
                    let desired = match source.load(&self.registry).await {
                        Ok(desired) => desired,
                        Err(err) => {
                            error!(error = %format!("{err:#}"), "Failed to load desired state");
                            continue;
                        }
                    };
                    match self.resync(desired).await {
                        Ok(report) => report.reconcile,
                        Err(err) => {
                            error!(error = %err, "Resync rejected");
                            continue;
                        }
                    }
                }
                _ = self.trigger.notified() => self.reconcile().await,
                _ = retry => {
                    debug!("Retrying failed operations");
                    self.reconcile().await
                }
            };
            retry_at = self.schedule_retry(&report);
        }
    }
}

fn set_desired_locked(
    state: &mut EngineState,
    key: String,
    descriptor: Arc<dyn KvDescriptor>,
    value: Value,
) {
    let record = state
        .records
        .entry(key.clone())
        .or_insert_with(|| KeyRecord::new(descriptor, Origin::Northbound));
    let unchanged = record
        .desired
        .as_ref()
        .is_some_and(|old| record.descriptor.equivalent(&key, old, &value));
    if !unchanged {
        debug!(key = %key, "Desired value set");
        record.attempts = 0;
    }
    record.desired = Some(value);
    record.origin = Origin::Northbound;
}

/// Runs the CRUD call of one job; blocks.
fn execute(job: &Job) -> Outcome {
    let descriptor = job.descriptor.as_ref();
    let key = job.key.as_str();
    let done = |result| Outcome {
        result,
        deleted_old: false,
    };
    match (job.kind, &job.old, &job.new) {
        (JobKind::Add, _, Some(new)) => done(descriptor.add(key, new).map(Some)),
        (JobKind::Modify, Some(old), Some(new)) => done(
            descriptor
                .modify(key, &old.value, new, old.metadata.as_ref())
                .map(Some),
        ),
        (JobKind::Recreate, Some(old), Some(new)) => {
            if let Err(err) = descriptor.delete(key, &old.value, old.metadata.as_ref()) {
                return done(Err(err));
            }
            Outcome {
                result: descriptor.add(key, new).map(Some),
                deleted_old: true,
            }
        }
        (JobKind::Delete | JobKind::Unapply, Some(old), _) => done(
            descriptor
                .delete(key, &old.value, old.metadata.as_ref())
                .map(|()| None),
        ),
        (kind, _, _) => done(Err(anyhow::anyhow!("malformed {kind:?} job for {key}"))),
    }
}
