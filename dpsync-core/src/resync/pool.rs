//! Bounded dump worker pool
//!
//! Discovery work is split into units (one per interface for routes).  The
//! pool starts no more than the configured number of workers and only as
//! many as the unit count justifies.  Worker `i` of `n` takes units
//! `i, i+n, i+2n, ...`, so no shared queue is needed and every unit is
//! visited exactly once.
//!
//! Workers are scoped OS threads: each one may switch the network namespace
//! of its own thread, and all of them are joined before [`DumpPool::run`]
//! returns.  A fatal error stops the failing worker only; its siblings keep
//! going and everything collected so far is returned with the first error.

use std::thread;
use tracing::{debug, warn};

use crate::config::DumpConfig;

/// Items found by a dump, plus the first fatal error if there was one.
#[derive(Debug)]
pub struct Discovery<T, E> {
    pub items: Vec<T>,
    pub error: Option<E>,
}

impl<T, E> Discovery<T, E> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            error: None,
        }
    }

    pub fn complete(items: Vec<T>) -> Self {
        Self { items, error: None }
    }

    /// `false` when a worker gave up, so the items may be partial.
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

impl<T, E> Default for Discovery<T, E> {
    fn default() -> Self {
        Self::empty()
    }
}

/// `min(max_workers, max(1, units / min_work))`, never below one.
pub fn worker_count(units: usize, max_workers: usize, min_work: usize) -> usize {
    let wanted = (units / min_work.max(1)).max(1);
    wanted.min(max_workers.max(1))
}

/// Units owned by worker `worker` out of `workers`.
pub fn stride<T>(units: &[T], worker: usize, workers: usize) -> impl Iterator<Item = &T> {
    units.iter().skip(worker).step_by(workers.max(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpPool {
    max_workers: usize,
    min_work_per_worker: usize,
}

impl DumpPool {
    pub fn new(max_workers: usize, min_work_per_worker: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            min_work_per_worker: min_work_per_worker.max(1),
        }
    }

    pub fn from_config(config: &DumpConfig) -> Self {
        Self::new(config.max_workers, config.min_units_per_worker)
    }

    pub fn workers_for(&self, units: usize) -> usize {
        worker_count(units, self.max_workers, self.min_work_per_worker)
    }

    /// Runs `discover` over every unit.
    ///
    /// `discover` returns the items of one unit, or a fatal error that ends
    /// the calling worker.  Soft failures, such as a vanished namespace,
    /// should be reported as an empty item list.
    pub fn run<U, T, E, F>(&self, units: &[U], discover: F) -> Discovery<T, E>
    where
        U: Sync,
        T: Send,
        E: Send,
        F: Fn(&U) -> Result<Vec<T>, E> + Sync,
    {
        let workers = self.workers_for(units.len());
        debug!(units = units.len(), workers, "Starting dump workers");

        if workers == 1 {
            return run_worker(units, 0, 1, &discover);
        }

        let partials: Vec<Discovery<T, E>> = thread::scope(|scope| {
            let discover = &discover;
            let handles: Vec<_> = (0..workers)
                .map(|idx| scope.spawn(move || run_worker(units, idx, workers, discover)))
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(partial) => partial,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });

        let mut merged = Discovery::empty();
        for partial in partials {
            merged.items.extend(partial.items);
            if merged.error.is_none() {
                merged.error = partial.error;
            }
        }
        merged
    }
}

impl Default for DumpPool {
    fn default() -> Self {
        Self::from_config(&DumpConfig::default())
    }
}

fn run_worker<U, T, E, F>(units: &[U], idx: usize, workers: usize, discover: &F) -> Discovery<T, E>
where
    F: Fn(&U) -> Result<Vec<T>, E>,
{
    let mut partial = Discovery::empty();
    for unit in stride(units, idx, workers) {
        match discover(unit) {
            Ok(items) => partial.items.extend(items),
            Err(err) => {
                warn!(worker = idx, "Dump worker stopped on a fatal error");
                partial.error = Some(err);
                break;
            }
        }
    }
    partial
}
