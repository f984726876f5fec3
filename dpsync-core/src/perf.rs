//! Synchronization counters
//!
//! Lock-free counters updated by the engine on every operation, pass and
//! resync.  Exporting them is left to whoever embeds the engine; the
//! binary only prints a summary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub adds: AtomicU64,
    pub modifies: AtomicU64,
    pub deletes: AtomicU64,
    pub failures: AtomicU64,
    pub passes: AtomicU64,
    pub pass_time_ns: AtomicU64,
    pub resyncs: AtomicU64,
    pub resync_time_ns: AtomicU64,
    pub discovered: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_add(&self) {
        self.adds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_modify(&self) {
        self.modifies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pass(&self, duration: Duration) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.pass_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_resync(&self, duration: Duration) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
        self.resync_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_discovered(&self, items: usize) {
        self.discovered.fetch_add(items as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            adds: self.adds.load(Ordering::Relaxed),
            modifies: self.modifies.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            avg_pass_ms: avg_duration_ms(&self.passes, &self.pass_time_ns),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            avg_resync_ms: avg_duration_ms(&self.resyncs, &self.resync_time_ns),
            discovered: self.discovered.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.adds,
            &self.modifies,
            &self.deletes,
            &self.failures,
            &self.passes,
            &self.pass_time_ns,
            &self.resyncs,
            &self.resync_time_ns,
            &self.discovered,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn avg_duration_ms(count: &AtomicU64, total_ns: &AtomicU64) -> f64 {
    let c = count.load(Ordering::Relaxed);
    if c == 0 {
        return 0.0;
    }
    let total = total_ns.load(Ordering::Relaxed);
    (total as f64) / (c as f64) / 1_000_000.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSnapshot {
    pub adds: u64,
    pub modifies: u64,
    pub deletes: u64,
    pub failures: u64,
    pub passes: u64,
    pub avg_pass_ms: f64,
    pub resyncs: u64,
    pub avg_resync_ms: f64,
    pub discovered: u64,
}

impl SyncSnapshot {
    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        format!(
            "passes={} (avg {:.3} ms) resyncs={} (avg {:.3} ms) discovered={} \
             adds={} modifies={} deletes={} failures={}",
            self.passes,
            self.avg_pass_ms,
            self.resyncs,
            self.avg_resync_ms,
            self.discovered,
            self.adds,
            self.modifies,
            self.deletes,
            self.failures
        )
    }
}

/// Records the elapsed time into `metrics` when dropped.
pub struct ScopedTimer<'a> {
    start: Instant,
    metrics: &'a SyncMetrics,
    kind: TimerType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    Pass,
    Resync,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(metrics: &'a SyncMetrics, kind: TimerType) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            kind,
        }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        match self.kind {
            TimerType::Pass => self.metrics.record_pass(duration),
            TimerType::Resync => self.metrics.record_resync(duration),
        }
    }
}
