//! Solver counters.
//!
//! Counters are plain atomics snapshotted on demand; increments also emit a
//! structured tracing event on the `metrics` target so external collectors
//! can scrape without polling.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    pub fn increment(&self) {
        let value = self.value.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(target: "metrics", metric = self.name, value);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters for one solver instance.
pub struct Metrics {
    pub dispatches: Counter,
    pub signals: Counter,
    pub merges: Counter,
    pub merges_skipped: Counter,
    pub cache_hits: Counter,
    pub execs_started: Counter,
    pub execs_completed: Counter,
    pub builds: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            dispatches: Counter::new("solver.dispatches"),
            signals: Counter::new("solver.signals"),
            merges: Counter::new("solver.merges"),
            merges_skipped: Counter::new("solver.merges_skipped"),
            cache_hits: Counter::new("solver.cache_hits"),
            execs_started: Counter::new("solver.execs_started"),
            execs_completed: Counter::new("solver.execs_completed"),
            builds: Counter::new("solver.builds"),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatches: self.dispatches.get(),
            signals: self.signals.get(),
            merges: self.merges.get(),
            merges_skipped: self.merges_skipped.get(),
            cache_hits: self.cache_hits.get(),
            execs_started: self.execs_started.get(),
            execs_completed: self.execs_completed.get(),
            builds: self.builds.get(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the solver counters.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub dispatches: u64,
    pub signals: u64,
    pub merges: u64,
    pub merges_skipped: u64,
    pub cache_hits: u64,
    pub execs_started: u64,
    pub execs_completed: u64,
    pub builds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.dispatches.increment();
        m.dispatches.increment();
        m.merges.increment();
        let snap = m.snapshot();
        assert_eq!(snap.dispatches, 2);
        assert_eq!(snap.merges, 1);
        assert_eq!(snap.execs_started, 0);
    }
}
