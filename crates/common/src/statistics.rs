//! Counters shared between analysis, the export cache and the build phase.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Atomic counters the progress reporter samples.
///
/// One instance is shared by the whole invocation; the computed-root
/// evaluator creates isolated instances per root build.
#[derive(Debug, Default)]
pub struct Statistics {
    actions_queued: AtomicUsize,
    actions_cached: AtomicUsize,
    actions_executed: AtomicUsize,
    exports_cached: AtomicUsize,
    exports_uncached: AtomicUsize,
    exports_not_eligible: AtomicUsize,
    exports_served: AtomicUsize,
    trees_analysed: AtomicUsize,
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        #[must_use]
        pub fn $get(&self) -> usize {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Statistics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.actions_queued.store(0, Ordering::Relaxed);
        self.actions_cached.store(0, Ordering::Relaxed);
        self.actions_executed.store(0, Ordering::Relaxed);
        self.exports_cached.store(0, Ordering::Relaxed);
        self.exports_uncached.store(0, Ordering::Relaxed);
        self.exports_not_eligible.store(0, Ordering::Relaxed);
        self.exports_served.store(0, Ordering::Relaxed);
        self.trees_analysed.store(0, Ordering::Relaxed);
    }

    counter!(increment_actions_queued, actions_queued_count, actions_queued);
    counter!(increment_actions_cached, actions_cached_count, actions_cached);
    counter!(
        increment_actions_executed,
        actions_executed_count,
        actions_executed
    );
    counter!(increment_exports_cached, exports_cached_count, exports_cached);
    counter!(
        increment_exports_uncached,
        exports_uncached_count,
        exports_uncached
    );
    counter!(
        increment_exports_not_eligible,
        exports_not_eligible_count,
        exports_not_eligible
    );
    counter!(increment_exports_served, exports_served_count, exports_served);
    counter!(increment_trees_analysed, trees_analysed_count, trees_analysed);
}

/// Tracker for currently running analysis tasks.
///
/// The progress reporter prints one sample of whatever is running right
/// now, together with the number of tasks in flight.
#[derive(Debug, Default)]
pub struct TaskTracker {
    running: Mutex<HashMap<String, usize>>,
}

impl TaskTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a task started.
    pub fn start(&self, name: &str) {
        if let Ok(mut running) = self.running.lock() {
            *running.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    /// Record that a task finished.
    pub fn stop(&self, name: &str) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(count) = running.get_mut(name) {
                *count -= 1;
                if *count == 0 {
                    running.remove(name);
                }
            }
        }
    }

    /// One currently running task, if any, and the total in flight.
    #[must_use]
    pub fn sample(&self) -> (Option<String>, usize) {
        match self.running.lock() {
            Ok(running) => {
                let total: usize = running.values().sum();
                (running.keys().next().cloned(), total)
            }
            Err(_) => (None, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let stats = Statistics::new();
        stats.increment_actions_queued();
        stats.increment_actions_queued();
        stats.increment_exports_cached();
        assert_eq!(stats.actions_queued_count(), 2);
        assert_eq!(stats.exports_cached_count(), 1);
        stats.reset();
        assert_eq!(stats.actions_queued_count(), 0);
    }

    #[test]
    fn tracker_samples_running_tasks() {
        let tracker = TaskTracker::new();
        assert_eq!(tracker.sample(), (None, 0));
        tracker.start("analysing [\"\",\"\",\"x\"]");
        tracker.start("analysing [\"\",\"\",\"x\"]");
        let (sample, count) = tracker.sample();
        assert!(sample.is_some());
        assert_eq!(count, 2);
        tracker.stop("analysing [\"\",\"\",\"x\"]");
        tracker.stop("analysing [\"\",\"\",\"x\"]");
        assert_eq!(tracker.sample(), (None, 0));
    }
}
