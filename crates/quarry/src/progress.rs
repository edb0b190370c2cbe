//! Wiring of the periodic status line.

use std::sync::Arc;

use quarry_common::{ProgressReporter, ReporterHandle, Statistics, TaskTracker};

/// Start the reporter over the invocation's counters.
///
/// Each wake-up combines the current analysis sample with the action
/// queue counters and the export-cache counters into one log line.
pub fn start_reporter(statistics: &Arc<Statistics>, tracker: &Arc<TaskTracker>) -> ReporterHandle {
    let statistics = Arc::clone(statistics);
    let tracker = Arc::clone(tracker);
    ProgressReporter::start(move || {
        let mut line = String::new();
        let (sample, active) = tracker.sample();
        if let Some(sample) = sample {
            line.push_str(&format!("processing {sample}"));
            if active > 1 {
                line.push_str(&format!(" and {} more", active - 1));
            }
            line.push_str("; ");
        }
        line.push_str(&format!(
            "actions: {} queued, {} cached, {} executed",
            statistics.actions_queued_count(),
            statistics.actions_cached_count(),
            statistics.actions_executed_count(),
        ));
        let exports_seen = statistics.exports_cached_count()
            + statistics.exports_uncached_count()
            + statistics.exports_not_eligible_count()
            + statistics.exports_served_count();
        if exports_seen > 0 {
            line.push_str(&format!(
                "; exports: {} cached, {} uncached, {} not eligible, {} served",
                statistics.exports_cached_count(),
                statistics.exports_uncached_count(),
                statistics.exports_not_eligible_count(),
                statistics.exports_served_count(),
            ));
        }
        tracing::info!("{line}");
    })
}
