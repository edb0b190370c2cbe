//! Driving a full analysis of one configured target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use quarry_scheduler::{CyclePrinter, TaskSystem};
use thiserror::Error;

use crate::analysed_target::AnalysedTarget;
use crate::configured_target::ConfiguredTarget;
use crate::target_map::{create_target_map, AnalyseContext};

/// Failure of a top-level analysis.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// At least one target logged a fatal error.
    #[error("analysis of {0} failed")]
    TargetFailed(String),

    /// The target graph contains a dependency cycle.
    #[error("{0}")]
    Cycle(String),

    /// Analysis went quiet with unresolved targets and no cycle.
    #[error("analysis of {target} stalled; pending: {pending:?}")]
    Stalled {
        target: String,
        pending: Vec<String>,
    },
}

/// A successfully analysed request.
#[derive(Debug)]
pub struct AnalysisResult {
    pub target: ConfiguredTarget,
    pub analysed: Arc<AnalysedTarget>,
}

/// Analyse a configured target to completion.
///
/// Drives the target map on the given task system until it is quiet,
/// then reports the result, a cycle, or the fatal diagnostics that were
/// logged. All non-fatal and fatal messages go to tracing.
pub fn analyse(
    ctx: &Arc<AnalyseContext>,
    ts: &TaskSystem,
    target: ConfiguredTarget,
) -> Result<AnalysisResult, AnalysisError> {
    let map = create_target_map(ctx, &ts.handle());
    let failed = Arc::new(AtomicBool::new(false));
    let slot: Arc<Mutex<Option<Arc<AnalysedTarget>>>> = Arc::new(Mutex::new(None));

    let logger: quarry_scheduler::Logger = {
        let failed = Arc::clone(&failed);
        Arc::new(move |msg: &str, fatal: bool| {
            if fatal {
                failed.store(true, Ordering::Release);
                tracing::error!("{msg}");
            } else {
                tracing::warn!("{msg}");
            }
        })
    };
    let reporter: quarry_scheduler::FailureReporter<ConfiguredTarget> = {
        let failed = Arc::clone(&failed);
        Arc::new(move |key: &ConfiguredTarget| {
            failed.store(true, Ordering::Release);
            tracing::error!(target = %key.to_short_string(), "failed to analyse target");
        })
    };
    {
        let slot = Arc::clone(&slot);
        map.consume_after_keys_ready(
            vec![target.clone()],
            Box::new(move |values| {
                if let Ok(mut slot) = slot.lock() {
                    *slot = Some(Arc::clone(&*values[0]));
                }
            }),
            logger,
            reporter,
        );
    }
    ts.finish();

    if let Some(analysed) = slot.lock().ok().and_then(|mut s| s.take()) {
        return Ok(AnalysisResult { target, analysed });
    }
    let printer: CyclePrinter<ConfiguredTarget> = Box::new(|cycle| {
        let mut lines = vec!["Cyclic dependency between targets:".to_string()];
        lines.extend(cycle.iter().map(|key| format!("  {}", key.to_short_string())));
        lines.join("\n")
    });
    if let Some(report) = map.detect_cycle(&printer) {
        tracing::error!("{report}");
        return Err(AnalysisError::Cycle(report));
    }
    if failed.load(Ordering::Acquire) {
        return Err(AnalysisError::TargetFailed(target.to_short_string()));
    }
    Err(AnalysisError::Stalled {
        target: target.to_short_string(),
        pending: map
            .pending_keys()
            .iter()
            .map(ConfiguredTarget::to_short_string)
            .collect(),
    })
}
