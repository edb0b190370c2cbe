//! Periodic progress reporting on a dedicated thread.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// Initial delay before the first report.
const START_DELAY_MS: u64 = 3000;
/// Delay growth per cycle, roughly sqrt(2).
const DELAY_SCALING_NUMERATOR: u64 = 99;
const DELAY_SCALING_DENOMINATOR: u64 = 70;
/// Upper bound on the delay between reports.
const MAX_DELAY_MS: u64 = 60_000;

/// Runs a reporting callback periodically with a growing delay.
///
/// The callback fires after 3 s, then with the interval scaled by 99/70
/// each cycle until the cap, and one final time on shutdown. The reporter
/// owns its thread; dropping the handle stops it.
pub struct ProgressReporter;

impl ProgressReporter {
    /// Spawn the reporter thread.
    pub fn start<F>(report: F) -> ReporterHandle
    where
        F: Fn() + Send + 'static,
    {
        let state = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_state = Arc::clone(&state);
        let thread = thread::spawn(move || {
            let (done, cv) = &*thread_state;
            let mut delay = Duration::from_millis(START_DELAY_MS);
            let mut stopped = match done.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            while !*stopped {
                let (guard, timeout) = match cv.wait_timeout(stopped, delay) {
                    Ok(r) => r,
                    Err(_) => return,
                };
                stopped = guard;
                if *stopped {
                    break;
                }
                if timeout.timed_out() {
                    report();
                    let next = delay.as_millis() as u64 * DELAY_SCALING_NUMERATOR
                        / DELAY_SCALING_DENOMINATOR;
                    delay = Duration::from_millis(next.min(MAX_DELAY_MS));
                }
            }
            drop(stopped);
            // Final report so the last state reaches the user.
            report();
        });
        ReporterHandle { state, thread: Some(thread) }
    }
}

/// Handle stopping the reporter thread.
pub struct ReporterHandle {
    state: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ReporterHandle {
    /// Stop the reporter and wait for its final report.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let (done, cv) = &*self.state;
        if let Ok(mut stopped) = done.lock() {
            *stopped = true;
        }
        cv.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ReporterHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn reporter_fires_final_report_on_stop() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handle = ProgressReporter::start(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        handle.stop();
        assert!(count.load(Ordering::SeqCst) >= 1);
    }
}
