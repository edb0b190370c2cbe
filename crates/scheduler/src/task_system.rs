//! Fixed-size worker pool with per-worker queues and stealing.
//!
//! Every worker owns a lock-protected FIFO queue. `queue_task` pushes to
//! the calling worker's own queue when invoked from inside the pool, and
//! round-robin across queues otherwise. Idle workers steal from the back
//! of their peers' queues before going to sleep. Tasks are finite closures;
//! they never park mid-execution; logical waits are expressed as
//! continuations queued against async-map keys.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::utils::Backoff;

type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Pool id and worker index of the current thread, when it is a worker.
    static CURRENT_WORKER: RefCell<Option<(usize, usize)>> = const { RefCell::new(None) };
}

struct Shared {
    pool_id: usize,
    queues: Vec<Mutex<VecDeque<Task>>>,
    /// Tasks queued or running.
    pending: AtomicUsize,
    /// Queued tasks are dropped once set; running tasks complete.
    shutdown: AtomicBool,
    /// Workers exit once set and idle.
    stop: AtomicBool,
    round_robin: AtomicUsize,
    sleep: Mutex<()>,
    work_cv: Condvar,
    quiet: Mutex<()>,
    quiet_cv: Condvar,
}

impl Shared {
    fn pop_task(&self, me: usize) -> Option<Task> {
        if let Ok(mut own) = self.queues[me].lock() {
            if let Some(task) = own.pop_front() {
                return Some(task);
            }
        }
        let n = self.queues.len();
        for i in 1..n {
            let victim = (me + i) % n;
            if let Ok(mut queue) = self.queues[victim].lock() {
                if let Some(task) = queue.pop_back() {
                    return Some(task);
                }
            }
        }
        None
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.quiet.lock();
            self.quiet_cv.notify_all();
        }
    }

    fn drain_queues(&self) {
        for queue in &self.queues {
            if let Ok(mut queue) = queue.lock() {
                while queue.pop_front().is_some() {
                    self.finish_one();
                }
            }
        }
    }
}

fn worker_loop(shared: &Arc<Shared>, me: usize) {
    CURRENT_WORKER.with(|w| *w.borrow_mut() = Some((shared.pool_id, me)));
    let backoff = Backoff::new();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            shared.drain_queues();
        }
        if shared.stop.load(Ordering::Acquire) && shared.pending.load(Ordering::Acquire) == 0 {
            break;
        }
        match shared.pop_task(me) {
            Some(task) => {
                backoff.reset();
                task();
                shared.finish_one();
            }
            None => {
                if !backoff.is_completed() {
                    backoff.snooze();
                    continue;
                }
                let Ok(guard) = shared.sleep.lock() else {
                    break;
                };
                // Re-check under the lock so a concurrent push cannot be
                // missed between the failed pop and the wait.
                if shared.pending.load(Ordering::Acquire) > 0
                    || shared.stop.load(Ordering::Acquire)
                    || shared.shutdown.load(Ordering::Acquire)
                {
                    continue;
                }
                let _unused = shared
                    .work_cv
                    .wait_timeout(guard, Duration::from_millis(100));
                backoff.reset();
            }
        }
    }
    CURRENT_WORKER.with(|w| *w.borrow_mut() = None);
}

/// Pool of worker threads executing queued closures.
pub struct TaskSystem {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl TaskSystem {
    /// Spawn a pool with the given number of workers (at least one).
    #[must_use]
    pub fn new(jobs: usize) -> Self {
        let jobs = jobs.max(1);
        let shared = Arc::new(Shared {
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            queues: (0..jobs).map(|_| Mutex::new(VecDeque::new())).collect(),
            pending: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            round_robin: AtomicUsize::new(0),
            sleep: Mutex::new(()),
            work_cv: Condvar::new(),
            quiet: Mutex::new(()),
            quiet_cv: Condvar::new(),
        });
        let workers = (0..jobs)
            .map(|me| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker_loop(&shared, me))
            })
            .collect();
        Self { shared, workers }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn jobs(&self) -> usize {
        self.shared.queues.len()
    }

    /// A cloneable handle for queueing from inside tasks.
    #[must_use]
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Queue a task for execution.
    pub fn queue_task<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.handle().queue_task(task);
    }

    /// Block until every queue is drained and all workers are idle.
    ///
    /// Tasks queued by running tasks are waited for as well.
    pub fn finish(&self) {
        let Ok(mut guard) = self.shared.quiet.lock() else {
            return;
        };
        while self.shared.pending.load(Ordering::Acquire) > 0 {
            let Ok((g, _timeout)) = self
                .shared
                .quiet_cv
                .wait_timeout(guard, Duration::from_millis(50))
            else {
                return;
            };
            guard = g;
        }
    }

    /// Stop accepting work and drop queued tasks; running tasks complete.
    pub fn shutdown(&self) {
        self.handle().shutdown();
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        if !self.shared.shutdown.load(Ordering::Acquire) {
            self.finish();
        }
        self.shared.stop.store(true, Ordering::Release);
        {
            let _guard = self.shared.sleep.lock();
            self.shared.work_cv.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Cloneable queueing handle onto a [`TaskSystem`].
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<Shared>,
}

impl TaskHandle {
    /// Queue a task for execution.
    ///
    /// Inside a worker of this pool the task goes to that worker's own
    /// queue; otherwise queues are picked round-robin. After `shutdown`
    /// the task is silently dropped.
    pub fn queue_task<F: FnOnce() + Send + 'static>(&self, task: F) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let n = self.shared.queues.len();
        let slot = CURRENT_WORKER
            .with(|w| match *w.borrow() {
                Some((pool, index)) if pool == self.shared.pool_id => Some(index),
                _ => None,
            })
            .unwrap_or_else(|| self.shared.round_robin.fetch_add(1, Ordering::Relaxed) % n);
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut queue) = self.shared.queues[slot].lock() {
            queue.push_back(Box::new(task));
        } else {
            self.shared.finish_one();
            return;
        }
        let _guard = self.shared.sleep.lock();
        self.shared.work_cv.notify_one();
    }

    /// Stop accepting work and drop queued tasks; running tasks complete.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            tracing::debug!("task system shutting down, dropping queued tasks");
        }
        self.shared.drain_queues();
        let _guard = self.shared.sleep.lock();
        self.shared.work_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn executes_all_queued_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ts = TaskSystem::new(4);
        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            ts.queue_task(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        ts.finish();
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn tasks_can_queue_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ts = TaskSystem::new(2);
        let handle = ts.handle();
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            let handle = handle.clone();
            ts.queue_task(move || {
                for _ in 0..10 {
                    let counter = Arc::clone(&counter);
                    handle.queue_task(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
            });
        }
        ts.finish();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn finish_is_reusable() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ts = TaskSystem::new(3);
        for round in 1..=3 {
            for _ in 0..50 {
                let counter = Arc::clone(&counter);
                ts.queue_task(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
            ts.finish();
            assert_eq!(counter.load(Ordering::Relaxed), round * 50);
        }
    }

    #[test]
    fn shutdown_drops_queued_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ts = TaskSystem::new(1);
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let counter_in = Arc::clone(&counter);
        ts.queue_task(move || {
            // Hold the only worker until the queue is filled and shut down;
            // the running task still completes.
            let _ = gate_rx.recv();
            counter_in.fetch_add(1, Ordering::Relaxed);
        });
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            ts.queue_task(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        ts.shutdown();
        let _ = gate_tx.send(());
        ts.finish();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn single_worker_preserves_fifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let ts = TaskSystem::new(1);
        for i in 0..20 {
            let order = Arc::clone(&order);
            ts.queue_task(move || {
                if let Ok(mut order) = order.lock() {
                    order.push(i);
                }
            });
        }
        ts.finish();
        let order = order.lock().unwrap();
        assert_eq!(*order, (0..20).collect::<Vec<_>>());
    }
}
