//! Concurrent map of on-demand computed values.
//!
//! An [`AsyncMapConsumer`] owns a sharded map from keys to values produced
//! by a user-supplied creator. The creator for a key runs at most once; all
//! concurrent and later requests for the key resolve to the published
//! value. Creators express recursive dependencies through a *sub-caller*:
//! it requests further keys and queues a continuation that runs once all of
//! them are ready. Failure is reported through the logger; a fatal log
//! marks the key failed and the failure propagates to every entry whose
//! sub-call awaits it.
//!
//! Shard mutexes are never held across user callbacks: waiters are taken
//! out of the entry under the lock and run after it is released.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::task_system::TaskHandle;

/// Receives diagnostics from value creators; `fatal = true` fails the key.
pub type Logger = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Publishes the value of a key; consumed by the creator exactly once.
pub type Setter<V> = Box<dyn FnOnce(V) + Send>;

/// Continuation over resolved values, in request order.
pub type Continuation<V> = Box<dyn FnOnce(Vec<Arc<V>>) + Send>;

/// Requests further keys from inside a creator and queues a continuation
/// to run once all of them are ready.
pub type SubCaller<K, V> = Arc<dyn Fn(Vec<K>, Continuation<V>, Logger) + Send + Sync>;

/// Produces the value for a key.
///
/// Called with the task handle, the setter publishing the value, the
/// logger, the sub-caller for recursive requests, and the key itself.
pub type ValueCreator<K, V> =
    Box<dyn Fn(&TaskHandle, Setter<V>, Logger, SubCaller<K, V>, &K) + Send + Sync>;

/// Called once per failed key by the top-level consume.
pub type FailureReporter<K> = Arc<dyn Fn(&K) + Send + Sync>;

/// Renders one cycle of keys for the cycle-detection report.
pub type CyclePrinter<K> = Box<dyn Fn(&[K]) -> String>;

struct Entry<K, V> {
    started: bool,
    value: Option<Arc<V>>,
    failed: bool,
    /// Invoked with `Some(value)` on success, `None` on failure. Waiters
    /// run outside the shard lock.
    waiting: Vec<Box<dyn FnOnce(Option<Arc<V>>) + Send>>,
    /// Keys the entry's pending sub-call waits on, for cycle detection.
    deps: Vec<K>,
}

impl<K, V> Default for Entry<K, V> {
    fn default() -> Self {
        Self {
            started: false,
            value: None,
            failed: false,
            waiting: Vec::new(),
            deps: Vec::new(),
        }
    }
}

struct Inner<K, V> {
    shards: Vec<Mutex<HashMap<K, Entry<K, V>>>>,
    creator: ValueCreator<K, V>,
}

/// Shared state of one multi-key request.
struct Gather<K, V> {
    remaining: AtomicUsize,
    abandoned: AtomicBool,
    slots: Mutex<Vec<Option<Arc<V>>>>,
    continuation: Mutex<Option<Continuation<V>>>,
    reporter: Option<FailureReporter<K>>,
    ts: TaskHandle,
}

/// Concurrent key-to-value map with at-most-one evaluation per key.
pub struct AsyncMapConsumer<K, V> {
    inner: Arc<Inner<K, V>>,
    ts: TaskHandle,
}

impl<K, V> AsyncMapConsumer<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a map backed by `2 * jobs + 1` shards.
    #[must_use]
    pub fn new(ts: &TaskHandle, jobs: usize, creator: ValueCreator<K, V>) -> Self {
        let width = (2 * jobs + 1).max(1);
        Self {
            inner: Arc::new(Inner {
                shards: (0..width).map(|_| Mutex::new(HashMap::new())).collect(),
                creator,
            }),
            ts: ts.clone(),
        }
    }

    /// Request `keys` and queue `consumer` once all of them are ready.
    ///
    /// The call returns immediately; the caller drives completion through
    /// the task system. `reporter` is called once per failed key; the
    /// consumer only runs if every key succeeded.
    pub fn consume_after_keys_ready(
        &self,
        keys: Vec<K>,
        consumer: Continuation<V>,
        logger: Logger,
        reporter: FailureReporter<K>,
    ) {
        request(
            &self.inner,
            &self.ts,
            keys,
            consumer,
            logger,
            None,
            Some(reporter),
        );
    }

    /// The value of a key, if it has been computed.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let shard = shard_of(&self.inner, key);
        let guard = self.inner.shards[shard].lock().ok()?;
        guard.get(key).and_then(|e| e.value.clone())
    }

    /// Whether a key has been marked failed.
    #[must_use]
    pub fn is_failed(&self, key: &K) -> bool {
        let shard = shard_of(&self.inner, key);
        self.inner.shards[shard]
            .lock()
            .map(|guard| guard.get(key).is_some_and(|e| e.failed))
            .unwrap_or(false)
    }

    /// Keys that were started but never resolved nor failed.
    #[must_use]
    pub fn pending_keys(&self) -> Vec<K> {
        let mut pending = Vec::new();
        for shard in &self.inner.shards {
            if let Ok(guard) = shard.lock() {
                pending.extend(
                    guard
                        .iter()
                        .filter(|(_, e)| e.started && e.value.is_none() && !e.failed)
                        .map(|(k, _)| k.clone()),
                );
            }
        }
        pending
    }

    /// Detect a dependency cycle among pending keys.
    ///
    /// Walks the recorded sub-call edges restricted to pending entries and
    /// returns a minimum-length cycle rendered by `printer`, if any exists.
    /// Meant to run after the task system went quiet with keys pending.
    #[must_use]
    pub fn detect_cycle(&self, printer: &CyclePrinter<K>) -> Option<String> {
        let mut edges: HashMap<K, Vec<K>> = HashMap::new();
        for shard in &self.inner.shards {
            if let Ok(guard) = shard.lock() {
                for (key, entry) in guard.iter() {
                    if entry.started && entry.value.is_none() && !entry.failed {
                        edges.insert(key.clone(), entry.deps.clone());
                    }
                }
            }
        }
        let cycle = find_minimal_cycle(&edges)?;
        Some(printer(&cycle))
    }
}

fn shard_of<K: Hash, V>(inner: &Inner<K, V>, key: &K) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % inner.shards.len()
}

/// Shortest cycle in a small directed graph, by BFS from every node.
fn find_minimal_cycle<K: Eq + Hash + Clone>(edges: &HashMap<K, Vec<K>>) -> Option<Vec<K>> {
    let mut best: Option<Vec<K>> = None;
    for start in edges.keys() {
        // BFS for the shortest path back to `start`.
        let mut parents: HashMap<K, K> = HashMap::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(start.clone());
        let mut found = false;
        'bfs: while let Some(node) = queue.pop_front() {
            for next in edges.get(&node).into_iter().flatten() {
                if !edges.contains_key(next) {
                    continue;
                }
                if next == start {
                    parents.insert(start.clone(), node);
                    found = true;
                    break 'bfs;
                }
                if !parents.contains_key(next) {
                    parents.insert(next.clone(), node.clone());
                    queue.push_back(next.clone());
                }
            }
        }
        if found {
            let mut cycle = vec![start.clone()];
            let mut at = parents[start].clone();
            while at != *start {
                cycle.push(at.clone());
                at = parents[&at].clone();
            }
            cycle.reverse();
            if best.as_ref().is_none_or(|b| cycle.len() < b.len()) {
                best = Some(cycle);
            }
        }
    }
    best
}

/// Register interest in `keys`, starting creators as needed.
fn request<K, V>(
    inner: &Arc<Inner<K, V>>,
    ts: &TaskHandle,
    keys: Vec<K>,
    continuation: Continuation<V>,
    logger: Logger,
    parent: Option<K>,
    reporter: Option<FailureReporter<K>>,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    if let Some(parent_key) = &parent {
        record_deps(inner, parent_key, &keys);
    }
    let n = keys.len();
    let gather = Arc::new(Gather {
        // One guard slot keeps the continuation from firing while keys are
        // still being registered below.
        remaining: AtomicUsize::new(n + 1),
        abandoned: AtomicBool::new(false),
        slots: Mutex::new((0..n).map(|_| None).collect()),
        continuation: Mutex::new(Some(continuation)),
        reporter,
        ts: ts.clone(),
    });

    enum Immediate<V> {
        Ready(Arc<V>),
        Failed,
        Waiting,
    }
    let mut to_start = Vec::new();
    for (index, key) in keys.iter().enumerate() {
        let shard = shard_of(inner, key);
        let immediate = {
            let Ok(mut guard) = inner.shards[shard].lock() else {
                return;
            };
            let entry = guard.entry(key.clone()).or_default();
            if let Some(value) = &entry.value {
                Immediate::Ready(Arc::clone(value))
            } else if entry.failed {
                Immediate::Failed
            } else {
                let gather = Arc::clone(&gather);
                let waiter_key = key.clone();
                entry
                    .waiting
                    .push(Box::new(move |outcome| match outcome {
                        Some(value) => deliver(&gather, index, value),
                        None => fail_gather(&gather, &waiter_key),
                    }));
                if !entry.started {
                    entry.started = true;
                    to_start.push(key.clone());
                }
                Immediate::Waiting
            }
        };
        match immediate {
            Immediate::Ready(value) => deliver(&gather, index, value),
            Immediate::Failed => fail_gather(&gather, key),
            Immediate::Waiting => {}
        }
    }

    for key in to_start {
        let inner = Arc::clone(inner);
        let ts_inner = ts.clone();
        let logger = Arc::clone(&logger);
        ts.queue_task(move || run_creator(&inner, &ts_inner, key, logger));
    }

    // Drop the registration guard.
    finish_gather_slot(&gather);
}

fn record_deps<K, V>(inner: &Arc<Inner<K, V>>, parent: &K, keys: &[K])
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    let shard = shard_of(inner, parent);
    if let Ok(mut guard) = inner.shards[shard].lock() {
        if let Some(entry) = guard.get_mut(parent) {
            entry.deps = keys.to_vec();
        }
    }
}

fn deliver<K, V>(gather: &Arc<Gather<K, V>>, index: usize, value: Arc<V>)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    if let Ok(mut slots) = gather.slots.lock() {
        slots[index] = Some(value);
    }
    finish_gather_slot(gather);
}

fn finish_gather_slot<K, V>(gather: &Arc<Gather<K, V>>)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    if gather.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    if gather.abandoned.load(Ordering::Acquire) {
        return;
    }
    let Some(continuation) = gather.continuation.lock().ok().and_then(|mut c| c.take()) else {
        return;
    };
    let values: Option<Vec<Arc<V>>> = match gather.slots.lock() {
        Ok(mut slots) => slots.iter_mut().map(Option::take).collect(),
        Err(_) => None,
    };
    if let Some(values) = values {
        gather.ts.queue_task(move || continuation(values));
    }
}

/// A key this gather waits on failed: abandon the continuation, report the
/// key, and propagate to the parent entry.
fn fail_gather<K, V>(gather: &Arc<Gather<K, V>>, key: &K)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    if let Some(reporter) = &gather.reporter {
        reporter(key);
    }
    let first = !gather.abandoned.swap(true, Ordering::AcqRel);
    if first {
        if let Ok(mut continuation) = gather.continuation.lock() {
            continuation.take();
        }
    }
    finish_gather_slot(gather);
    // Note: parent failure is triggered by the sub-caller that created this
    // gather; see `make_subcaller`.
}

fn run_creator<K, V>(inner: &Arc<Inner<K, V>>, ts: &TaskHandle, key: K, logger: Logger)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let setter = make_setter(inner, ts, key.clone());
    let wrapped_logger = make_logger(inner, key.clone(), logger);
    let subcaller = make_subcaller(inner, ts, key.clone());
    (inner.creator)(ts, setter, wrapped_logger, subcaller, &key);
}

fn make_setter<K, V>(inner: &Arc<Inner<K, V>>, ts: &TaskHandle, key: K) -> Setter<V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let inner = Arc::clone(inner);
    let ts = ts.clone();
    Box::new(move |value: V| {
        let value = Arc::new(value);
        let shard = shard_of(&inner, &key);
        let waiting = {
            let Ok(mut guard) = inner.shards[shard].lock() else {
                return;
            };
            let entry = guard.entry(key.clone()).or_default();
            if entry.failed || entry.value.is_some() {
                return;
            }
            entry.value = Some(Arc::clone(&value));
            entry.deps.clear();
            std::mem::take(&mut entry.waiting)
        };
        for waiter in waiting {
            let value = Arc::clone(&value);
            ts.queue_task(move || waiter(Some(value)));
        }
    })
}

/// Wrap the user logger so that a fatal message fails the key.
fn make_logger<K, V>(inner: &Arc<Inner<K, V>>, key: K, logger: Logger) -> Logger
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let inner = Arc::clone(inner);
    Arc::new(move |msg: &str, fatal: bool| {
        logger(msg, fatal);
        if fatal {
            fail_entry(&inner, &key);
        }
    })
}

/// Mark a key failed and notify its waiters.
fn fail_entry<K, V>(inner: &Arc<Inner<K, V>>, key: &K)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let shard = shard_of(inner, key);
    let waiting = {
        let Ok(mut guard) = inner.shards[shard].lock() else {
            return;
        };
        let entry = guard.entry(key.clone()).or_default();
        if entry.failed || entry.value.is_some() {
            return;
        }
        entry.failed = true;
        entry.deps.clear();
        std::mem::take(&mut entry.waiting)
    };
    for waiter in waiting {
        waiter(None);
    }
}

fn make_subcaller<K, V>(inner: &Arc<Inner<K, V>>, ts: &TaskHandle, parent: K) -> SubCaller<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let inner = Arc::clone(inner);
    let ts = ts.clone();
    Arc::new(move |keys: Vec<K>, continuation: Continuation<V>, logger: Logger| {
        let fail_parent = {
            let inner = Arc::clone(&inner);
            let parent = parent.clone();
            let once = AtomicBool::new(false);
            Arc::new(move |_key: &K| {
                if !once.swap(true, Ordering::AcqRel) {
                    fail_entry(&inner, &parent);
                }
            }) as FailureReporter<K>
        };
        request(
            &inner,
            &ts,
            keys,
            continuation,
            logger,
            Some(parent.clone()),
            Some(fail_parent),
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_system::TaskSystem;
    use std::sync::atomic::AtomicUsize;

    fn null_logger() -> Logger {
        Arc::new(|_msg, _fatal| {})
    }

    fn ignore_failures() -> FailureReporter<u64> {
        Arc::new(|_key| {})
    }

    /// Map computing key -> key * 2 while counting creator invocations.
    fn doubling_map(
        ts: &TaskSystem,
        calls: Arc<AtomicUsize>,
    ) -> AsyncMapConsumer<u64, u64> {
        AsyncMapConsumer::new(
            &ts.handle(),
            4,
            Box::new(move |_ts, setter, _logger, _subcaller, key: &u64| {
                calls.fetch_add(1, Ordering::SeqCst);
                setter(*key * 2);
            }),
        )
    }

    #[test]
    fn computes_values_once() {
        let ts = TaskSystem::new(4);
        let calls = Arc::new(AtomicUsize::new(0));
        let map = doubling_map(&ts, Arc::clone(&calls));
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let hits = Arc::clone(&hits);
            map.consume_after_keys_ready(
                vec![21, 21, 21],
                Box::new(move |values| {
                    assert_eq!(values.iter().map(|v| **v).collect::<Vec<_>>(), [42, 42, 42]);
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
                null_logger(),
                ignore_failures(),
            );
        }
        ts.finish();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "creator must run once");
        assert_eq!(hits.load(Ordering::SeqCst), 16);
        assert_eq!(map.get(&21).as_deref(), Some(&42));
    }

    #[test]
    fn subcalls_resolve_recursively() {
        // value(0) = 1, value(n) = n + value(n - 1)
        let ts = TaskSystem::new(4);
        let map: AsyncMapConsumer<u64, u64> = AsyncMapConsumer::new(
            &ts.handle(),
            4,
            Box::new(|_ts, setter, logger, subcaller, key: &u64| {
                if *key == 0 {
                    setter(1);
                } else {
                    let key = *key;
                    subcaller(
                        vec![key - 1],
                        Box::new(move |values| setter(key + *values[0])),
                        logger,
                    );
                }
            }),
        );
        let result = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&result);
        map.consume_after_keys_ready(
            vec![10],
            Box::new(move |values| {
                seen.store(*values[0] as usize, Ordering::SeqCst);
            }),
            null_logger(),
            ignore_failures(),
        );
        ts.finish();
        assert_eq!(result.load(Ordering::SeqCst), 56); // 1 + 1 + 2 + ... + 10
    }

    #[test]
    fn failure_propagates_to_consumers() {
        let ts = TaskSystem::new(2);
        let map: AsyncMapConsumer<u64, u64> = AsyncMapConsumer::new(
            &ts.handle(),
            2,
            Box::new(|_ts, setter, logger, subcaller, key: &u64| {
                if *key == 13 {
                    logger("unlucky", true);
                } else if *key > 13 {
                    subcaller(
                        vec![13],
                        Box::new(move |_values| setter(0)),
                        logger,
                    );
                } else {
                    setter(*key);
                }
            }),
        );
        let failed = Arc::new(Mutex::new(Vec::new()));
        let failed_keys = Arc::clone(&failed);
        let consumed = Arc::new(AtomicBool::new(false));
        let consumed_flag = Arc::clone(&consumed);
        map.consume_after_keys_ready(
            vec![1, 14],
            Box::new(move |_values| {
                consumed_flag.store(true, Ordering::SeqCst);
            }),
            null_logger(),
            Arc::new(move |key: &u64| {
                if let Ok(mut failed) = failed_keys.lock() {
                    failed.push(*key);
                }
            }),
        );
        ts.finish();
        assert!(!consumed.load(Ordering::SeqCst), "consumer must not run");
        assert_eq!(*failed.lock().unwrap(), vec![14]);
        assert!(map.is_failed(&14));
        assert!(map.is_failed(&13));
        assert_eq!(map.get(&1).as_deref(), Some(&1));
    }

    #[test]
    fn detects_minimal_cycle() {
        let ts = TaskSystem::new(2);
        // 1 -> 2 -> 3 -> 1 plus a longer cycle 10 -> .. -> 14 -> 10.
        let map: AsyncMapConsumer<u64, u64> = AsyncMapConsumer::new(
            &ts.handle(),
            2,
            Box::new(|_ts, setter, logger, subcaller, key: &u64| {
                let next = match *key {
                    1 => 2,
                    2 => 3,
                    3 => 1,
                    10..=13 => *key + 1,
                    14 => 10,
                    _ => {
                        setter(0);
                        return;
                    }
                };
                subcaller(vec![next], Box::new(move |_v| setter(0)), logger);
            }),
        );
        map.consume_after_keys_ready(
            vec![1, 10],
            Box::new(|_values| {}),
            null_logger(),
            ignore_failures(),
        );
        ts.finish();
        let printer: CyclePrinter<u64> = Box::new(|cycle| {
            format!(
                "cycle: {}",
                cycle
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" -> ")
            )
        });
        let report = map.detect_cycle(&printer).expect("cycle must be found");
        // The minimal cycle has three members.
        let members = report.trim_start_matches("cycle: ").split(" -> ").count();
        assert_eq!(members, 3);
        assert!(!map.pending_keys().is_empty());
    }

    #[test]
    fn no_cycle_for_resolved_maps() {
        let ts = TaskSystem::new(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let map = doubling_map(&ts, calls);
        map.consume_after_keys_ready(
            vec![1, 2, 3],
            Box::new(|_values| {}),
            null_logger(),
            ignore_failures(),
        );
        ts.finish();
        let printer: CyclePrinter<u64> = Box::new(|_| String::new());
        assert!(map.detect_cycle(&printer).is_none());
        assert!(map.pending_keys().is_empty());
    }
}
