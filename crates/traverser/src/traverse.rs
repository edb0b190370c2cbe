//! The parallel traversal itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quarry_common::{ActionDescription, ArtifactDescription};
use quarry_scheduler::{TaskHandle, TaskSystem};

use crate::graph::DependencyGraph;

/// The capability set the traverser drives.
///
/// Processing an action executes it; processing an artifact without a
/// builder action uploads it. Both report success; a failure aborts the
/// traversal.
pub trait Executor: Send + Sync {
    fn process_action(&self, action: &Arc<ActionDescription>) -> bool;
    fn process_artifact(&self, artifact: &ArtifactDescription) -> bool;
}

struct Traversal<E: ?Sized> {
    graph: Arc<DependencyGraph>,
    executor: Arc<E>,
    failed: Arc<AtomicBool>,
    ts: TaskHandle,
}

/// Build the requested artifacts, exploiting graph parallelism.
///
/// Only what is strictly needed for `targets` is executed; every node is
/// visited at most once and processed at most once. Returns false when
/// any target is unknown or any processing failed.
pub fn traverse<E: Executor + ?Sized + 'static>(
    graph: Arc<DependencyGraph>,
    executor: Arc<E>,
    jobs: usize,
    targets: &[ArtifactDescription],
) -> bool {
    let ts = TaskSystem::new(jobs);
    let failed = Arc::new(AtomicBool::new(false));
    let traversal = Arc::new(Traversal {
        graph: Arc::clone(&graph),
        executor,
        failed: Arc::clone(&failed),
        ts: ts.handle(),
    });
    for target in targets {
        match graph.artifact_id(target) {
            Some(artifact_id) => queue_artifact_visit(&traversal, artifact_id),
            None => {
                tracing::error!(
                    artifact = %target,
                    "artifact can not be found in dependency graph"
                );
                abort(&traversal);
                return false;
            }
        }
    }
    ts.finish();
    !failed.load(Ordering::Acquire)
}

fn abort<E: Executor + ?Sized + 'static>(traversal: &Arc<Traversal<E>>) {
    traversal.failed.store(true, Ordering::Release);
    // Skip execution of everything still queued.
    traversal.ts.shutdown();
}

fn queue_artifact_visit<E: Executor + ?Sized + 'static>(traversal: &Arc<Traversal<E>>, id: usize) {
    if traversal.failed.load(Ordering::Acquire)
        || traversal.graph.artifact(id).state.get_and_mark_discovered()
    {
        return;
    }
    let traversal = Arc::clone(traversal);
    traversal
        .ts
        .clone()
        .queue_task(move || visit_artifact(&traversal, id));
}

fn queue_action_visit<E: Executor + ?Sized + 'static>(traversal: &Arc<Traversal<E>>, id: usize) {
    if traversal.failed.load(Ordering::Acquire)
        || traversal.graph.action(id).state.get_and_mark_discovered()
    {
        return;
    }
    let traversal = Arc::clone(traversal);
    traversal
        .ts
        .clone()
        .queue_task(move || visit_action(&traversal, id));
}

fn visit_artifact<E: Executor + ?Sized + 'static>(traversal: &Arc<Traversal<E>>, id: usize) {
    let node = traversal.graph.artifact(id);
    node.state.mark_required();
    // The builder action may have run already through another output, in
    // which case this artifact is available and nothing is left to do.
    if node.state.is_available() {
        return;
    }
    match node.builder {
        Some(action_id) => queue_action_visit(traversal, action_id),
        None => queue_artifact_processing(traversal, id),
    }
}

fn visit_action<E: Executor + ?Sized + 'static>(traversal: &Arc<Traversal<E>>, id: usize) {
    let node = traversal.graph.action(id);
    node.state.mark_required();
    for &dep in &node.children {
        if !traversal.graph.artifact(dep).state.is_available() {
            queue_artifact_visit(traversal, dep);
        }
    }
    if node.state.is_ready() {
        queue_action_processing(traversal, id);
    }
}

fn queue_artifact_processing<E: Executor + ?Sized + 'static>(traversal: &Arc<Traversal<E>>, id: usize) {
    let node = traversal.graph.artifact(id);
    if traversal.failed.load(Ordering::Acquire)
        || !node.state.is_required()
        || node.state.get_and_mark_queued()
    {
        return;
    }
    let traversal = Arc::clone(traversal);
    traversal.ts.clone().queue_task(move || {
        let node = traversal.graph.artifact(id);
        if traversal.executor.process_artifact(&node.description) {
            notify_artifact_available(&traversal, id);
        } else {
            abort(&traversal);
        }
    });
}

fn queue_action_processing<E: Executor + ?Sized + 'static>(traversal: &Arc<Traversal<E>>, id: usize) {
    let node = traversal.graph.action(id);
    if traversal.failed.load(Ordering::Acquire)
        || !node.state.is_required()
        || node.state.get_and_mark_queued()
    {
        return;
    }
    let traversal = Arc::clone(traversal);
    traversal.ts.clone().queue_task(move || {
        let node = traversal.graph.action(id);
        if traversal.executor.process_action(&node.description) {
            for &output in &node.outputs {
                notify_artifact_available(&traversal, output);
            }
        } else {
            abort(&traversal);
        }
    });
}

/// Mark available and wake consumers whose last dependency just landed.
fn notify_artifact_available<E: Executor + ?Sized + 'static>(traversal: &Arc<Traversal<E>>, id: usize) {
    let node = traversal.graph.artifact(id);
    node.state.make_available();
    for &consumer in &node.consumers {
        if traversal
            .graph
            .action(consumer)
            .state
            .notify_dep_available()
        {
            queue_action_processing(traversal, consumer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::HashFunction;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Executor counting per-node process invocations.
    #[derive(Default)]
    struct CountingExecutor {
        action_runs: Mutex<BTreeMap<String, usize>>,
        artifact_runs: Mutex<BTreeMap<String, usize>>,
        total: AtomicUsize,
        fail_on: Option<String>,
    }

    impl Executor for CountingExecutor {
        fn process_action(&self, action: &Arc<ActionDescription>) -> bool {
            self.total.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut runs) = self.action_runs.lock() {
                *runs.entry(action.id().clone()).or_insert(0) += 1;
            }
            self.fail_on.as_deref() != Some(action.argv().last().map_or("", String::as_str))
        }

        fn process_artifact(&self, artifact: &ArtifactDescription) -> bool {
            self.total.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut runs) = self.artifact_runs.lock() {
                *runs.entry(artifact.to_string()).or_insert(0) += 1;
            }
            true
        }
    }

    fn known(content: &str) -> ArtifactDescription {
        ArtifactDescription::Known {
            digest: HashFunction::Native.hash_blob(content.as_bytes()),
            object_type: quarry_common::ObjectType::File,
        }
    }

    fn action(
        cmd: &str,
        inputs: &[ArtifactDescription],
        outs: &[&str],
    ) -> Arc<ActionDescription> {
        Arc::new(ActionDescription::new(
            HashFunction::Native,
            vec!["sh".into(), "-c".into(), cmd.into()],
            BTreeMap::new(),
            inputs
                .iter()
                .enumerate()
                .map(|(i, a)| (format!("in{i}"), a.clone()))
                .collect(),
            outs.iter().map(ToString::to_string).collect(),
            vec![],
            None,
            false,
            1.0,
            BTreeMap::new(),
        ))
    }

    #[test]
    fn every_node_is_processed_at_most_once() {
        // leaf -> a -> {mid1, mid2} -> b -> out, with both mids feeding b.
        let leaf = known("leaf");
        let a = action("make-mids", std::slice::from_ref(&leaf), &["mid1", "mid2"]);
        let b = action(
            "combine",
            &[a.output_artifact("mid1"), a.output_artifact("mid2")],
            &["out"],
        );
        let out = b.output_artifact("out");
        let graph =
            Arc::new(DependencyGraph::from_actions([Arc::clone(&a), Arc::clone(&b)]).unwrap());
        let executor = Arc::new(CountingExecutor::default());
        assert!(traverse(
            Arc::clone(&graph),
            Arc::clone(&executor),
            4,
            &[out]
        ));
        let action_runs = executor.action_runs.lock().unwrap();
        assert_eq!(action_runs.len(), 2);
        assert!(action_runs.values().all(|&count| count == 1));
        // The multi-output action ran once even though both outputs were
        // needed.
        assert_eq!(action_runs[a.id()], 1);
        let artifact_runs = executor.artifact_runs.lock().unwrap();
        assert_eq!(artifact_runs.len(), 1, "only the leaf is uploaded");
        assert!(artifact_runs.values().all(|&count| count == 1));
    }

    #[test]
    fn only_required_nodes_run() {
        let wanted = action("echo wanted > w", &[], &["w"]);
        let unwanted = action("echo unwanted > u", &[], &["u"]);
        let target = wanted.output_artifact("w");
        let graph = Arc::new(
            DependencyGraph::from_actions([Arc::clone(&wanted), Arc::clone(&unwanted)]).unwrap(),
        );
        let executor = Arc::new(CountingExecutor::default());
        assert!(traverse(graph, Arc::clone(&executor), 2, &[target]));
        let runs = executor.action_runs.lock().unwrap();
        assert!(runs.contains_key(wanted.id()));
        assert!(!runs.contains_key(unwanted.id()));
    }

    #[test]
    fn executor_failure_aborts_the_traversal() {
        let failing = action("fail-here", &[], &["broken"]);
        let downstream = action(
            "never-runs",
            &[failing.output_artifact("broken")],
            &["final"],
        );
        let target = downstream.output_artifact("final");
        let graph = Arc::new(
            DependencyGraph::from_actions([Arc::clone(&failing), Arc::clone(&downstream)])
                .unwrap(),
        );
        let executor = Arc::new(CountingExecutor {
            fail_on: Some("fail-here".to_string()),
            ..CountingExecutor::default()
        });
        assert!(!traverse(graph, Arc::clone(&executor), 2, &[target]));
        let runs = executor.action_runs.lock().unwrap();
        assert!(!runs.contains_key(downstream.id()), "downstream must not run");
    }

    #[test]
    fn unknown_targets_fail_early() {
        let graph = Arc::new(DependencyGraph::from_actions([]).unwrap());
        let executor = Arc::new(CountingExecutor::default());
        assert!(!traverse(graph, executor, 2, &[known("never stored")]));
    }

    #[test]
    fn wide_graphs_fully_build() {
        let mut actions = Vec::new();
        let mut targets = Vec::new();
        for i in 0..64 {
            let a = action(&format!("echo {i} > out{i}"), &[], &[&format!("out{i}")]);
            targets.push(a.output_artifact(&format!("out{i}")));
            actions.push(a);
        }
        let graph = Arc::new(DependencyGraph::from_actions(actions).unwrap());
        let executor = Arc::new(CountingExecutor::default());
        assert!(traverse(graph, Arc::clone(&executor), 8, &targets));
        assert_eq!(executor.total.load(Ordering::SeqCst), 64);
    }
}
