//! The immutable dependency graph with atomic traversal state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use quarry_common::{ActionDescription, ArtifactDescription};
use thiserror::Error;

/// Errors while assembling a graph.
#[derive(Error, Debug)]
pub enum GraphError {
    /// Two actions claim the same output artifact.
    #[error("artifact {0} is the output of more than one action")]
    DuplicateBuilder(String),
}

/// Traversal state shared by artifact and action nodes.
#[derive(Debug, Default)]
pub(crate) struct TraversalState {
    discovered: AtomicBool,
    required: AtomicBool,
    queued_to_process: AtomicBool,
    available: AtomicBool,
    /// For actions: dependencies not yet available.
    unavailable_deps: AtomicUsize,
}

impl TraversalState {
    pub(crate) fn get_and_mark_discovered(&self) -> bool {
        self.discovered.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn mark_required(&self) {
        self.required.store(true, Ordering::Release);
    }

    pub(crate) fn is_required(&self) -> bool {
        self.required.load(Ordering::Acquire)
    }

    pub(crate) fn get_and_mark_queued(&self) -> bool {
        self.queued_to_process.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn make_available(&self) {
        self.available.store(true, Ordering::Release);
    }

    pub(crate) fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.unavailable_deps.load(Ordering::Acquire) == 0
    }

    /// Notify one dependency became available; true when that was the
    /// last one.
    pub(crate) fn notify_dep_available(&self) -> bool {
        self.unavailable_deps.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// An artifact in the graph.
#[derive(Debug)]
pub struct ArtifactNode {
    pub(crate) description: ArtifactDescription,
    pub(crate) builder: Option<usize>,
    pub(crate) consumers: Vec<usize>,
    pub(crate) state: TraversalState,
}

impl ArtifactNode {
    #[must_use]
    pub fn description(&self) -> &ArtifactDescription {
        &self.description
    }

    #[must_use]
    pub fn has_builder_action(&self) -> bool {
        self.builder.is_some()
    }

    /// Whether processing made this artifact available.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state.is_available()
    }
}

/// An action in the graph.
#[derive(Debug)]
pub struct ActionNode {
    pub(crate) description: Arc<ActionDescription>,
    pub(crate) children: Vec<usize>,
    pub(crate) outputs: Vec<usize>,
    pub(crate) state: TraversalState,
}

impl ActionNode {
    #[must_use]
    pub fn description(&self) -> &Arc<ActionDescription> {
        &self.description
    }
}

/// Arena of artifact and action nodes.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    pub(crate) artifacts: Vec<ArtifactNode>,
    pub(crate) actions: Vec<ActionNode>,
    ids: HashMap<ArtifactDescription, usize>,
}

impl DependencyGraph {
    /// Build the graph for a set of actions.
    pub fn from_actions(
        actions: impl IntoIterator<Item = Arc<ActionDescription>>,
    ) -> Result<Self, GraphError> {
        let mut graph = Self::default();
        for action in actions {
            graph.add_action(action)?;
        }
        graph.seal();
        Ok(graph)
    }

    /// Intern an artifact, creating its node on first sight.
    pub fn add_artifact(&mut self, description: &ArtifactDescription) -> usize {
        if let Some(&id) = self.ids.get(description) {
            return id;
        }
        let id = self.artifacts.len();
        self.artifacts.push(ArtifactNode {
            description: description.clone(),
            builder: None,
            consumers: Vec::new(),
            state: TraversalState::default(),
        });
        self.ids.insert(description.clone(), id);
        id
    }

    /// Add an action with its input and output artifacts.
    pub fn add_action(&mut self, action: Arc<ActionDescription>) -> Result<(), GraphError> {
        let action_id = self.actions.len();
        let mut children: Vec<usize> = Vec::new();
        let mut seen: HashSet<usize> = HashSet::new();
        for input in action.inputs().values() {
            let artifact_id = self.add_artifact(input);
            if seen.insert(artifact_id) {
                children.push(artifact_id);
                self.artifacts[artifact_id].consumers.push(action_id);
            }
        }
        let mut outputs = Vec::new();
        for path in action
            .outputs()
            .iter()
            .chain(action.output_dirs().iter())
        {
            let description = action.output_artifact(path);
            let artifact_id = self.add_artifact(&description);
            let node = &mut self.artifacts[artifact_id];
            if node.builder.is_some() {
                return Err(GraphError::DuplicateBuilder(description.to_string()));
            }
            node.builder = Some(action_id);
            outputs.push(artifact_id);
        }
        self.actions.push(ActionNode {
            description: action,
            children,
            outputs,
            state: TraversalState::default(),
        });
        Ok(())
    }

    /// Initialise the per-action dependency countdowns.
    fn seal(&mut self) {
        for action in &self.actions {
            action
                .state
                .unavailable_deps
                .store(action.children.len(), Ordering::Release);
        }
    }

    /// The node id of an artifact, if it is part of the graph.
    #[must_use]
    pub fn artifact_id(&self, description: &ArtifactDescription) -> Option<usize> {
        self.ids.get(description).copied()
    }

    /// All artifact node ids.
    pub fn artifact_ids(&self) -> impl Iterator<Item = usize> + '_ {
        0..self.artifacts.len()
    }

    #[must_use]
    pub fn artifact(&self, id: usize) -> &ArtifactNode {
        &self.artifacts[id]
    }

    #[must_use]
    pub fn action(&self, id: usize) -> &ActionNode {
        &self.actions[id]
    }

    #[must_use]
    pub fn num_artifacts(&self) -> usize {
        self.artifacts.len()
    }

    #[must_use]
    pub fn num_actions(&self) -> usize {
        self.actions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use quarry_common::HashFunction;

    fn action(cmd: &str, inputs: &[&ArtifactDescription], outs: &[&str]) -> Arc<ActionDescription> {
        let inputs: BTreeMap<String, ArtifactDescription> = inputs
            .iter()
            .enumerate()
            .map(|(i, a)| (format!("in{i}"), (*a).clone()))
            .collect();
        Arc::new(ActionDescription::new(
            HashFunction::Native,
            vec!["sh".into(), "-c".into(), cmd.into()],
            BTreeMap::new(),
            inputs,
            outs.iter().map(ToString::to_string).collect(),
            vec![],
            None,
            false,
            1.0,
            BTreeMap::new(),
        ))
    }

    #[test]
    fn outputs_link_back_to_their_builder() {
        let a = action("echo one > out", &[], &["out"]);
        let graph = DependencyGraph::from_actions([Arc::clone(&a)]).unwrap();
        let out_id = graph.artifact_id(&a.output_artifact("out")).unwrap();
        assert!(graph.artifact(out_id).has_builder_action());
        assert_eq!(graph.num_actions(), 1);
    }

    #[test]
    fn chained_actions_share_artifact_nodes() {
        let first = action("echo > mid", &[], &["mid"]);
        let mid = first.output_artifact("mid");
        let second = action("cat mid > end", &[&mid], &["end"]);
        let graph =
            DependencyGraph::from_actions([Arc::clone(&first), Arc::clone(&second)]).unwrap();
        assert_eq!(graph.num_artifacts(), 2);
        let mid_id = graph.artifact_id(&mid).unwrap();
        assert_eq!(graph.artifact(mid_id).consumers.len(), 1);
    }

    #[test]
    fn duplicate_builders_are_rejected() {
        let a = action("echo a > out", &[], &["out"]);
        // Identical description hashes to the identical action id, so use
        // a differing command with the same output path.
        let b = action("echo b > out", &[], &["out"]);
        // Both claim `out` under their own action ids, which is fine; a
        // conflict needs the same artifact description.
        assert!(DependencyGraph::from_actions([Arc::clone(&a), b]).is_ok());
        let err = DependencyGraph::from_actions([Arc::clone(&a), a]).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateBuilder(_)));
    }
}
