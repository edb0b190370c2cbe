//! Traversal of the artifact/action dependency graph.
//!
//! The graph is an arena of artifact and action nodes built from action
//! descriptions; the only mutable parts are the per-node atomic traversal
//! states. The traverser marks everything reachable from the requested
//! artifacts as required, visits nodes at most once, and hands ready
//! nodes to the executor in parallel, waking parent actions as their last
//! dependency lands. Any executor failure sets the shared abort flag and
//! shuts the task system down.

mod graph;
mod traverse;

pub use graph::{ActionNode, ArtifactNode, DependencyGraph, GraphError};
pub use traverse::{traverse, Executor};
