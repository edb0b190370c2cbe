//! The immutable result of analysing a configured target.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use quarry_common::{ActionDescription, ArtifactDescription, HashFunction};
use quarry_expr::TargetResult;

use crate::configured_target::ConfiguredTarget;

/// A tree staged by the analysis engine.
///
/// The identifier is the content hash of the canonical rendering of the
/// path-to-artifact map; the builder materialises the tree when the
/// referenced artifacts are available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedTree {
    id: String,
    content: BTreeMap<String, ArtifactDescription>,
}

impl StagedTree {
    #[must_use]
    pub fn new(hash_function: HashFunction, content: BTreeMap<String, ArtifactDescription>) -> Self {
        let rendered = serde_json::Value::Object(
            content
                .iter()
                .map(|(path, artifact)| (path.clone(), artifact.to_json()))
                .collect(),
        )
        .to_string();
        let id = hash_function.hash_blob(rendered.as_bytes()).hash().to_string();
        Self { id, content }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn content(&self) -> &BTreeMap<String, ArtifactDescription> {
        &self.content
    }

    /// The artifact referencing this staged tree.
    #[must_use]
    pub fn artifact(&self) -> ArtifactDescription {
        ArtifactDescription::Tree {
            tree_id: self.id.clone(),
        }
    }
}

/// Dependency structure of an analysed target, for reporting and graph
/// dumps.
///
/// Only configured-target *keys* are stored, never the analysed results
/// themselves; the result map owns those, so the target graph stays free
/// of reference cycles.
#[derive(Debug, Clone, Default)]
pub struct TargetGraphInformation {
    /// The node itself, under its effective configuration.
    pub node: Option<ConfiguredTarget>,
    pub direct: Vec<ConfiguredTarget>,
    pub implicit: Vec<ConfiguredTarget>,
    pub anonymous: Vec<ConfiguredTarget>,
}

impl TargetGraphInformation {
    #[must_use]
    pub fn new(node: ConfiguredTarget, direct: Vec<ConfiguredTarget>) -> Self {
        Self {
            node: Some(node),
            direct,
            implicit: Vec::new(),
            anonymous: Vec::new(),
        }
    }

    /// JSON of the dependency lists, for the configured-target graph.
    #[must_use]
    pub fn deps_to_json(&self) -> serde_json::Value {
        let render = |deps: &[ConfiguredTarget]| -> Vec<String> {
            let mut rendered: Vec<String> = deps.iter().map(ToString::to_string).collect();
            rendered.sort();
            rendered.dedup();
            rendered
        };
        serde_json::json!({
            "declared": render(&self.direct),
            "implicit": render(&self.implicit),
            "anonymous": render(&self.anonymous),
        })
    }
}

/// The analysed target.
#[derive(Debug, Clone, Default)]
pub struct AnalysedTarget {
    /// Artifact stage, runfiles and provides.
    pub result: TargetResult,
    /// Actions this target contributes to the action graph.
    pub actions: Vec<Arc<ActionDescription>>,
    /// Raw blob strings the builder must make available.
    pub blobs: Vec<String>,
    /// Trees staged by this target.
    pub trees: Vec<Arc<StagedTree>>,
    /// The variables the analysis actually consumed, closed under
    /// dependencies. Pruning the incoming configuration to this set gives
    /// the caching granularity.
    pub vars: BTreeSet<String>,
    /// Taint labels; must contain every label of every dependency.
    pub tainted: BTreeSet<String>,
    /// Reporting-only dependency information.
    pub graph_info: TargetGraphInformation,
}

impl AnalysedTarget {
    #[must_use]
    pub fn artifacts(&self) -> &BTreeMap<String, ArtifactDescription> {
        &self.result.artifact_stage
    }

    #[must_use]
    pub fn runfiles(&self) -> &BTreeMap<String, ArtifactDescription> {
        &self.result.runfiles
    }
}
