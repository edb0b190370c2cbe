//! Immutable action descriptions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use crate::artifact::ActionIdentifier;
use crate::artifact::ArtifactDescription;
use crate::digest::HashFunction;

/// A reproducible command, identified by the hash of its fields.
///
/// Actions are immutable once constructed; the identifier is computed over
/// the canonical JSON of every field, so two actions with equal fields are
/// the same action everywhere in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescription {
    id: ActionIdentifier,
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    inputs: BTreeMap<String, ArtifactDescription>,
    outputs: Vec<String>,
    output_dirs: Vec<String>,
    may_fail: Option<String>,
    no_cache: bool,
    timeout_scale: f64,
    execution_properties: BTreeMap<String, String>,
}

impl ActionDescription {
    pub fn new(
        hash_function: HashFunction,
        argv: Vec<String>,
        env: BTreeMap<String, String>,
        inputs: BTreeMap<String, ArtifactDescription>,
        outputs: Vec<String>,
        output_dirs: Vec<String>,
        may_fail: Option<String>,
        no_cache: bool,
        timeout_scale: f64,
        execution_properties: BTreeMap<String, String>,
    ) -> Self {
        let fields = serde_json::json!({
            "command": argv,
            "env": env,
            "inputs": inputs,
            "outputs": outputs,
            "output_dirs": output_dirs,
            "may_fail": may_fail,
            "no_cache": no_cache,
            "timeout_scale": timeout_scale,
            "execution_properties": execution_properties,
        });
        let canonical = fields.to_string();
        let id = hash_function.hash_blob(canonical.as_bytes()).hash().to_string();
        Self {
            id,
            argv,
            env,
            inputs,
            outputs,
            output_dirs,
            may_fail,
            no_cache,
            timeout_scale,
            execution_properties,
        }
    }

    #[must_use]
    pub fn id(&self) -> &ActionIdentifier {
        &self.id
    }

    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    #[must_use]
    pub fn inputs(&self) -> &BTreeMap<String, ArtifactDescription> {
        &self.inputs
    }

    #[must_use]
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    #[must_use]
    pub fn output_dirs(&self) -> &[String] {
        &self.output_dirs
    }

    #[must_use]
    pub fn may_fail(&self) -> Option<&str> {
        self.may_fail.as_deref()
    }

    #[must_use]
    pub const fn no_cache(&self) -> bool {
        self.no_cache
    }

    #[must_use]
    pub const fn timeout_scale(&self) -> f64 {
        self.timeout_scale
    }

    #[must_use]
    pub fn execution_properties(&self) -> &BTreeMap<String, String> {
        &self.execution_properties
    }

    /// The artifact produced at one of this action's declared output paths.
    #[must_use]
    pub fn output_artifact(&self, path: &str) -> ArtifactDescription {
        ArtifactDescription::Action {
            action_id: self.id.clone(),
            path: path.to_string(),
        }
    }

    /// JSON entry for the action-graph dump, without the identifier key.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let inputs: BTreeMap<&String, serde_json::Value> = self
            .inputs
            .iter()
            .map(|(path, artifact)| (path, artifact.to_json()))
            .collect();
        serde_json::json!({
            "command": self.argv,
            "env": self.env,
            "inputs": inputs,
            "outputs": self.outputs,
            "output_dirs": self.output_dirs,
            "may_fail": self.may_fail,
            "no_cache": self.no_cache,
            "timeout_scale": self.timeout_scale,
            "execution_properties": self.execution_properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(argv: &[&str]) -> ActionDescription {
        ActionDescription::new(
            HashFunction::Native,
            argv.iter().map(ToString::to_string).collect(),
            BTreeMap::new(),
            BTreeMap::new(),
            vec!["out.txt".to_string()],
            vec![],
            None,
            false,
            1.0,
            BTreeMap::new(),
        )
    }

    #[test]
    fn identifier_is_content_addressed() {
        let a = action(&["sh", "-c", "echo hi > out.txt"]);
        let b = action(&["sh", "-c", "echo hi > out.txt"]);
        let c = action(&["sh", "-c", "echo ho > out.txt"]);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn output_artifact_points_back() {
        let a = action(&["true"]);
        match a.output_artifact("out.txt") {
            ArtifactDescription::Action { action_id, path } => {
                assert_eq!(&action_id, a.id());
                assert_eq!(path, "out.txt");
            }
            other => panic!("unexpected artifact {other:?}"),
        }
    }
}
