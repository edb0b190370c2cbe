//! Artifact descriptions.
//!
//! An artifact names a piece of content by how it comes into existence: a
//! path in a repository workspace, an object already known to the store,
//! the output of an action, or a staged tree. Artifacts are first-class
//! values; staging maps compare them structurally.

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::object_type::ObjectType;

/// Identifier of an action, the hex hash of its canonical description.
pub type ActionIdentifier = String;

/// Description of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ArtifactDescription {
    /// A source file at `path` inside the workspace root of `repository`.
    #[serde(rename = "LOCAL")]
    Local { repository: String, path: String },

    /// An object already present in the content-addressed store.
    #[serde(rename = "KNOWN")]
    Known {
        digest: Digest,
        object_type: ObjectType,
    },

    /// The output at logical `path` of the action with the given id.
    #[serde(rename = "ACTION")]
    Action { action_id: ActionIdentifier, path: String },

    /// A tree staged by the analysis engine, referenced by its stage id.
    #[serde(rename = "TREE")]
    Tree { tree_id: String },
}

impl ArtifactDescription {
    /// Stable JSON rendering used in the action-graph dump.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Whether this artifact is produced by an action.
    #[must_use]
    pub const fn is_action_output(&self) -> bool {
        matches!(self, ArtifactDescription::Action { .. })
    }
}

impl std::fmt::Display for ArtifactDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactDescription::Local { repository, path } => {
                write!(f, "[{repository}]{path}")
            }
            ArtifactDescription::Known {
                digest,
                object_type,
            } => write!(f, "{digest}[{object_type}]"),
            ArtifactDescription::Action { action_id, path } => {
                write!(f, "#{action_id}:{path}")
            }
            ArtifactDescription::Tree { tree_id } => write!(f, "tree:{tree_id}"),
        }
    }
}
