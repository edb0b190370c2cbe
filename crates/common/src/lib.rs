//! Shared object model and bookkeeping for the quarry build tool.
//!
//! This crate holds everything the other quarry crates agree on: digests and
//! the hash-function selector, the object-type enumeration, the canonical
//! tree codec, artifact and action descriptions, entity names, and the
//! counters the progress reporter prints.

mod action;
mod artifact;
mod digest;
mod entity;
mod error;
mod object_type;
mod paths;
mod progress;
mod statistics;
mod tree;

pub use action::{ActionDescription, ActionIdentifier};
pub use artifact::ArtifactDescription;
pub use digest::{Digest, HashFunction};
pub use entity::EntityName;
pub use error::{CommonError, Result};
pub use object_type::ObjectType;
pub use paths::{is_non_upwards, normalize};
pub use progress::{ProgressReporter, ReporterHandle};
pub use statistics::{Statistics, TaskTracker};
pub use tree::{decode_tree, encode_tree, tree_entry_spans, TreeEntry};
