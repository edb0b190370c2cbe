//! Error types of the content-addressed store.

use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, CasError>;

/// Errors raised by the store, the large-object layer and the collector.
#[derive(Error, Debug)]
pub enum CasError {
    /// Bytes do not match the digest the caller announced.
    #[error("invalid argument: expected digest {expected}, computed {computed}")]
    InvalidArgument { expected: String, computed: String },

    /// A stored tree references a child that is not present.
    #[error("tree {tree} violates the tree invariant: missing child {missing}")]
    InvalidTree { tree: String, missing: String },

    /// A part needed for splicing is not in the store.
    #[error("part {0} not found in storage")]
    FileNotFound(String),

    /// Splicing produced bytes that do not hash to the expected digest.
    #[error("splice of {expected} produced {computed}")]
    InvalidResult { expected: String, computed: String },

    /// An entry that should be resident could not be read.
    #[error("object {0} not found in storage")]
    ObjectNotFound(String),

    /// The store directories are unusable.
    #[error("storage IO error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The garbage-collection lock could not be acquired.
    #[error("cannot acquire {mode} lock on {path}")]
    LockUnavailable {
        mode: &'static str,
        path: std::path::PathBuf,
    },

    /// Malformed object or large-object record.
    #[error("corrupt storage entry {id}: {reason}")]
    CorruptEntry { id: String, reason: String },
}

impl CasError {
    pub(crate) fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        CasError::Io {
            path: path.into(),
            source,
        }
    }
}
