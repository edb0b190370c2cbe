//! Error types for object-database access.

use thiserror::Error;

/// Result type for object-database operations.
pub type Result<T> = std::result::Result<T, GitError>;

/// Errors raised by the object-database wrapper.
#[derive(Error, Debug)]
pub enum GitError {
    /// The underlying git operation failed.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),

    /// An id is not a valid object id.
    #[error("`{0}` is not a valid object id")]
    InvalidId(String),

    /// The requested object does not exist.
    #[error("object {0} not found in the database")]
    NotFound(String),

    /// A tree references a symlink whose target escapes the tree.
    #[error("tree {tree} contains upwards symlink `{name}` -> `{target}`")]
    UpwardsSymlink {
        tree: String,
        name: String,
        target: String,
    },

    /// A tree entry carries a mode the tool does not handle.
    #[error("unsupported mode {mode:o} for entry `{name}`")]
    UnsupportedMode { name: String, mode: i32 },

    /// Filesystem access below a repository failed.
    #[error("IO error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GitError {
    pub(crate) fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        GitError::Io {
            path: path.into(),
            source,
        }
    }
}
