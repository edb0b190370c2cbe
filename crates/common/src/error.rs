//! Error types shared by the object model.

use thiserror::Error;

/// Result type for object-model operations.
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by digest construction and the tree codec.
#[derive(Error, Debug)]
pub enum CommonError {
    /// A hex string is not a valid digest for any supported hash.
    #[error("`{0}` is not a valid digest")]
    InvalidDigest(String),

    /// Raw bytes do not parse as a canonical tree object.
    #[error("not a valid tree object: {0}")]
    InvalidTree(String),

    /// A tree entry carries an unsupported mode.
    #[error("`{0}` is not a valid tree entry mode")]
    InvalidEntryMode(String),

    /// A symlink target escapes its parent directory.
    #[error("symlink target `{0}` is not non-upwards")]
    UpwardsSymlink(String),

    /// An entity name could not be parsed.
    #[error("`{0}` is not a valid target reference")]
    InvalidEntityName(String),

    /// I/O error while hashing file content.
    #[error("IO error while hashing {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}
