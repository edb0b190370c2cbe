//! Git object-database access for quarry.
//!
//! Content-fixed repository roots live in git: source trees are addressed
//! by tree id, and computed roots are materialised by committing a staged
//! directory into the object database. This crate wraps the operations
//! the rest of the tool needs: reading tree entries, writing shallow
//! trees, committing directories, keep-tagging, fetching from a local
//! path, and resolving an object under a path inside a tree.
//!
//! A handle owns its repository and is not `Sync`: parallel readers open
//! their own handles onto the same object database, and mutating
//! operations (commit, tag, fetch) are serialised by a process-wide mutex
//! owned by the caller.

mod error;
mod odb;

pub use error::{GitError, Result};
pub use odb::{non_upwards_symlinks_check, GitOdb, ObjectInfo, SymlinksCheck};
