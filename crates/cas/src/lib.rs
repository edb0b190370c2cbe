//! Generational content-addressed storage for quarry.
//!
//! The store keeps files, executables and trees per generation with a
//! two-level fanout, transparently stores large objects as chunk
//! sequences and reconstructs them on demand, and reclaims space by
//! rotating whole generations under an inter-process file lock. Reads
//! search newest to oldest and deep-uplink every hit into the newest
//! generation, so a rotation only drops entries nothing touched for a
//! full cycle.

mod chunker;
mod compactify;
mod error;
mod gc;
mod large_object;
mod local_cas;
mod object_cas;
mod tree_ops;

pub use chunker::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, TARGET_CHUNK_SIZE};
pub use compactify::{compactify, CompactificationStats};
pub use error::{CasError, Result};
pub use gc::{FileLock, GarbageCollector, RepositoryGarbageCollector};
pub use local_cas::{generation_dir, LocalCas};
pub use object_cas::{default_exists, ExistsCallback, ObjectCas};
pub use tree_ops::overlay_trees;
