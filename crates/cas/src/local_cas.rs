//! The generational content-addressed store.
//!
//! A [`LocalCas`] spans `num_generations` on-disk generations
//! `gen-0 .. gen-(N-1)`, each holding a file store `f`, an executable
//! store `x`, a tree store `t` (aliased to `f` in compatible mode) and the
//! large-object record stores `-large-f` and `-large-t`. Reads search
//! newest to oldest; any hit in an older generation deep-uplinks the
//! object (for trees including all descendants) into generation 0 through
//! the exists callback installed on the generation-0 stores.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use quarry_common::{decode_tree, Digest, HashFunction, ObjectType};

use crate::chunker;
use crate::error::{CasError, Result};
use crate::large_object::LargeObjectCas;
use crate::object_cas::{default_exists, ExistsCallback, ObjectCas};

/// Directory name of generation `index`.
#[must_use]
pub fn generation_dir(root: &Path, index: usize) -> PathBuf {
    root.join(format!("gen-{index}"))
}

/// The stores of one generation, with plain presence checks.
pub(crate) struct Generation {
    pub(crate) file: ObjectCas,
    pub(crate) exec: ObjectCas,
    pub(crate) tree: ObjectCas,
    pub(crate) large_file: LargeObjectCas,
    pub(crate) large_tree: LargeObjectCas,
}

impl Generation {
    fn new(root: &Path, hash_function: HashFunction) -> Self {
        Self::with_callbacks(
            root,
            hash_function,
            default_exists(),
            default_exists(),
            default_exists(),
        )
    }

    fn with_callbacks(
        root: &Path,
        hash_function: HashFunction,
        file_exists: ExistsCallback,
        exec_exists: ExistsCallback,
        tree_exists: ExistsCallback,
    ) -> Self {
        // In compatible mode the tree store is an alias of the file store.
        let tree_dir = if hash_function.is_native() { "t" } else { "f" };
        Self {
            file: ObjectCas::new(root.join("f"), ObjectType::File, hash_function, file_exists),
            exec: ObjectCas::new(
                root.join("x"),
                ObjectType::Executable,
                hash_function,
                exec_exists,
            ),
            tree: ObjectCas::new(
                root.join(tree_dir),
                ObjectType::Tree,
                hash_function,
                tree_exists,
            ),
            large_file: LargeObjectCas::new(root.join("-large-f")),
            large_tree: LargeObjectCas::new(root.join("-large-t")),
        }
    }

    pub(crate) fn store(&self, kind: ObjectType) -> &ObjectCas {
        match kind {
            ObjectType::Executable => &self.exec,
            ObjectType::Tree => &self.tree,
            _ => &self.file,
        }
    }

    pub(crate) fn large(&self, is_tree: bool) -> &LargeObjectCas {
        if is_tree {
            &self.large_tree
        } else {
            &self.large_file
        }
    }
}

struct CasInner {
    root: PathBuf,
    hash_function: HashFunction,
    /// Generation 0 with uplinking exists callbacks; the external surface.
    live: Generation,
    /// All generations with plain callbacks, newest first. Used by the
    /// uplink itself and by GC workers.
    plain: Vec<Generation>,
}

/// The generational store.
#[derive(Clone)]
pub struct LocalCas {
    inner: Arc<CasInner>,
}

impl LocalCas {
    /// Open (creating directories lazily) a store with the given number of
    /// generations.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, num_generations: usize, hash_function: HashFunction) -> Self {
        let root = root.into();
        let num_generations = num_generations.max(1);
        let inner = Arc::new_cyclic(|weak: &Weak<CasInner>| {
            let gen0 = generation_dir(&root, 0);
            let blob_uplink = |kind: ObjectType, weak: &Weak<CasInner>| -> ExistsCallback {
                let weak = weak.clone();
                Arc::new(move |digest: &Digest, path: &Path| {
                    if path.is_file() {
                        return true;
                    }
                    let Some(inner) = weak.upgrade() else {
                        return false;
                    };
                    uplink_blob(&inner, digest, kind) && path.is_file()
                })
            };
            let tree_uplink: ExistsCallback = {
                let weak = weak.clone();
                Arc::new(move |digest: &Digest, path: &Path| {
                    if path.is_file() {
                        return true;
                    }
                    let Some(inner) = weak.upgrade() else {
                        return false;
                    };
                    uplink_tree(&inner, digest) && path.is_file()
                })
            };
            let live = Generation::with_callbacks(
                &gen0,
                hash_function,
                blob_uplink(ObjectType::File, weak),
                blob_uplink(ObjectType::Executable, weak),
                tree_uplink,
            );
            let plain = (0..num_generations)
                .map(|i| Generation::new(&generation_dir(&root, i), hash_function))
                .collect();
            CasInner {
                root,
                hash_function,
                live,
                plain,
            }
        });
        Self { inner }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    #[must_use]
    pub fn hash_function(&self) -> HashFunction {
        self.inner.hash_function
    }

    #[must_use]
    pub fn num_generations(&self) -> usize {
        self.inner.plain.len()
    }

    /// Store a blob from bytes.
    pub fn store_blob(&self, bytes: &[u8], executable: bool) -> Result<Digest> {
        let kind = if executable {
            ObjectType::Executable
        } else {
            ObjectType::File
        };
        self.inner.live.store(kind).store_bytes(bytes)
    }

    /// Store a blob from a file, hard-linking when owned.
    pub fn store_blob_from_file(
        &self,
        file: &Path,
        executable: bool,
        is_owner: bool,
    ) -> Result<Digest> {
        let kind = if executable {
            ObjectType::Executable
        } else {
            ObjectType::File
        };
        self.inner.live.store(kind).store_file(file, is_owner)
    }

    /// Store a tree object from its canonical bytes.
    pub fn store_tree(&self, bytes: &[u8]) -> Result<Digest> {
        self.inner.live.tree.store_bytes(bytes)
    }

    /// Store a tree object from a file holding its canonical bytes.
    pub fn store_tree_from_file(&self, file: &Path, is_owner: bool) -> Result<Digest> {
        self.inner.live.tree.store_file(file, is_owner)
    }

    /// Store bytes a caller announced a digest for, e.g. from the network.
    ///
    /// Fails with `InvalidArgument` when the computed digest differs, and
    /// enforces the tree invariant for received trees.
    pub fn store_checked(
        &self,
        expected: &Digest,
        bytes: &[u8],
        executable: bool,
    ) -> Result<Digest> {
        if expected.is_tree() && self.inner.hash_function.is_native() {
            self.check_tree_invariant(expected, bytes)?;
        }
        let computed = if expected.is_tree() {
            self.store_tree(bytes)?
        } else {
            self.store_blob(bytes, executable)?
        };
        let size_mismatch = expected.size() != 0 && expected.size() != computed.size();
        if computed != *expected || size_mismatch {
            return Err(CasError::InvalidArgument {
                expected: format!("{expected}"),
                computed: format!("{computed}"),
            });
        }
        Ok(computed)
    }

    /// Path of a blob, searching all generations and uplinking on a hit.
    ///
    /// A lookup that finds the blob only under the other permission
    /// variant copies the content into the requested store. If only a
    /// large-object record exists the blob is spliced implicitly.
    #[must_use]
    pub fn blob_path(&self, digest: &Digest, executable: bool) -> Option<PathBuf> {
        let (kind, other) = if executable {
            (ObjectType::Executable, ObjectType::File)
        } else {
            (ObjectType::File, ObjectType::Executable)
        };
        if let Some(path) = self.inner.live.store(kind).lookup(digest) {
            return Some(path);
        }
        // Permission-variant sync: any generation may hold the content
        // under the other variant.
        for generation in &self.inner.plain {
            if let Some(path) = generation.store(other).lookup(digest) {
                let bytes = fs::read(&path).ok()?;
                return self
                    .inner
                    .plain[0]
                    .store(kind)
                    .store_bytes(&bytes)
                    .ok()
                    .map(|d| self.inner.plain[0].store(kind).entry_path(&d));
            }
        }
        // Only the parts may be resident; splice implicitly.
        if let Some(parts) = self.read_large_entry(digest).ok().flatten() {
            return self.splice(digest, &parts, executable).ok().map(|d| {
                self.inner.plain[0]
                    .store(kind)
                    .entry_path(&d)
            });
        }
        None
    }

    /// Path of a tree object, uplinking it and its descendants on a hit.
    #[must_use]
    pub fn tree_path(&self, digest: &Digest) -> Option<PathBuf> {
        if let Some(path) = self.inner.live.tree.lookup(digest) {
            return Some(path);
        }
        if let Some(parts) = self.read_large_entry(digest).ok().flatten() {
            return self
                .splice(digest, &parts, false)
                .ok()
                .map(|d| self.inner.plain[0].tree.entry_path(&d));
        }
        None
    }

    /// Assert that every entry a tree references is present.
    pub fn check_tree_invariant(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        if !self.inner.hash_function.is_native() {
            // Compatible tree digests are indistinguishable from blobs; the
            // invariant is only enforced where the distinction exists.
            return Ok(());
        }
        let entries = decode_tree(bytes, self.inner.hash_function.hash_len()).map_err(|e| {
            CasError::CorruptEntry {
                id: digest.hash().to_string(),
                reason: e.to_string(),
            }
        })?;
        for entry in entries {
            let child = Digest::new(entry.hash_hex(), 0, entry.object_type.is_tree())
                .map_err(|e| CasError::CorruptEntry {
                    id: digest.hash().to_string(),
                    reason: e.to_string(),
                })?;
            let present = match entry.object_type {
                ObjectType::Tree => self.tree_path(&child).is_some(),
                ObjectType::Executable => self.blob_path(&child, true).is_some(),
                _ => self.blob_path(&child, false).is_some(),
            };
            if !present {
                return Err(CasError::InvalidTree {
                    tree: digest.hash().to_string(),
                    missing: format!("{}:{}", entry.name, entry.hash_hex()),
                });
            }
        }
        Ok(())
    }

    /// Split an object into parts, recording the parts list.
    ///
    /// Trees split at entry boundaries, blobs by content-defined chunking.
    /// The parts list is stable: repeated calls return the recorded list
    /// without re-reading the object.
    pub fn split(&self, digest: &Digest) -> Result<Vec<Digest>> {
        if let Some(parts) = self.read_large_entry(digest)? {
            return Ok(parts);
        }
        let path = if digest.is_tree() {
            self.tree_path(digest)
        } else {
            self.blob_path(digest, false)
        };
        let Some(path) = path else {
            return Err(CasError::FileNotFound(digest.hash().to_string()));
        };
        let bytes = fs::read(&path).map_err(|e| CasError::io(&path, e))?;
        let file_store = &self.inner.live.file;
        let mut parts = Vec::new();
        if digest.is_tree() && self.inner.hash_function.is_native() {
            let spans =
                quarry_common::tree_entry_spans(&bytes, self.inner.hash_function.hash_len())
                    .map_err(|e| CasError::CorruptEntry {
                        id: digest.hash().to_string(),
                        reason: e.to_string(),
                    })?;
            for span in spans {
                parts.push(file_store.store_bytes(&bytes[span])?);
            }
        } else {
            for chunk in chunker::chunk(&bytes) {
                parts.push(file_store.store_bytes(chunk)?);
            }
        }
        if parts.len() == 1 {
            return Ok(parts);
        }
        self.inner
            .plain[0]
            .large(digest.is_tree())
            .write_entry(digest, &parts)?;
        tracing::debug!(id = %digest.hash(), parts = parts.len(), "split large object");
        Ok(parts)
    }

    /// Splice an object from its parts and store it.
    pub fn splice(&self, digest: &Digest, parts: &[Digest], executable: bool) -> Result<Digest> {
        let mut bytes = Vec::with_capacity(parts.iter().map(|p| p.size() as usize).sum());
        for part in parts {
            let Some(path) = self.blob_path(part, false) else {
                return Err(CasError::FileNotFound(part.hash().to_string()));
            };
            let chunk = fs::read(&path).map_err(|e| CasError::io(&path, e))?;
            bytes.extend_from_slice(&chunk);
        }
        let computed = if digest.is_tree() {
            self.inner.hash_function.hash_tree(&bytes)
        } else {
            self.inner.hash_function.hash_blob(&bytes)
        };
        if computed != *digest {
            return Err(CasError::InvalidResult {
                expected: format!("{digest}"),
                computed: format!("{computed}"),
            });
        }
        if digest.is_tree() {
            self.check_tree_invariant(digest, &bytes)?;
            self.store_tree(&bytes)
        } else {
            self.store_blob(&bytes, executable)
        }
    }

    /// The recorded parts of a large object, searching all generations.
    pub(crate) fn read_large_entry(&self, digest: &Digest) -> Result<Option<Vec<Digest>>> {
        for (index, generation) in self.inner.plain.iter().enumerate() {
            if let Some(parts) = generation.large(digest.is_tree()).read_entry(digest)? {
                if index > 0 {
                    self.inner
                        .plain[0]
                        .large(digest.is_tree())
                        .write_entry(digest, &parts)?;
                }
                return Ok(Some(parts));
            }
        }
        Ok(None)
    }

    /// Single-generation view with plain callbacks, for the collector and
    /// the compactifier.
    pub(crate) fn generation(&self, index: usize) -> &Generation {
        &self.inner.plain[index]
    }
}

/// Copy a blob found in an older generation into generation 0.
fn uplink_blob(inner: &CasInner, digest: &Digest, kind: ObjectType) -> bool {
    for generation in inner.plain.iter().skip(1) {
        if let Some(path) = generation.store(kind).lookup(digest) {
            let Ok(bytes) = fs::read(&path) else {
                return false;
            };
            return inner.plain[0].store(kind).store_bytes(&bytes).is_ok();
        }
    }
    false
}

/// Deep-copy a tree and all its descendants into generation 0.
fn uplink_tree(inner: &CasInner, digest: &Digest) -> bool {
    if inner.plain[0].tree.contains(digest) {
        return true;
    }
    let Some(path) = inner
        .plain
        .iter()
        .skip(1)
        .find_map(|g| g.tree.lookup(digest))
    else {
        return false;
    };
    let Ok(bytes) = fs::read(&path) else {
        return false;
    };
    let Ok(entries) = decode_tree(&bytes, inner.hash_function.hash_len()) else {
        return false;
    };
    for entry in entries {
        let Ok(child) = Digest::new(entry.hash_hex(), 0, entry.object_type.is_tree()) else {
            return false;
        };
        let ok = match entry.object_type {
            ObjectType::Tree => uplink_tree(inner, &child),
            ObjectType::Executable => {
                inner.plain[0].exec.contains(&child)
                    || uplink_blob(inner, &child, ObjectType::Executable)
            }
            _ => {
                inner.plain[0].file.contains(&child) || uplink_blob(inner, &child, ObjectType::File)
            }
        };
        if !ok {
            tracing::warn!(
                tree = %digest.hash(),
                child = %entry.name,
                "tree uplink failed for child"
            );
            return false;
        }
    }
    inner.plain[0].tree.store_bytes(&bytes).is_ok()
}
