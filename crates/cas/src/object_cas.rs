//! A single typed blob store with a two-level fanout.
//!
//! One `ObjectCas` holds the objects of one type for one generation under
//! `<root>/<hh>/<remaining-hex>`. Writes are first-wins and atomic; reads
//! and presence checks are indirected through an *exists callback* so the
//! generational store can hook a deep uplink in front of every access,
//! while garbage-collection workers install the plain file check.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quarry_common::{Digest, HashFunction, ObjectType};

use crate::error::{CasError, Result};

/// Presence probe invoked before every read and store.
///
/// It promises that a blob for the digest exists at the path when it
/// returns true.
pub type ExistsCallback = Arc<dyn Fn(&Digest, &Path) -> bool + Send + Sync>;

/// The default probe: a plain file check.
#[must_use]
pub fn default_exists() -> ExistsCallback {
    Arc::new(|_digest, path| path.is_file())
}

/// Typed object store of one generation.
pub struct ObjectCas {
    root: PathBuf,
    kind: ObjectType,
    hash_function: HashFunction,
    exists: ExistsCallback,
}

impl ObjectCas {
    /// Create a store rooted at `root` for objects of `kind`.
    pub fn new(
        root: impl Into<PathBuf>,
        kind: ObjectType,
        hash_function: HashFunction,
        exists: ExistsCallback,
    ) -> Self {
        Self {
            root: root.into(),
            kind,
            hash_function,
            exists,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where a digest would live in this store, present or not.
    #[must_use]
    pub fn entry_path(&self, digest: &Digest) -> PathBuf {
        let hash = digest.hash();
        self.root.join(&hash[..2]).join(&hash[2..])
    }

    /// Path to the object if present, applying the exists callback.
    #[must_use]
    pub fn lookup(&self, digest: &Digest) -> Option<PathBuf> {
        let path = self.entry_path(digest);
        if (self.exists)(digest, &path) {
            Some(path)
        } else {
            tracing::trace!(id = %digest.hash(), kind = %self.kind, "object not found");
            None
        }
    }

    /// Presence check without reading.
    #[must_use]
    pub fn contains(&self, digest: &Digest) -> bool {
        self.lookup(digest).is_some()
    }

    /// Store an object from bytes; first write wins.
    pub fn store_bytes(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = self.digest_of_bytes(bytes);
        let path = self.entry_path(&digest);
        if (self.exists)(&digest, &path) {
            return Ok(digest);
        }
        self.write_atomically(&path, bytes)?;
        Ok(digest)
    }

    /// Store an object from a file.
    ///
    /// When the caller asserts ownership of the file a hard link is
    /// attempted first; otherwise, and on filesystems without links, the
    /// content is copied.
    pub fn store_file(&self, file: &Path, is_owner: bool) -> Result<Digest> {
        let digest = self
            .hash_function
            .hash_file(file, self.kind.is_tree())
            .map_err(|e| CasError::CorruptEntry {
                id: file.display().to_string(),
                reason: e.to_string(),
            })?;
        let path = self.entry_path(&digest);
        if (self.exists)(&digest, &path) {
            return Ok(digest);
        }
        self.ensure_parent(&path)?;
        if is_owner && fs::hard_link(file, &path).is_ok() {
            self.set_permissions(&path)?;
            return Ok(digest);
        }
        let bytes = fs::read(file).map_err(|e| CasError::io(file, e))?;
        self.write_atomically(&path, &bytes)?;
        Ok(digest)
    }

    fn digest_of_bytes(&self, bytes: &[u8]) -> Digest {
        if self.kind.is_tree() {
            self.hash_function.hash_tree(bytes)
        } else {
            self.hash_function.hash_blob(bytes)
        }
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CasError::io(parent, e))?;
        }
        Ok(())
    }

    fn write_atomically(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        self.ensure_parent(path)?;
        let tmp = path.with_extension(format!("tmp{}", std::process::id()));
        let mut file = fs::File::create(&tmp).map_err(|e| CasError::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| CasError::io(&tmp, e))?;
        file.sync_all().map_err(|e| CasError::io(&tmp, e))?;
        drop(file);
        fs::rename(&tmp, path).map_err(|e| CasError::io(path, e))?;
        self.set_permissions(path)
    }

    #[cfg(unix)]
    fn set_permissions(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let mode = if self.kind.is_executable() { 0o555 } else { 0o444 };
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| CasError::io(path, e))
    }

    #[cfg(not(unix))]
    fn set_permissions(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn store_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cas = ObjectCas::new(
            dir.path(),
            ObjectType::File,
            HashFunction::Native,
            default_exists(),
        );
        let digest = cas.store_bytes(b"content").unwrap();
        let path = cas.lookup(&digest).unwrap();
        assert_eq!(fs::read(path).unwrap(), b"content");
        // Two-level fanout.
        let entry = cas.entry_path(&digest);
        assert!(entry.strip_prefix(dir.path()).unwrap().components().count() == 2);
    }

    #[test]
    fn first_write_wins_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cas = ObjectCas::new(
            dir.path(),
            ObjectType::File,
            HashFunction::Native,
            default_exists(),
        );
        let a = cas.store_bytes(b"same").unwrap();
        let b = cas.store_bytes(b"same").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exists_callback_sees_every_access() {
        let dir = tempfile::tempdir().unwrap();
        let probes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&probes);
        let exists: ExistsCallback = Arc::new(move |_digest, path: &Path| {
            counter.fetch_add(1, Ordering::SeqCst);
            path.is_file()
        });
        let cas = ObjectCas::new(dir.path(), ObjectType::File, HashFunction::Native, exists);
        let digest = cas.store_bytes(b"probe me").unwrap();
        assert!(cas.contains(&digest));
        let _ = cas.lookup(&digest);
        assert!(probes.load(Ordering::SeqCst) >= 3);
    }

    #[cfg(unix)]
    #[test]
    fn executables_carry_the_x_bit() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let cas = ObjectCas::new(
            dir.path(),
            ObjectType::Executable,
            HashFunction::Native,
            default_exists(),
        );
        let digest = cas.store_bytes(b"#!/bin/sh\n").unwrap();
        let path = cas.lookup(&digest).unwrap();
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn store_from_owned_file() {
        let dir = tempfile::tempdir().unwrap();
        let cas = ObjectCas::new(
            dir.path(),
            ObjectType::File,
            HashFunction::Compatible,
            default_exists(),
        );
        let src = dir.path().join("incoming");
        fs::write(&src, b"file payload").unwrap();
        let digest = cas.store_file(&src, true).unwrap();
        assert_eq!(digest, HashFunction::Compatible.hash_blob(b"file payload"));
        assert!(cas.contains(&digest));
    }
}
