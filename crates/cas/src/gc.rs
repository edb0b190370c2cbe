//! Generational garbage collection.
//!
//! The collector never inspects individual entries: reclaiming space is a
//! rotation of whole generations. Readers and writers hold a shared lock
//! on the store's lock file; the rotation itself takes it exclusively,
//! renames `gen-(N-1)` to `remove-me-<pid>`, shifts every younger
//! generation up by one, and deletes the renamed directory afterwards
//! under a fresh shared lock. Anything in use keeps being uplinked into
//! generation 0 by ordinary reads, so a rotation only drops what nobody
//! touched for a full cycle.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CasError, Result};
use crate::local_cas::generation_dir;

/// A held advisory lock on a lock file.
///
/// Dropping the guard releases the lock by closing the descriptor.
pub struct FileLock {
    _file: fs::File,
    path: PathBuf,
    shared: bool,
}

impl FileLock {
    /// Acquire the lock, blocking until it is granted.
    ///
    /// Missing parent directories are created.
    pub fn acquire(path: &Path, shared: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CasError::io(parent, e))?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| CasError::io(path, e))?;
        Self::flock(&file, shared).map_err(|_| CasError::LockUnavailable {
            mode: if shared { "shared" } else { "exclusive" },
            path: path.to_path_buf(),
        })?;
        tracing::debug!(path = %path.display(), shared, "lock acquired");
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
            shared,
        })
    }

    #[cfg(unix)]
    #[allow(unsafe_code)]
    fn flock(file: &fs::File, shared: bool) -> std::io::Result<()> {
        use std::os::unix::io::AsRawFd;
        let operation = if shared { libc::LOCK_SH } else { libc::LOCK_EX };
        // SAFETY: flock on a valid, owned file descriptor.
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn flock(_file: &fs::File, _shared: bool) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), shared = self.shared, "lock released");
    }
}

/// Rotates the generations of a store.
pub struct GarbageCollector;

impl GarbageCollector {
    /// Path of the lock file inside a store root.
    #[must_use]
    pub fn lock_file(root: &Path) -> PathBuf {
        root.join("gc.lock")
    }

    /// Shared lock for readers and writers that do not rotate.
    pub fn shared_lock(root: &Path) -> Result<FileLock> {
        FileLock::acquire(&Self::lock_file(root), true)
    }

    /// Exclusive lock for the rotation.
    pub fn exclusive_lock(root: &Path) -> Result<FileLock> {
        FileLock::acquire(&Self::lock_file(root), false)
    }

    /// Rotate the generations of the store at `root`.
    pub fn trigger(root: &Path, num_generations: usize) -> Result<()> {
        let num_generations = num_generations.max(1);
        {
            let _shared = Self::shared_lock(root)?;
            Self::remove_stale_leftovers(root)?;
        }
        let doomed = root.join(format!("remove-me-{}", std::process::id()));
        {
            let _exclusive = Self::exclusive_lock(root)?;
            let oldest = generation_dir(root, num_generations - 1);
            if oldest.is_dir() {
                fs::rename(&oldest, &doomed).map_err(|e| CasError::io(&oldest, e))?;
            }
            for index in (1..num_generations).rev() {
                let from = generation_dir(root, index - 1);
                let to = generation_dir(root, index);
                if from.is_dir() {
                    fs::rename(&from, &to).map_err(|e| CasError::io(&from, e))?;
                }
            }
            tracing::info!(root = %root.display(), "rotated {num_generations} generations");
        }
        let _shared = Self::shared_lock(root)?;
        if doomed.is_dir() {
            fs::remove_dir_all(&doomed).map_err(|e| CasError::io(&doomed, e))?;
        }
        Ok(())
    }

    /// Remove `remove-me-*` directories a crashed rotation left behind.
    fn remove_stale_leftovers(root: &Path) -> Result<()> {
        if !root.is_dir() {
            return Ok(());
        }
        let entries = fs::read_dir(root).map_err(|e| CasError::io(root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| CasError::io(root, e))?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("remove-me-") && entry.path().is_dir() {
                tracing::warn!(path = %entry.path().display(), "removing stale rotation leftover");
                fs::remove_dir_all(entry.path()).map_err(|e| CasError::io(entry.path(), e))?;
            }
        }
        Ok(())
    }
}

/// Rotation of the computed-root repository clones.
///
/// The clones directory next to the object store uses the same
/// two-lock rotation protocol as the store itself.
pub struct RepositoryGarbageCollector;

impl RepositoryGarbageCollector {
    /// Number of generations kept for repository clones.
    pub const NUM_GENERATIONS: usize = 2;

    /// Rotate the repository-clone generations at `root`.
    pub fn trigger(root: &Path) -> Result<()> {
        GarbageCollector::trigger(root, Self::NUM_GENERATIONS)
    }

    /// Shared lock held while clones are in use.
    pub fn shared_lock(root: &Path) -> Result<FileLock> {
        GarbageCollector::shared_lock(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_shifts_generations() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for i in 0..3 {
            fs::create_dir_all(generation_dir(root, i)).unwrap();
            fs::write(generation_dir(root, i).join("marker"), format!("{i}")).unwrap();
        }
        GarbageCollector::trigger(root, 3).unwrap();
        // gen-0 rotated away; old gen-0 content now in gen-1.
        assert!(!generation_dir(root, 0).exists());
        assert_eq!(
            fs::read_to_string(generation_dir(root, 1).join("marker")).unwrap(),
            "0"
        );
        assert_eq!(
            fs::read_to_string(generation_dir(root, 2).join("marker")).unwrap(),
            "1"
        );
        // The rotated-off oldest generation is gone.
        assert!(fs::read_dir(root)
            .unwrap()
            .filter_map(std::result::Result::ok)
            .all(|e| !e.file_name().to_string_lossy().starts_with("remove-me-")));
    }

    #[test]
    fn repeated_rotation_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(generation_dir(root, 0)).unwrap();
        fs::write(generation_dir(root, 0).join("marker"), "original").unwrap();
        GarbageCollector::trigger(root, 2).unwrap();
        assert!(generation_dir(root, 1).join("marker").is_file());
        GarbageCollector::trigger(root, 2).unwrap();
        assert!(!generation_dir(root, 1).exists());
        assert!(!generation_dir(root, 0).exists());
    }

    #[test]
    fn locks_are_reentrant_across_processes_in_shared_mode() {
        let dir = tempfile::tempdir().unwrap();
        let a = GarbageCollector::shared_lock(dir.path()).unwrap();
        let b = GarbageCollector::shared_lock(dir.path()).unwrap();
        drop(a);
        drop(b);
    }
}
