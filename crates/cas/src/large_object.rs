//! Auxiliary records for reconstructing large objects.
//!
//! Entries are keyed by the digest of the spliced result; the value of an
//! entry is the ordered list of part digests the object is composed of.
//! Parts are ordinary file-store entries in the same generation set. The
//! record itself is the newline-free `serde_json` rendering of
//! `[[hex, size], …]`.

use std::fs;
use std::path::{Path, PathBuf};

use quarry_common::Digest;

use crate::error::{CasError, Result};

/// Record store of one generation, for one object kind (file or tree).
pub struct LargeObjectCas {
    root: PathBuf,
}

impl LargeObjectCas {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the record for a digest lives, present or not.
    #[must_use]
    pub fn entry_path(&self, digest: &Digest) -> PathBuf {
        let hash = digest.hash();
        self.root.join(&hash[..2]).join(&hash[2..])
    }

    /// The parts a large object is composed of, if recorded.
    pub fn read_entry(&self, digest: &Digest) -> Result<Option<Vec<Digest>>> {
        let path = self.entry_path(digest);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|e| CasError::io(&path, e))?;
        let raw: Vec<(String, u64)> =
            serde_json::from_str(&content).map_err(|e| CasError::CorruptEntry {
                id: digest.hash().to_string(),
                reason: format!("unreadable parts list: {e}"),
            })?;
        let parts = raw
            .into_iter()
            .map(|(hash, size)| {
                Digest::new(hash, size, false).map_err(|e| CasError::CorruptEntry {
                    id: digest.hash().to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(parts))
    }

    /// Record the parts list for a digest; first write wins.
    pub fn write_entry(&self, digest: &Digest, parts: &[Digest]) -> Result<()> {
        let path = self.entry_path(digest);
        if path.is_file() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CasError::io(parent, e))?;
        }
        let raw: Vec<(&str, u64)> = parts.iter().map(|p| (p.hash(), p.size())).collect();
        let content = serde_json::to_string(&raw).map_err(|e| CasError::CorruptEntry {
            id: digest.hash().to_string(),
            reason: e.to_string(),
        })?;
        let tmp = path.with_extension(format!("tmp{}", std::process::id()));
        fs::write(&tmp, content).map_err(|e| CasError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| CasError::io(&path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::HashFunction;

    #[test]
    fn record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LargeObjectCas::new(dir.path());
        let whole = HashFunction::Native.hash_blob(b"whole object");
        let parts = vec![
            HashFunction::Native.hash_blob(b"whole "),
            HashFunction::Native.hash_blob(b"object"),
        ];
        assert!(store.read_entry(&whole).unwrap().is_none());
        store.write_entry(&whole, &parts).unwrap();
        let read = store.read_entry(&whole).unwrap().unwrap();
        assert_eq!(read, parts);
        assert_eq!(read[0].size(), 6);
        // Records are newline-free.
        let content = fs::read_to_string(store.entry_path(&whole)).unwrap();
        assert!(!content.contains('\n'));
    }
}
