//! Overlay operations on stored trees.

use std::fs;

use quarry_common::{decode_tree, encode_tree, Digest, ObjectType, TreeEntry};

use crate::error::{CasError, Result};
use crate::local_cas::LocalCas;

/// Recursively merge two stored trees, the right side winning.
///
/// With `disjoint` set, any path carrying different content on both sides
/// is an error instead; equal entries and entirely disjoint subtrees are
/// always fine. The merged tree is stored back into `cas` and its digest
/// returned.
pub fn overlay_trees(
    cas: &LocalCas,
    base: &Digest,
    overlay: &Digest,
    disjoint: bool,
) -> Result<Digest> {
    if base == overlay {
        return Ok(base.clone());
    }
    let base_entries = read_entries(cas, base)?;
    let overlay_entries = read_entries(cas, overlay)?;
    let mut merged: Vec<TreeEntry> = Vec::new();
    let mut overlay_iter = overlay_entries.into_iter().peekable();

    let mut by_name: std::collections::BTreeMap<String, TreeEntry> = base_entries
        .into_iter()
        .map(|e| (e.name.clone(), e))
        .collect();
    while let Some(right) = overlay_iter.next() {
        match by_name.remove(&right.name) {
            None => merged.push(right),
            Some(left) if left == right => merged.push(right),
            Some(left)
                if left.object_type == ObjectType::Tree
                    && right.object_type == ObjectType::Tree =>
            {
                let left_digest = child_digest(&left)?;
                let right_digest = child_digest(&right)?;
                let sub = overlay_trees(cas, &left_digest, &right_digest, disjoint)?;
                merged.push(TreeEntry {
                    name: right.name,
                    object_type: ObjectType::Tree,
                    hash: sub.raw_bytes(),
                });
            }
            Some(left) => {
                if disjoint {
                    return Err(CasError::CorruptEntry {
                        id: base.hash().to_string(),
                        reason: format!(
                            "conflict on entry `{}` ({} vs {})",
                            left.name, left.object_type, right.object_type
                        ),
                    });
                }
                // Non-disjoint overlay: the right side wins wholesale.
                merged.push(right);
            }
        }
    }
    merged.extend(by_name.into_values());
    let bytes = encode_tree(&merged);
    cas.store_tree(&bytes)
}

fn read_entries(cas: &LocalCas, digest: &Digest) -> Result<Vec<TreeEntry>> {
    let Some(path) = cas.tree_path(digest) else {
        return Err(CasError::ObjectNotFound(digest.hash().to_string()));
    };
    let bytes = fs::read(&path).map_err(|e| CasError::io(&path, e))?;
    decode_tree(&bytes, cas.hash_function().hash_len()).map_err(|e| CasError::CorruptEntry {
        id: digest.hash().to_string(),
        reason: e.to_string(),
    })
}

fn child_digest(entry: &TreeEntry) -> Result<Digest> {
    Digest::new(entry.hash_hex(), 0, entry.object_type.is_tree()).map_err(|e| {
        CasError::CorruptEntry {
            id: entry.name.clone(),
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::HashFunction;
    use std::collections::BTreeMap;

    /// Store a one-level stage as a tree of blobs.
    fn store_stage(cas: &LocalCas, files: &[(&str, &str)]) -> Digest {
        let mut by_dir: BTreeMap<String, Vec<TreeEntry>> = BTreeMap::new();
        for (path, content) in files {
            let digest = cas.store_blob(content.as_bytes(), false).unwrap();
            let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
            by_dir.entry(dir.to_string()).or_default().push(TreeEntry {
                name: name.to_string(),
                object_type: ObjectType::File,
                hash: digest.raw_bytes(),
            });
        }
        let root = by_dir.remove("").unwrap_or_default();
        let mut entries = root;
        for (dir, children) in by_dir {
            let sub = cas.store_tree(&encode_tree(&children)).unwrap();
            entries.push(TreeEntry {
                name: dir,
                object_type: ObjectType::Tree,
                hash: sub.raw_bytes(),
            });
        }
        cas.store_tree(&encode_tree(&entries)).unwrap()
    }

    fn entry_names(cas: &LocalCas, tree: &Digest) -> Vec<String> {
        let bytes = fs::read(cas.tree_path(tree).unwrap()).unwrap();
        decode_tree(&bytes, cas.hash_function().hash_len())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect()
    }

    #[test]
    fn disjoint_trees_merge_completely() {
        let dir = tempfile::tempdir().unwrap();
        let cas = LocalCas::new(dir.path(), 1, HashFunction::Native);
        let left = store_stage(&cas, &[("a.txt", "left"), ("sub/one", "1")]);
        let right = store_stage(&cas, &[("b.txt", "right"), ("sub/two", "2")]);
        let merged = overlay_trees(&cas, &left, &right, true).unwrap();
        let names = entry_names(&cas, &merged);
        assert_eq!(names, ["a.txt", "b.txt", "sub"]);
    }

    #[test]
    fn overlay_prefers_the_right_side() {
        let dir = tempfile::tempdir().unwrap();
        let cas = LocalCas::new(dir.path(), 1, HashFunction::Native);
        let base = store_stage(&cas, &[("conf", "defaults")]);
        let overlay = store_stage(&cas, &[("conf", "overrides")]);
        let merged = overlay_trees(&cas, &base, &overlay, false).unwrap();
        assert_eq!(merged, overlay);
        let bytes = fs::read(cas.tree_path(&merged).unwrap()).unwrap();
        let entries = decode_tree(&bytes, 20).unwrap();
        let conf = Digest::new(entries[0].hash_hex(), 0, false).unwrap();
        let content = fs::read(cas.blob_path(&conf, false).unwrap()).unwrap();
        assert_eq!(content, b"overrides");
    }

    #[test]
    fn disjointness_violations_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cas = LocalCas::new(dir.path(), 1, HashFunction::Native);
        let base = store_stage(&cas, &[("conf", "defaults")]);
        let overlay = store_stage(&cas, &[("conf", "overrides")]);
        let err = overlay_trees(&cas, &base, &overlay, true).unwrap_err();
        assert!(err.to_string().contains("conf"), "got: {err}");
        // Equal entries never conflict.
        assert!(overlay_trees(&cas, &base, &base, true).is_ok());
    }

    #[test]
    fn equal_subtrees_short_circuit() {
        let dir = tempfile::tempdir().unwrap();
        let cas = LocalCas::new(dir.path(), 1, HashFunction::Native);
        let left = store_stage(&cas, &[("shared/file", "same"), ("only-left", "l")]);
        let right = store_stage(&cas, &[("shared/file", "same"), ("only-right", "r")]);
        let merged = overlay_trees(&cas, &left, &right, true).unwrap();
        let names = entry_names(&cas, &merged);
        assert_eq!(names, ["only-left", "only-right", "shared"]);
    }
}
