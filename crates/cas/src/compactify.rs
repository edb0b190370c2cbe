//! Storage compactification.
//!
//! A sweep over the newest generation that (i) deletes entries whose path
//! does not fit the two-level fanout naming, (ii) deletes spliced objects
//! that also exist as a parts list, and (iii) splits every entry larger
//! than a threshold, keeping only the parts.

use std::fs;
use std::path::Path;

use quarry_common::Digest;
use walkdir::WalkDir;

use crate::error::{CasError, Result};
use crate::local_cas::LocalCas;

/// Outcome of a compactification sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactificationStats {
    /// Entries removed because their name is not a valid fanout path.
    pub invalid_removed: usize,
    /// Spliced objects removed in favour of their parts list.
    pub spliced_removed: usize,
    /// Objects split because they exceeded the size threshold.
    pub split: usize,
}

/// Sweep the newest generation of `cas`.
///
/// `size_threshold` bounds the size of entries kept whole; anything larger
/// is split and removed. The caller must hold the exclusive lock of the
/// store.
pub fn compactify(cas: &LocalCas, size_threshold: u64) -> Result<CompactificationStats> {
    let mut stats = CompactificationStats::default();
    let hex_rest = cas.hash_function().hex_len() - 2;
    let generation = cas.generation(0);

    let mut object_roots = vec![
        (generation.file.root().to_path_buf(), false),
        (generation.exec.root().to_path_buf(), false),
    ];
    if cas.hash_function().is_native() {
        // In compatible mode the tree store aliases the file store.
        object_roots.push((generation.tree.root().to_path_buf(), true));
    }
    for (root, is_tree) in &object_roots {
        sweep_invalid(root, hex_rest, &mut stats)?;
        for (digest, path) in valid_entries(root, hex_rest, *is_tree)? {
            let has_parts = cas.read_large_entry(&digest)?.is_some();
            if has_parts {
                fs::remove_file(&path).map_err(|e| CasError::io(&path, e))?;
                stats.spliced_removed += 1;
                continue;
            }
            let size = fs::metadata(&path).map_err(|e| CasError::io(&path, e))?.len();
            if size > size_threshold {
                cas.split(&digest)?;
                fs::remove_file(&path).map_err(|e| CasError::io(&path, e))?;
                stats.split += 1;
            }
        }
    }
    for root in [generation.large_file.root(), generation.large_tree.root()] {
        sweep_invalid(root, hex_rest, &mut stats)?;
    }
    tracing::info!(
        invalid = stats.invalid_removed,
        spliced = stats.spliced_removed,
        split = stats.split,
        "compactification finished"
    );
    Ok(stats)
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Delete files that do not fit `<hh>/<remaining-hex>`.
fn sweep_invalid(root: &Path, hex_rest: usize, stats: &mut CompactificationStats) -> Result<()> {
    if !root.is_dir() {
        return Ok(());
    }
    // Prefix directories first; descending only into valid ones keeps
    // the walk clear of entries removed along the way.
    for prefix in fs::read_dir(root).map_err(|e| CasError::io(root, e))? {
        let prefix = prefix.map_err(|e| CasError::io(root, e))?;
        let name = prefix.file_name().to_string_lossy().to_string();
        let path = prefix.path();
        if !path.is_dir() || name.len() != 2 || !is_hex(&name) {
            tracing::warn!(path = %path.display(), "removing invalid storage entry");
            if path.is_dir() {
                fs::remove_dir_all(&path).map_err(|e| CasError::io(&path, e))?;
            } else {
                fs::remove_file(&path).map_err(|e| CasError::io(&path, e))?;
            }
            stats.invalid_removed += 1;
            continue;
        }
        for entry in fs::read_dir(&path).map_err(|e| CasError::io(&path, e))? {
            let entry = entry.map_err(|e| CasError::io(&path, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let entry_path = entry.path();
            let valid =
                entry_path.is_file() && name.len() == hex_rest && is_hex(&name);
            if valid {
                continue;
            }
            tracing::warn!(path = %entry_path.display(), "removing invalid storage entry");
            if entry_path.is_dir() {
                fs::remove_dir_all(&entry_path).map_err(|e| CasError::io(&entry_path, e))?;
            } else {
                fs::remove_file(&entry_path).map_err(|e| CasError::io(&entry_path, e))?;
            }
            stats.invalid_removed += 1;
        }
    }
    Ok(())
}

/// All well-named entries of a store directory.
fn valid_entries(
    root: &Path,
    hex_rest: usize,
    is_tree: bool,
) -> Result<Vec<(Digest, std::path::PathBuf)>> {
    let mut entries = Vec::new();
    if !root.is_dir() {
        return Ok(entries);
    }
    for entry in WalkDir::new(root).min_depth(2).max_depth(2) {
        let entry = entry.map_err(|e| CasError::CorruptEntry {
            id: root.display().to_string(),
            reason: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rest = entry.file_name().to_string_lossy().to_string();
        let Some(prefix) = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .map(|p| p.to_string_lossy().to_string())
        else {
            continue;
        };
        if prefix.len() != 2 || !is_hex(&prefix) || rest.len() != hex_rest || !is_hex(&rest) {
            continue;
        }
        if let Ok(digest) = Digest::new(format!("{prefix}{rest}"), 0, is_tree) {
            entries.push((digest, entry.path().to_path_buf()));
        }
    }
    Ok(entries)
}
