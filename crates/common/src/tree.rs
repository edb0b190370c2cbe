//! Canonical tree codec.
//!
//! Trees are stored in the git tree byte format: entries sorted in git name
//! order (directories compare as `name + "/"`), each encoded as
//! `"<mode> <name>\0"` followed by the raw hash bytes of the referenced
//! object. The same encoding is used in both hashing modes; only the raw
//! hash length differs.

use crate::error::{CommonError, Result};
use crate::object_type::ObjectType;

/// One entry of a decoded tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Entry name, a single path segment.
    pub name: String,
    /// Object type derived from the entry mode.
    pub object_type: ObjectType,
    /// Raw hash bytes of the referenced object.
    pub hash: Vec<u8>,
}

impl TreeEntry {
    /// Hex rendering of the referenced hash.
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }
}

fn sort_key(entry: &TreeEntry) -> Vec<u8> {
    let mut key = entry.name.clone().into_bytes();
    if entry.object_type.is_tree() {
        key.push(b'/');
    }
    key
}

/// Encode entries into canonical tree bytes.
///
/// Entries are sorted here; callers may pass them in any order.
#[must_use]
pub fn encode_tree(entries: &[TreeEntry]) -> Vec<u8> {
    let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| sort_key(e));
    let mut out = Vec::new();
    for entry in sorted {
        out.extend_from_slice(entry.object_type.mode().as_bytes());
        out.push(b' ');
        out.extend_from_slice(entry.name.as_bytes());
        out.push(0);
        out.extend_from_slice(&entry.hash);
    }
    out
}

struct TreeIter<'a> {
    bytes: &'a [u8],
    pos: usize,
    hash_len: usize,
}

impl Iterator for TreeIter<'_> {
    type Item = Result<(std::ops::Range<usize>, TreeEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let start = self.pos;
        let rest = &self.bytes[start..];
        let Some(space) = rest.iter().position(|&b| b == b' ') else {
            return Some(Err(CommonError::InvalidTree(
                "entry without mode separator".to_string(),
            )));
        };
        let Some(nul) = rest.iter().position(|&b| b == 0) else {
            return Some(Err(CommonError::InvalidTree(
                "entry without name terminator".to_string(),
            )));
        };
        if nul <= space || nul + 1 + self.hash_len > rest.len() {
            return Some(Err(CommonError::InvalidTree(
                "truncated tree entry".to_string(),
            )));
        }
        let mode = match std::str::from_utf8(&rest[..space]) {
            Ok(m) => m,
            Err(_) => {
                return Some(Err(CommonError::InvalidTree(
                    "non-utf8 entry mode".to_string(),
                )))
            }
        };
        let object_type = match ObjectType::from_mode(mode) {
            Ok(t) => t,
            Err(e) => return Some(Err(e)),
        };
        let name = match std::str::from_utf8(&rest[space + 1..nul]) {
            Ok(n) if !n.is_empty() => n.to_string(),
            _ => {
                return Some(Err(CommonError::InvalidTree(
                    "empty or non-utf8 entry name".to_string(),
                )))
            }
        };
        let end = start + nul + 1 + self.hash_len;
        let hash = self.bytes[start + nul + 1..end].to_vec();
        self.pos = end;
        Some(Ok((
            start..end,
            TreeEntry {
                name,
                object_type,
                hash,
            },
        )))
    }
}

/// Decode canonical tree bytes into entries.
pub fn decode_tree(bytes: &[u8], hash_len: usize) -> Result<Vec<TreeEntry>> {
    TreeIter {
        bytes,
        pos: 0,
        hash_len,
    }
    .map(|r| r.map(|(_, e)| e))
    .collect()
}

/// Byte ranges of the individual entry records of a tree.
///
/// Splitting a stored tree cuts its raw bytes exactly at these boundaries,
/// so concatenating the parts reproduces the original object.
pub fn tree_entry_spans(bytes: &[u8], hash_len: usize) -> Result<Vec<std::ops::Range<usize>>> {
    TreeIter {
        bytes,
        pos: 0,
        hash_len,
    }
    .map(|r| r.map(|(span, _)| span))
    .collect()
}
