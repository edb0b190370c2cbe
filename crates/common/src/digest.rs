//! Digests and the hash-function selector.
//!
//! quarry knows two hashing modes. In *native* mode objects are hashed the
//! way a git object database hashes them: SHA-1 over a `"<type> <size>\0"`
//! header followed by the payload, with trees using the `tree` header. In
//! *compatible* mode every object is hashed as a flat SHA-256 blob. The
//! selector is an explicit value constructed at startup and handed to every
//! digest-creation site; nothing in this crate keeps global state.

use std::fmt::Display;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha1::Digest as _;

use crate::error::{CommonError, Result};

/// Hex tag prepended to native tree hashes when rendered in tagged form.
const TREE_TAG: &str = "74";
/// Hex tag prepended to native blob hashes when rendered in tagged form.
const BLOB_TAG: &str = "62";

const NATIVE_HEX_LEN: usize = 40;
const COMPATIBLE_HEX_LEN: usize = 64;

/// Selector for the hashing mode of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashFunction {
    /// Git object hashing: SHA-1 over a typed header plus payload.
    #[default]
    Native,
    /// Flat SHA-256 over the payload, for remote-execution compatibility.
    Compatible,
}

impl HashFunction {
    /// Length of a raw hash in bytes.
    #[must_use]
    pub const fn hash_len(self) -> usize {
        match self {
            HashFunction::Native => 20,
            HashFunction::Compatible => 32,
        }
    }

    /// Length of a hash rendered as hex.
    #[must_use]
    pub const fn hex_len(self) -> usize {
        self.hash_len() * 2
    }

    /// Whether tree digests are distinguishable from blob digests.
    ///
    /// Only native digests carry the tree/blob tag; compatible mode hashes
    /// trees as flat blobs, so the distinction is lost there.
    #[must_use]
    pub const fn is_native(self) -> bool {
        matches!(self, HashFunction::Native)
    }

    /// Hash bytes as a blob object.
    #[must_use]
    pub fn hash_blob(self, data: &[u8]) -> Digest {
        Digest {
            hash: self.hash_with_header("blob", data),
            size: data.len() as u64,
            is_tree: false,
        }
    }

    /// Hash bytes as a tree object.
    #[must_use]
    pub fn hash_tree(self, data: &[u8]) -> Digest {
        Digest {
            hash: self.hash_with_header("tree", data),
            size: data.len() as u64,
            is_tree: self.is_native(),
        }
    }

    /// Hash file content as a blob or tree object, streaming.
    pub fn hash_file(self, path: &Path, as_tree: bool) -> Result<Digest> {
        let wrap = |source| CommonError::Io {
            path: path.to_path_buf(),
            source,
        };
        let meta = std::fs::metadata(path).map_err(wrap)?;
        let size = meta.len();
        let mut file = std::fs::File::open(path).map_err(wrap)?;
        let mut buf = [0u8; 64 * 1024];
        let hash = match self {
            HashFunction::Native => {
                let mut hasher = sha1::Sha1::new();
                let kind = if as_tree { "tree" } else { "blob" };
                hasher.update(format!("{kind} {size}\0").as_bytes());
                loop {
                    let n = file.read(&mut buf).map_err(wrap)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                hex::encode(hasher.finalize())
            }
            HashFunction::Compatible => {
                let mut hasher = sha2::Sha256::new();
                loop {
                    let n = file.read(&mut buf).map_err(wrap)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                hex::encode(hasher.finalize())
            }
        };
        Ok(Digest {
            hash,
            size,
            is_tree: as_tree && self.is_native(),
        })
    }

    fn hash_with_header(self, kind: &str, data: &[u8]) -> String {
        match self {
            HashFunction::Native => {
                let mut hasher = sha1::Sha1::new();
                hasher.update(format!("{kind} {}\0", data.len()).as_bytes());
                hasher.update(data);
                hex::encode(hasher.finalize())
            }
            HashFunction::Compatible => hex::encode(sha2::Sha256::digest(data)),
        }
    }
}

/// Identifier of a content-addressed store entry.
///
/// Equality, ordering and hashing go by the hex hash and the tree flag; the
/// size is carried along for protocol purposes and may be zero for
/// unknown-size references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    hash: String,
    size: u64,
    is_tree: bool,
}

impl Digest {
    /// Construct a digest from an untagged hex hash.
    pub fn new(hash: impl Into<String>, size: u64, is_tree: bool) -> Result<Self> {
        let hash = hash.into();
        if !matches!(hash.len(), NATIVE_HEX_LEN | COMPATIBLE_HEX_LEN)
            || !hash.bytes().all(|b| b.is_ascii_hexdigit())
            || hash.bytes().any(|b| b.is_ascii_uppercase())
        {
            return Err(CommonError::InvalidDigest(hash));
        }
        Ok(Self {
            hash,
            size,
            is_tree,
        })
    }

    /// The untagged hex hash.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Size of the referenced bytes; zero when unknown.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Whether this digest identifies a tree object.
    #[must_use]
    pub const fn is_tree(&self) -> bool {
        self.is_tree
    }

    /// Raw hash bytes.
    #[must_use]
    pub fn raw_bytes(&self) -> Vec<u8> {
        hex::decode(&self.hash).unwrap_or_default()
    }

    /// Render the hash in tagged form.
    ///
    /// Native hashes gain a `74` (tree) or `62` (blob) prefix so the object
    /// kind survives being passed around as a bare string; compatible
    /// hashes are returned unchanged.
    #[must_use]
    pub fn tagged(&self) -> String {
        if self.hash.len() == NATIVE_HEX_LEN {
            let tag = if self.is_tree { TREE_TAG } else { BLOB_TAG };
            format!("{tag}{}", self.hash)
        } else {
            self.hash.clone()
        }
    }

    /// Parse a tagged hash back into a digest of unknown size.
    pub fn from_tagged(tagged: &str) -> Result<Self> {
        match tagged.len() {
            l if l == NATIVE_HEX_LEN + 2 => {
                let (tag, hash) = tagged.split_at(2);
                let is_tree = match tag {
                    TREE_TAG => true,
                    BLOB_TAG => false,
                    _ => return Err(CommonError::InvalidDigest(tagged.to_string())),
                };
                Digest::new(hash, 0, is_tree)
            }
            COMPATIBLE_HEX_LEN => Digest::new(tagged, 0, false),
            _ => Err(CommonError::InvalidDigest(tagged.to_string())),
        }
    }
}

impl PartialEq for Digest {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.is_tree == other.is_tree
    }
}

impl Eq for Digest {}

impl std::hash::Hash for Digest {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
        self.is_tree.hash(state);
    }
}

impl PartialOrd for Digest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Digest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.hash, self.is_tree).cmp(&(&other.hash, other.is_tree))
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tagged(), self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_blob_matches_git() {
        // `git hash-object` of a file containing "hi" (no trailing newline).
        let d = HashFunction::Native.hash_blob(b"hi");
        assert_eq!(d.hash(), "32f95c0d1244a78b2be1bab8de17906fabb2c4a8");
        assert_eq!(d.size(), 2);
        assert!(!d.is_tree());
    }

    #[test]
    fn native_empty_tree_matches_git() {
        // The well-known empty-tree id.
        let d = HashFunction::Native.hash_tree(b"");
        assert_eq!(d.hash(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
        assert!(d.is_tree());
    }

    #[test]
    fn compatible_is_flat_sha256() {
        let d = HashFunction::Compatible.hash_blob(b"hello world");
        assert_eq!(
            d.hash(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        // Trees hash identically and lose the tree flag.
        let t = HashFunction::Compatible.hash_tree(b"hello world");
        assert_eq!(t.hash(), d.hash());
        assert!(!t.is_tree());
    }

    #[test]
    fn hash_file_agrees_with_hash_blob() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"some file content").unwrap();
        for hf in [HashFunction::Native, HashFunction::Compatible] {
            let from_file = hf.hash_file(&path, false).unwrap();
            let from_bytes = hf.hash_blob(b"some file content");
            assert_eq!(from_file, from_bytes);
            assert_eq!(from_file.size(), from_bytes.size());
        }
    }

    #[test]
    fn tagged_round_trip() {
        let d = HashFunction::Native.hash_tree(b"");
        let tagged = d.tagged();
        assert!(tagged.starts_with("74"));
        let back = Digest::from_tagged(&tagged).unwrap();
        assert_eq!(back, d);
        assert!(back.is_tree());

        let b = HashFunction::Native.hash_blob(b"x");
        assert!(b.tagged().starts_with("62"));
        assert!(!Digest::from_tagged(&b.tagged()).unwrap().is_tree());
    }

    #[test]
    fn equality_ignores_size() {
        let a = Digest::new("4b825dc642cb6eb9a060e54bf8d69288fbee4904", 0, true).unwrap();
        let b = Digest::new("4b825dc642cb6eb9a060e54bf8d69288fbee4904", 123, true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_hex_is_rejected() {
        assert!(Digest::new("zz", 0, false).is_err());
        assert!(Digest::new("ABCD", 0, false).is_err());
        assert!(Digest::from_tagged("99ffff").is_err());
    }
}
