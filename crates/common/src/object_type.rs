//! The four object types the store distinguishes.

use serde::{Deserialize, Serialize};

use crate::error::{CommonError, Result};

/// Type of an object held in the content-addressed store.
///
/// Files and executables differ only in the permission bits of the stored
/// blob; symlinks store their target string as content; trees store the
/// canonical tree encoding of their entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    File,
    Executable,
    Symlink,
    Tree,
}

impl ObjectType {
    /// Whether the object is a tree.
    #[must_use]
    pub const fn is_tree(self) -> bool {
        matches!(self, ObjectType::Tree)
    }

    /// Whether the object carries the executable bit.
    #[must_use]
    pub const fn is_executable(self) -> bool {
        matches!(self, ObjectType::Executable)
    }

    /// Single-letter tag used in store paths and log lines.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            ObjectType::File => 'f',
            ObjectType::Executable => 'x',
            ObjectType::Symlink => 'l',
            ObjectType::Tree => 't',
        }
    }

    /// Mode string used in the canonical tree encoding.
    #[must_use]
    pub const fn mode(self) -> &'static str {
        match self {
            ObjectType::File => "100644",
            ObjectType::Executable => "100755",
            ObjectType::Symlink => "120000",
            ObjectType::Tree => "40000",
        }
    }

    /// Parse a tree-entry mode string.
    pub fn from_mode(mode: &str) -> Result<Self> {
        match mode {
            "100644" | "644" => Ok(ObjectType::File),
            "100755" | "755" => Ok(ObjectType::Executable),
            "120000" => Ok(ObjectType::Symlink),
            "40000" | "040000" => Ok(ObjectType::Tree),
            _ => Err(CommonError::InvalidEntryMode(mode.to_string())),
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ObjectType::File => "file",
            ObjectType::Executable => "executable",
            ObjectType::Symlink => "symlink",
            ObjectType::Tree => "tree",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trip() {
        for t in [
            ObjectType::File,
            ObjectType::Executable,
            ObjectType::Symlink,
            ObjectType::Tree,
        ] {
            assert_eq!(ObjectType::from_mode(t.mode()).unwrap(), t);
        }
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(ObjectType::from_mode("160000").is_err());
    }
}
