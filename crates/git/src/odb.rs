//! The object-database handle.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use git2::{ObjectType as GitObjectType, Oid, Repository, Signature};
use quarry_common::{is_non_upwards, ObjectType};

use crate::error::{GitError, Result};

const FILEMODE_BLOB: i32 = 0o100_644;
const FILEMODE_BLOB_EXECUTABLE: i32 = 0o100_755;
const FILEMODE_LINK: i32 = 0o120_000;
const FILEMODE_TREE: i32 = 0o040_000;

/// Checks the contents of all symlinks referenced by a tree read.
///
/// Returns false to turn the tree read into an error.
pub type SymlinksCheck = dyn Fn(&[String]) -> bool + Send + Sync;

/// The default check: every target must be non-upwards.
#[must_use]
pub fn non_upwards_symlinks_check() -> Box<SymlinksCheck> {
    Box::new(|targets: &[String]| targets.iter().all(|t| is_non_upwards(t)))
}

/// Information about an object found under a path inside a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Hex object id.
    pub id: String,
    /// Object type derived from the entry mode.
    pub object_type: ObjectType,
    /// Target string, for symlinks.
    pub symlink_content: Option<String>,
}

/// A handle onto a git object database.
pub struct GitOdb {
    repo: Repository,
    path: PathBuf,
}

impl GitOdb {
    /// Open an existing repository (bare or not).
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path)?;
        Ok(Self {
            repo,
            path: path.to_path_buf(),
        })
    }

    /// Initialise a bare repository, opening it if it already exists.
    pub fn open_or_init(path: &Path) -> Result<Self> {
        let repo = match Repository::open(path) {
            Ok(repo) => repo,
            Err(_) => Repository::init_bare(path)?,
        };
        Ok(Self {
            repo,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the entries of a tree, grouped by raw hex id.
    ///
    /// Several names may share an id; the value lists every `(name, type)`
    /// pair referencing it. All symlink targets of the tree are resolved
    /// and passed through `symlinks_check` before anything is returned.
    pub fn read_tree(
        &self,
        tree_id: &str,
        symlinks_check: &SymlinksCheck,
    ) -> Result<HashMap<String, Vec<(String, ObjectType)>>> {
        let tree = self.repo.find_tree(parse_oid(tree_id)?)?;
        let mut grouped: HashMap<String, Vec<(String, ObjectType)>> = HashMap::new();
        let mut symlink_targets = Vec::new();
        for entry in tree.iter() {
            let name = entry
                .name()
                .ok_or_else(|| GitError::InvalidId(format!("non-utf8 name in tree {tree_id}")))?
                .to_string();
            let object_type = mode_to_type(&name, entry.filemode())?;
            if object_type == ObjectType::Symlink {
                let blob = self.repo.find_blob(entry.id())?;
                symlink_targets.push(String::from_utf8_lossy(blob.content()).to_string());
            }
            grouped
                .entry(entry.id().to_string())
                .or_default()
                .push((name, object_type));
        }
        if !symlinks_check(&symlink_targets) {
            let bad = symlink_targets
                .iter()
                .find(|t| !is_non_upwards(t))
                .cloned()
                .unwrap_or_default();
            return Err(GitError::UpwardsSymlink {
                tree: tree_id.to_string(),
                name: String::new(),
                target: bad,
            });
        }
        Ok(grouped)
    }

    /// Create a shallow tree object from grouped entries.
    pub fn create_tree(
        &self,
        entries: &HashMap<String, Vec<(String, ObjectType)>>,
    ) -> Result<String> {
        let mut builder = self.repo.treebuilder(None)?;
        for (id, names) in entries {
            let oid = parse_oid(id)?;
            for (name, object_type) in names {
                builder.insert(name, oid, type_to_mode(*object_type))?;
            }
        }
        Ok(builder.write()?.to_string())
    }

    /// Store a blob, returning its id.
    pub fn write_blob(&self, bytes: &[u8]) -> Result<String> {
        Ok(self.repo.blob(bytes)?.to_string())
    }

    /// Content of a blob.
    pub fn read_blob(&self, id: &str) -> Result<Vec<u8>> {
        let blob = self
            .repo
            .find_blob(parse_oid(id)?)
            .map_err(|_| GitError::NotFound(id.to_string()))?;
        Ok(blob.content().to_vec())
    }

    /// Whether a commit with the given id exists.
    #[must_use]
    pub fn contains_commit(&self, id: &str) -> bool {
        parse_oid(id).is_ok_and(|oid| self.repo.find_commit(oid).is_ok())
    }

    /// Whether a tree with the given id exists.
    #[must_use]
    pub fn contains_tree(&self, id: &str) -> bool {
        parse_oid(id).is_ok_and(|oid| self.repo.find_tree(oid).is_ok())
    }

    /// Whether a blob with the given id exists.
    #[must_use]
    pub fn contains_blob(&self, id: &str) -> bool {
        parse_oid(id).is_ok_and(|oid| self.repo.find_blob(oid).is_ok())
    }

    /// Commit the contents of a directory, without touching any ref.
    ///
    /// Returns `(commit_id, tree_id)`. The tree is built file by file, so
    /// this works on bare repositories; symlinks are stored as link
    /// entries, executables keep their bit.
    pub fn commit_directory(&self, dir: &Path, message: &str) -> Result<(String, String)> {
        let tree_oid = self.write_directory_tree(dir)?;
        let tree = self.repo.find_tree(tree_oid)?;
        let signature = Signature::now("quarry", "quarry@localhost")?;
        let commit = self
            .repo
            .commit(None, &signature, &signature, message, &tree, &[])?;
        tracing::debug!(commit = %commit, tree = %tree_oid, "committed directory");
        Ok((commit.to_string(), tree_oid.to_string()))
    }

    /// Create an annotated keep tag for a commit so it survives pruning.
    pub fn keep_tag(&self, commit_id: &str, message: &str) -> Result<()> {
        let oid = parse_oid(commit_id)?;
        let object = self.repo.find_object(oid, Some(GitObjectType::Commit))?;
        let signature = Signature::now("quarry", "quarry@localhost")?;
        self.repo
            .tag(&format!("keep-{commit_id}"), &object, &signature, message, true)?;
        Ok(())
    }

    /// Fetch everything reachable from a repository at a local path.
    pub fn fetch_from_path(&self, source: &Path) -> Result<()> {
        let url = source.to_string_lossy().to_string();
        let mut remote = self.repo.remote_anonymous(&url)?;
        remote.fetch(&["+refs/*:refs/*"], None, None)?;
        tracing::debug!(source = %url, "fetched from local path");
        Ok(())
    }

    /// The tree of a commit, optionally descending into a subdirectory.
    pub fn subtree_from_commit(&self, commit_id: &str, subdir: &str) -> Result<String> {
        let commit = self
            .repo
            .find_commit(parse_oid(commit_id)?)
            .map_err(|_| GitError::NotFound(commit_id.to_string()))?;
        let tree = commit.tree()?;
        if subdir == "." || subdir.is_empty() {
            return Ok(tree.id().to_string());
        }
        match self.object_info_under_path(&tree.id().to_string(), subdir)? {
            Some(info) if info.object_type == ObjectType::Tree => Ok(info.id),
            Some(_) => Err(GitError::InvalidId(format!(
                "`{subdir}` in commit {commit_id} is not a tree"
            ))),
            None => Err(GitError::NotFound(format!("{commit_id}:{subdir}"))),
        }
    }

    /// Resolve the object under a slash-separated path inside a tree.
    pub fn object_info_under_path(
        &self,
        tree_id: &str,
        path: &str,
    ) -> Result<Option<ObjectInfo>> {
        let mut current = self.repo.find_tree(parse_oid(tree_id)?)?;
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty() && *s != ".").collect();
        let Some((last, parents)) = segments.split_last() else {
            return Ok(Some(ObjectInfo {
                id: tree_id.to_string(),
                object_type: ObjectType::Tree,
                symlink_content: None,
            }));
        };
        for segment in parents {
            let (id, mode) = match current.get_name(segment) {
                Some(entry) => (entry.id(), entry.filemode()),
                None => return Ok(None),
            };
            if mode_to_type(segment, mode)? != ObjectType::Tree {
                return Ok(None);
            }
            current = self.repo.find_tree(id)?;
        }
        let (id, mode) = match current.get_name(last) {
            Some(entry) => (entry.id(), entry.filemode()),
            None => return Ok(None),
        };
        let object_type = mode_to_type(last, mode)?;
        let symlink_content = if object_type == ObjectType::Symlink {
            let blob = self.repo.find_blob(id)?;
            Some(String::from_utf8_lossy(blob.content()).to_string())
        } else {
            None
        };
        Ok(Some(ObjectInfo {
            id: id.to_string(),
            object_type,
            symlink_content,
        }))
    }

    fn write_directory_tree(&self, dir: &Path) -> Result<Oid> {
        let mut builder = self.repo.treebuilder(None)?;
        let mut entries: Vec<_> = fs::read_dir(dir)
            .map_err(|e| GitError::io(dir, e))?
            .collect::<std::io::Result<_>>()
            .map_err(|e| GitError::io(dir, e))?;
        entries.sort_by_key(std::fs::DirEntry::file_name);
        for entry in entries {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = entry.file_type().map_err(|e| GitError::io(&path, e))?;
            if file_type.is_symlink() {
                let target = fs::read_link(&path).map_err(|e| GitError::io(&path, e))?;
                let oid = self
                    .repo
                    .blob(target.to_string_lossy().as_bytes())?;
                builder.insert(&name, oid, FILEMODE_LINK)?;
            } else if file_type.is_dir() {
                let oid = self.write_directory_tree(&path)?;
                builder.insert(&name, oid, FILEMODE_TREE)?;
            } else {
                let bytes = fs::read(&path).map_err(|e| GitError::io(&path, e))?;
                let oid = self.repo.blob(&bytes)?;
                builder.insert(&name, oid, blob_mode(&path))?;
            }
        }
        Ok(builder.write()?)
    }
}

#[cfg(unix)]
fn blob_mode(path: &Path) -> i32 {
    use std::os::unix::fs::PermissionsExt;
    match fs::metadata(path) {
        Ok(meta) if meta.permissions().mode() & 0o111 != 0 => FILEMODE_BLOB_EXECUTABLE,
        _ => FILEMODE_BLOB,
    }
}

#[cfg(not(unix))]
fn blob_mode(_path: &Path) -> i32 {
    FILEMODE_BLOB
}

fn parse_oid(id: &str) -> Result<Oid> {
    Oid::from_str(id).map_err(|_| GitError::InvalidId(id.to_string()))
}

fn mode_to_type(name: &str, mode: i32) -> Result<ObjectType> {
    match mode {
        FILEMODE_BLOB => Ok(ObjectType::File),
        FILEMODE_BLOB_EXECUTABLE => Ok(ObjectType::Executable),
        FILEMODE_LINK => Ok(ObjectType::Symlink),
        FILEMODE_TREE => Ok(ObjectType::Tree),
        other => Err(GitError::UnsupportedMode {
            name: name.to_string(),
            mode: other,
        }),
    }
}

fn type_to_mode(object_type: ObjectType) -> i32 {
    match object_type {
        ObjectType::File => FILEMODE_BLOB,
        ObjectType::Executable => FILEMODE_BLOB_EXECUTABLE,
        ObjectType::Symlink => FILEMODE_LINK,
        ObjectType::Tree => FILEMODE_TREE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_repo() -> (tempfile::TempDir, GitOdb) {
        let dir = tempfile::tempdir().expect("scratch dir");
        let odb = GitOdb::open_or_init(&dir.path().join("repo.git")).expect("init repo");
        (dir, odb)
    }

    fn populate(dir: &Path) {
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("top.txt"), b"top level").unwrap();
        fs::write(dir.join("sub/inner.txt"), b"inner file").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("inner.txt", dir.join("sub/link")).unwrap();
    }

    #[test]
    fn commit_directory_and_read_back() {
        let (dir, odb) = scratch_repo();
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        populate(&work);

        let (commit, tree) = odb.commit_directory(&work, "import").unwrap();
        assert!(odb.contains_commit(&commit));
        assert!(odb.contains_tree(&tree));

        let check = non_upwards_symlinks_check();
        let entries = odb.read_tree(&tree, check.as_ref()).unwrap();
        let names: Vec<String> = entries
            .values()
            .flatten()
            .map(|(name, _)| name.clone())
            .collect();
        assert!(names.contains(&"top.txt".to_string()));
        assert!(names.contains(&"sub".to_string()));

        let info = odb
            .object_info_under_path(&tree, "sub/inner.txt")
            .unwrap()
            .expect("inner file");
        assert_eq!(info.object_type, ObjectType::File);
        assert_eq!(odb.read_blob(&info.id).unwrap(), b"inner file");
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_resolve_with_content() {
        let (dir, odb) = scratch_repo();
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        populate(&work);
        let (_commit, tree) = odb.commit_directory(&work, "import").unwrap();
        let info = odb
            .object_info_under_path(&tree, "sub/link")
            .unwrap()
            .expect("link");
        assert_eq!(info.object_type, ObjectType::Symlink);
        assert_eq!(info.symlink_content.as_deref(), Some("inner.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn upwards_symlinks_fail_tree_reads() {
        let (dir, odb) = scratch_repo();
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        std::os::unix::fs::symlink("../../escape", work.join("bad")).unwrap();
        let (_commit, tree) = odb.commit_directory(&work, "import").unwrap();
        let check = non_upwards_symlinks_check();
        let err = odb.read_tree(&tree, check.as_ref()).unwrap_err();
        assert!(matches!(err, GitError::UpwardsSymlink { .. }));
    }

    #[test]
    fn create_tree_from_grouped_entries() {
        let (_dir, odb) = scratch_repo();
        let blob = odb.write_blob(b"shared content").unwrap();
        let mut entries: HashMap<String, Vec<(String, ObjectType)>> = HashMap::new();
        entries.insert(
            blob.clone(),
            vec![
                ("copy-a".to_string(), ObjectType::File),
                ("copy-b".to_string(), ObjectType::File),
            ],
        );
        let tree = odb.create_tree(&entries).unwrap();
        let check = non_upwards_symlinks_check();
        let read = odb.read_tree(&tree, check.as_ref()).unwrap();
        assert_eq!(read[&blob].len(), 2);
    }

    #[test]
    fn fetch_from_local_path_transfers_objects() {
        let (dir, source) = scratch_repo();
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        fs::write(work.join("file"), b"payload").unwrap();
        let (commit, tree) = source.commit_directory(&work, "import").unwrap();
        source.keep_tag(&commit, "keep").unwrap();

        let target = GitOdb::open_or_init(&dir.path().join("target.git")).unwrap();
        assert!(!target.contains_commit(&commit));
        target.fetch_from_path(source.path()).unwrap();
        assert!(target.contains_commit(&commit));
        assert!(target.contains_tree(&tree));
        assert_eq!(target.subtree_from_commit(&commit, ".").unwrap(), tree);
    }
}
