//! Local execution of actions against the content-addressed store.
//!
//! The executor materialises action inputs into a scratch directory,
//! runs the command, and stores the declared outputs back into the
//! store. Artifacts without a builder action are uploaded from their
//! source: workspace files, git blobs, literal data blobs, or staged
//! trees assembled from already-resolved children.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex, RwLock};

use quarry_analysis::{ActionGraphContent, FileRoot, RepositoryConfig};
use quarry_cas::LocalCas;
use quarry_common::{
    encode_tree, ActionDescription, ArtifactDescription, Digest, ObjectType, Statistics, TreeEntry,
};
use quarry_git::GitOdb;
use quarry_roots::BuildDriver;
use quarry_traverser::Executor;

/// A resolved artifact: its store entry and type.
type Resolved = (Digest, ObjectType);

/// Executor over the local store.
pub struct LocalExecutor {
    cas: LocalCas,
    /// Live view shared with the computed-root evaluator, which installs
    /// materialised roots under the write half of this lock.
    repos: Arc<RwLock<RepositoryConfig>>,
    statistics: Arc<Statistics>,
    scratch_root: std::path::PathBuf,
    resolved: Mutex<HashMap<ArtifactDescription, Resolved>>,
    staged_trees: Mutex<HashMap<String, BTreeMap<String, ArtifactDescription>>>,
}

impl LocalExecutor {
    #[must_use]
    pub fn new(
        cas: LocalCas,
        repos: Arc<RwLock<RepositoryConfig>>,
        statistics: Arc<Statistics>,
        scratch_root: impl Into<std::path::PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cas,
            repos,
            statistics,
            scratch_root: scratch_root.into(),
            resolved: Mutex::new(HashMap::new()),
            staged_trees: Mutex::new(HashMap::new()),
        })
    }

    /// Make the auxiliary blobs and staged trees of an analysis known.
    pub fn register_content(&self, content: &ActionGraphContent) -> Result<(), String> {
        for blob in &content.blobs {
            self.cas
                .store_blob(blob.as_bytes(), false)
                .map_err(|e| e.to_string())?;
        }
        if let Ok(mut trees) = self.staged_trees.lock() {
            for tree in &content.trees {
                trees.insert(tree.id().to_string(), tree.content().clone());
            }
        }
        Ok(())
    }

    /// Resolve an artifact to a store entry, uploading sources on demand.
    pub fn resolve(&self, artifact: &ArtifactDescription) -> Result<Resolved, String> {
        if let Some(found) = self
            .resolved
            .lock()
            .ok()
            .and_then(|r| r.get(artifact).cloned())
        {
            return Ok(found);
        }
        let resolved = match artifact {
            ArtifactDescription::Known {
                digest,
                object_type,
            } => (digest.clone(), *object_type),
            ArtifactDescription::Local { repository, path } => {
                self.resolve_local(repository, path)?
            }
            ArtifactDescription::Action { action_id, path } => {
                return Err(format!(
                    "output {path} of action {action_id} has not been built"
                ));
            }
            ArtifactDescription::Tree { tree_id } => self.resolve_tree(tree_id)?,
        };
        self.remember(artifact.clone(), resolved.clone());
        Ok(resolved)
    }

    fn remember(&self, artifact: ArtifactDescription, resolved: Resolved) {
        if let Ok(mut map) = self.resolved.lock() {
            map.insert(artifact, resolved);
        }
    }

    fn resolve_local(&self, repository: &str, path: &str) -> Result<Resolved, String> {
        let workspace_root = {
            let repos = self
                .repos
                .read()
                .map_err(|_| "repository configuration lock poisoned".to_string())?;
            repos
                .repository(repository)
                .ok_or_else(|| format!("unknown repository `{repository}`"))?
                .workspace_root
                .clone()
        };
        match &workspace_root {
            FileRoot::Path(root) => {
                let full = root.join(path);
                if full.is_symlink() {
                    let target = std::fs::read_link(&full).map_err(|e| e.to_string())?;
                    let digest = self
                        .cas
                        .store_blob(target.to_string_lossy().as_bytes(), false)
                        .map_err(|e| e.to_string())?;
                    return Ok((digest, ObjectType::Symlink));
                }
                let executable = is_executable(&full);
                let digest = self
                    .cas
                    .store_blob_from_file(&full, executable, false)
                    .map_err(|e| e.to_string())?;
                let object_type = if executable {
                    ObjectType::Executable
                } else {
                    ObjectType::File
                };
                Ok((digest, object_type))
            }
            FileRoot::GitTree { id, odb_path } => {
                let odb = GitOdb::open(odb_path).map_err(|e| e.to_string())?;
                let info = odb
                    .object_info_under_path(id, path)
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("`{path}` not found in git root {id}"))?;
                let bytes = odb.read_blob(&info.id).map_err(|e| e.to_string())?;
                let digest = self
                    .cas
                    .store_blob(&bytes, info.object_type.is_executable())
                    .map_err(|e| e.to_string())?;
                Ok((digest, info.object_type))
            }
            FileRoot::Computed { .. } => {
                Err(format!("workspace root of `{repository}` was never materialised"))
            }
        }
    }

    /// Assemble a staged tree from its resolved children.
    fn resolve_tree(&self, tree_id: &str) -> Result<Resolved, String> {
        let content = self
            .staged_trees
            .lock()
            .ok()
            .and_then(|trees| trees.get(tree_id).cloned())
            .ok_or_else(|| format!("unknown staged tree {tree_id}"))?;
        let digest = self.store_stage_as_tree(&content)?;
        Ok((digest, ObjectType::Tree))
    }

    /// Store a path-to-artifact stage as nested tree objects.
    fn store_stage_as_tree(
        &self,
        stage: &BTreeMap<String, ArtifactDescription>,
    ) -> Result<Digest, String> {
        // Group the stage into immediate entries and subdirectories.
        let mut files: Vec<TreeEntry> = Vec::new();
        let mut subdirs: BTreeMap<String, BTreeMap<String, ArtifactDescription>> = BTreeMap::new();
        for (path, artifact) in stage {
            match path.split_once('/') {
                Some((dir, rest)) => {
                    subdirs
                        .entry(dir.to_string())
                        .or_default()
                        .insert(rest.to_string(), artifact.clone());
                }
                None => {
                    let (digest, object_type) = self.resolve(artifact)?;
                    files.push(TreeEntry {
                        name: path.clone(),
                        object_type,
                        hash: digest.raw_bytes(),
                    });
                }
            }
        }
        for (name, sub_stage) in subdirs {
            let digest = self.store_stage_as_tree(&sub_stage)?;
            files.push(TreeEntry {
                name,
                object_type: ObjectType::Tree,
                hash: digest.raw_bytes(),
            });
        }
        let bytes = encode_tree(&files);
        self.cas.store_tree(&bytes).map_err(|e| e.to_string())
    }

    /// Write a resolved artifact to a destination path.
    pub fn stage_to(
        &self,
        artifact: &ArtifactDescription,
        destination: &Path,
    ) -> Result<(), String> {
        let (digest, object_type) = self.resolve(artifact)?;
        self.stage_resolved(&digest, object_type, destination)
    }

    fn stage_resolved(
        &self,
        digest: &Digest,
        object_type: ObjectType,
        destination: &Path,
    ) -> Result<(), String> {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        match object_type {
            ObjectType::Tree => {
                let path = self
                    .cas
                    .tree_path(digest)
                    .ok_or_else(|| format!("tree {digest} not in storage"))?;
                let bytes = std::fs::read(&path).map_err(|e| e.to_string())?;
                let entries =
                    quarry_common::decode_tree(&bytes, self.cas.hash_function().hash_len())
                        .map_err(|e| e.to_string())?;
                std::fs::create_dir_all(destination).map_err(|e| e.to_string())?;
                for entry in entries {
                    let child = Digest::new(entry.hash_hex(), 0, entry.object_type.is_tree())
                        .map_err(|e| e.to_string())?;
                    self.stage_resolved(&child, entry.object_type, &destination.join(&entry.name))?;
                }
                Ok(())
            }
            ObjectType::Symlink => {
                let path = self
                    .cas
                    .blob_path(digest, false)
                    .ok_or_else(|| format!("symlink blob {digest} not in storage"))?;
                let target = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
                #[cfg(unix)]
                {
                    if destination.is_symlink() || destination.exists() {
                        let _ = std::fs::remove_file(destination);
                    }
                    std::os::unix::fs::symlink(&target, destination).map_err(|e| e.to_string())
                }
                #[cfg(not(unix))]
                {
                    std::fs::write(destination, target).map_err(|e| e.to_string())
                }
            }
            _ => {
                let path = self
                    .cas
                    .blob_path(digest, object_type.is_executable())
                    .ok_or_else(|| format!("blob {digest} not in storage"))?;
                if destination.exists() {
                    let _ = std::fs::remove_file(destination);
                }
                std::fs::copy(path, destination).map_err(|e| e.to_string())?;
                Ok(())
            }
        }
    }

    fn run_action(&self, action: &Arc<ActionDescription>) -> Result<(), String> {
        self.statistics.increment_actions_queued();
        let scratch = tempfile::Builder::new()
            .prefix("action")
            .tempdir_in(&self.scratch_root)
            .map_err(|e| e.to_string())?;
        for (path, artifact) in action.inputs() {
            self.stage_to(artifact, &scratch.path().join(path))?;
        }
        for output in action.outputs().iter().chain(action.output_dirs()) {
            let destination = scratch.path().join(output);
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
        }

        let Some((program, args)) = action.argv().split_first() else {
            return Err("action has an empty command line".to_string());
        };
        let output = Command::new(program)
            .args(args)
            .envs(action.env())
            .current_dir(scratch.path())
            .output()
            .map_err(|e| format!("spawning `{program}`: {e}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if action.may_fail().is_none() {
                return Err(format!(
                    "action {} failed with {}:\n{stderr}",
                    action.id(),
                    output.status
                ));
            }
            tracing::warn!(
                action = %action.id(),
                status = %output.status,
                "{}",
                action.may_fail().unwrap_or_default()
            );
        }
        self.statistics.increment_actions_executed();

        for path in action.outputs() {
            let file = scratch.path().join(path);
            let resolved = if file.is_symlink() {
                let target = std::fs::read_link(&file).map_err(|e| e.to_string())?;
                let digest = self
                    .cas
                    .store_blob(target.to_string_lossy().as_bytes(), false)
                    .map_err(|e| e.to_string())?;
                (digest, ObjectType::Symlink)
            } else if file.is_file() {
                let executable = is_executable(&file);
                let digest = self
                    .cas
                    .store_blob_from_file(&file, executable, true)
                    .map_err(|e| e.to_string())?;
                let object_type = if executable {
                    ObjectType::Executable
                } else {
                    ObjectType::File
                };
                (digest, object_type)
            } else {
                return Err(format!(
                    "action {} did not produce declared output {path}",
                    action.id()
                ));
            };
            self.remember(action.output_artifact(path), resolved);
        }
        for path in action.output_dirs() {
            let dir = scratch.path().join(path);
            if !dir.is_dir() {
                return Err(format!(
                    "action {} did not produce declared output directory {path}",
                    action.id()
                ));
            }
            let digest = self.import_directory(&dir)?;
            self.remember(action.output_artifact(path), (digest, ObjectType::Tree));
        }
        Ok(())
    }

    /// Store a directory recursively as tree objects.
    pub fn import_directory(&self, dir: &Path) -> Result<Digest, String> {
        let mut entries = Vec::new();
        let mut listed: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| e.to_string())?
            .collect::<std::io::Result<_>>()
            .map_err(|e| e.to_string())?;
        listed.sort_by_key(std::fs::DirEntry::file_name);
        for item in listed {
            let path = item.path();
            let name = item.file_name().to_string_lossy().to_string();
            let file_type = item.file_type().map_err(|e| e.to_string())?;
            let (digest, object_type) = if file_type.is_symlink() {
                let target = std::fs::read_link(&path).map_err(|e| e.to_string())?;
                let digest = self
                    .cas
                    .store_blob(target.to_string_lossy().as_bytes(), false)
                    .map_err(|e| e.to_string())?;
                (digest, ObjectType::Symlink)
            } else if file_type.is_dir() {
                (self.import_directory(&path)?, ObjectType::Tree)
            } else {
                let executable = is_executable(&path);
                let digest = self
                    .cas
                    .store_blob_from_file(&path, executable, true)
                    .map_err(|e| e.to_string())?;
                let object_type = if executable {
                    ObjectType::Executable
                } else {
                    ObjectType::File
                };
                (digest, object_type)
            };
            entries.push(TreeEntry {
                name,
                object_type,
                hash: digest.raw_bytes(),
            });
        }
        self.cas
            .store_tree(&encode_tree(&entries))
            .map_err(|e| e.to_string())
    }
}

impl Executor for LocalExecutor {
    fn process_action(&self, action: &Arc<ActionDescription>) -> bool {
        match self.run_action(action) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!("{err}");
                false
            }
        }
    }

    fn process_artifact(&self, artifact: &ArtifactDescription) -> bool {
        match self.resolve(artifact) {
            Ok(_) => true,
            Err(err) => {
                tracing::error!("{err}");
                false
            }
        }
    }
}

/// Driver handle the computed-root evaluator borrows.
pub struct ExecutorDriver(pub Arc<LocalExecutor>);

impl BuildDriver for ExecutorDriver {
    fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.0) as Arc<dyn Executor>
    }

    fn stage_artifact(
        &self,
        artifact: &ArtifactDescription,
        destination: &Path,
    ) -> Result<(), String> {
        self.0.stage_to(artifact, destination)
    }

    fn register_analysis(&self, content: &ActionGraphContent) {
        if let Err(err) = self.0.register_content(content) {
            tracing::error!("registering analysis content failed: {err}");
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::HashFunction;
    use quarry_traverser::Executor as _;

    fn scratch_executor() -> (tempfile::TempDir, Arc<LocalExecutor>) {
        let dir = tempfile::tempdir().expect("scratch dir");
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(workspace.join("input.txt"), b"from the workspace").unwrap();
        let cas = LocalCas::new(dir.path().join("cas"), 1, HashFunction::Native);
        let repos = Arc::new(RwLock::new(RepositoryConfig::single("", &workspace)));
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        let executor = LocalExecutor::new(cas, repos, Arc::new(Statistics::new()), scratch);
        (dir, executor)
    }

    fn action(cmd: &str, inputs: &[(&str, ArtifactDescription)], outs: &[&str]) -> Arc<ActionDescription> {
        Arc::new(ActionDescription::new(
            HashFunction::Native,
            vec!["sh".into(), "-c".into(), cmd.into()],
            BTreeMap::new(),
            inputs
                .iter()
                .map(|(path, artifact)| ((*path).to_string(), artifact.clone()))
                .collect(),
            outs.iter().map(ToString::to_string).collect(),
            vec![],
            None,
            false,
            1.0,
            BTreeMap::new(),
        ))
    }

    #[cfg(unix)]
    #[test]
    fn actions_run_against_staged_inputs() {
        let (_dir, executor) = scratch_executor();
        let source = ArtifactDescription::Local {
            repository: String::new(),
            path: "input.txt".to_string(),
        };
        let a = action(
            "tr a-z A-Z < in/source > shouted.txt",
            &[("in/source", source)],
            &["shouted.txt"],
        );
        assert!(executor.process_action(&a));
        let (digest, object_type) = executor
            .resolve(&a.output_artifact("shouted.txt"))
            .unwrap();
        assert_eq!(object_type, ObjectType::File);
        let out = tempfile::tempdir().unwrap();
        executor
            .stage_to(&a.output_artifact("shouted.txt"), &out.path().join("result"))
            .unwrap();
        assert_eq!(
            std::fs::read(out.path().join("result")).unwrap(),
            b"FROM THE WORKSPACE"
        );
        assert_eq!(digest.size(), b"FROM THE WORKSPACE".len() as u64);
    }

    #[cfg(unix)]
    #[test]
    fn output_directories_become_trees() {
        let (_dir, executor) = scratch_executor();
        let a = Arc::new(ActionDescription::new(
            HashFunction::Native,
            vec![
                "sh".into(),
                "-c".into(),
                "mkdir -p bundle/sub && echo one > bundle/a && echo two > bundle/sub/b".into(),
            ],
            BTreeMap::new(),
            BTreeMap::new(),
            vec![],
            vec!["bundle".to_string()],
            None,
            false,
            1.0,
            BTreeMap::new(),
        ));
        assert!(executor.process_action(&a));
        let (_digest, object_type) = executor.resolve(&a.output_artifact("bundle")).unwrap();
        assert_eq!(object_type, ObjectType::Tree);
        let out = tempfile::tempdir().unwrap();
        executor
            .stage_to(&a.output_artifact("bundle"), &out.path().join("bundle"))
            .unwrap();
        assert_eq!(
            std::fs::read(out.path().join("bundle/a")).unwrap(),
            b"one\n"
        );
        assert_eq!(
            std::fs::read(out.path().join("bundle/sub/b")).unwrap(),
            b"two\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn missing_outputs_fail_the_action() {
        let (_dir, executor) = scratch_executor();
        let a = action("true", &[], &["never-written.txt"]);
        assert!(!executor.process_action(&a));
    }

    #[test]
    fn staged_trees_resolve_from_registered_analysis() {
        let (_dir, executor) = scratch_executor();
        let mut stage = BTreeMap::new();
        stage.insert(
            "docs/readme".to_string(),
            ArtifactDescription::Known {
                digest: HashFunction::Native.hash_blob(b"hello"),
                object_type: ObjectType::File,
            },
        );
        let tree = quarry_analysis::StagedTree::new(HashFunction::Native, stage);
        let content = ActionGraphContent {
            blobs: vec!["hello".to_string()],
            trees: vec![Arc::new(tree.clone())],
            ..ActionGraphContent::default()
        };
        executor.register_content(&content).unwrap();
        let (digest, object_type) = executor
            .resolve(&ArtifactDescription::Tree {
                tree_id: tree.id().to_string(),
            })
            .unwrap();
        assert_eq!(object_type, ObjectType::Tree);
        assert!(digest.is_tree());
    }
}
