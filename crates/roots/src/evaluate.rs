//! The computed-root evaluation loop.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use quarry_analysis::{
    analyse, AnalyseContext, ConfiguredTarget, FileRoot, InMemoryTargetCache, RepositoryConfig,
    RepositoryEntry,
};
use quarry_cas::RepositoryGarbageCollector;
use quarry_common::{EntityName, Statistics, TaskTracker};
use quarry_expr::Configuration;
use quarry_git::GitOdb;
use quarry_scheduler::{AsyncMapConsumer, TaskSystem};
use quarry_traverser::{traverse, DependencyGraph, Executor};
use thiserror::Error;

/// Failures of computed-root evaluation.
#[derive(Error, Debug)]
pub enum RootsError {
    #[error("computed root {0} failed to evaluate")]
    RootFailed(String),

    #[error("cyclic dependency between computed roots:\n{0}")]
    Cycle(String),

    #[error("{0}")]
    Import(String),
}

/// The build capabilities the evaluator borrows from its caller.
///
/// The executor materialises artifacts and action outputs into the
/// store; staging writes one artifact to a destination path on disk.
pub trait BuildDriver: Send + Sync {
    fn executor(&self) -> Arc<dyn Executor>;

    fn stage_artifact(
        &self,
        artifact: &quarry_common::ArtifactDescription,
        destination: &Path,
    ) -> Result<(), String>;

    /// Register the staged trees and blobs of an analysis so the
    /// executor can resolve tree artifacts and literal blobs.
    fn register_analysis(&self, content: &quarry_analysis::ActionGraphContent);
}

/// One computed root to materialise, identified by its description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ComputedRoot {
    repository: String,
    module: String,
    name: String,
    config: String,
}

impl ComputedRoot {
    fn from_file_root(root: &FileRoot) -> Option<Self> {
        match root {
            FileRoot::Computed {
                repository,
                module,
                name,
                config,
            } => Some(Self {
                repository: repository.clone(),
                module: module.clone(),
                name: name.clone(),
                config: config.to_string(),
            }),
            _ => None,
        }
    }

    fn to_file_root(&self) -> FileRoot {
        FileRoot::Computed {
            repository: self.repository.clone(),
            module: self.module.clone(),
            name: self.name.clone(),
            config: serde_json::from_str(&self.config).unwrap_or(serde_json::Value::Null),
        }
    }
}

impl std::fmt::Display for ComputedRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[\"{}\",\"{}\",\"{}\",{}]",
            self.repository, self.module, self.name, self.config
        )
    }
}

struct RootsEnv {
    repos: Arc<RwLock<RepositoryConfig>>,
    driver: Arc<dyn BuildDriver>,
    git_ops: Mutex<()>,
    odb_path: PathBuf,
    clones_root: PathBuf,
    hash_function: quarry_common::HashFunction,
    jobs: usize,
}

/// Resolve every computed root of the configuration in dependency order.
///
/// The configuration behind the lock holds git-tree roots only
/// afterwards; the main analysis proceeds against the updated
/// configuration, and the executor shares the same live view.
pub fn evaluate_computed_roots(
    repos: Arc<RwLock<RepositoryConfig>>,
    driver: Arc<dyn BuildDriver>,
    odb_path: &Path,
    clones_root: &Path,
    hash_function: quarry_common::HashFunction,
    jobs: usize,
) -> Result<(), RootsError> {
    let pending = {
        let repos = repos
            .read()
            .map_err(|_| RootsError::Import("repository configuration lock poisoned".into()))?;
        collect_computed_roots(&repos)
    };
    if pending.is_empty() {
        return Ok(());
    }
    // Keep the clone generations alive while they are referenced.
    let _clones_lock = RepositoryGarbageCollector::shared_lock(clones_root)
        .map_err(|e| RootsError::Import(e.to_string()))?;
    GitOdb::open_or_init(odb_path).map_err(|e| RootsError::Import(e.to_string()))?;

    let env = Arc::new(RootsEnv {
        repos,
        driver,
        git_ops: Mutex::new(()),
        odb_path: odb_path.to_path_buf(),
        clones_root: clones_root.to_path_buf(),
        hash_function,
        jobs,
    });
    let ts = TaskSystem::new(jobs);
    let map: AsyncMapConsumer<ComputedRoot, String> = {
        let env = Arc::clone(&env);
        AsyncMapConsumer::new(
            &ts.handle(),
            jobs,
            Box::new(move |_ts, setter, logger, subcaller, key: &ComputedRoot| {
                let deps = dependencies_of(&env, key);
                let env = Arc::clone(&env);
                let key = key.clone();
                let continuation_logger = Arc::clone(&logger);
                subcaller(
                    deps,
                    Box::new(move |_values| {
                        match materialize_root(&env, &key) {
                            Ok(tree_id) => setter(tree_id),
                            Err(err) => continuation_logger(
                                &format!("While materialising computed root {key}:\n{err}"),
                                true,
                            ),
                        }
                    }),
                    logger,
                );
            }),
        )
    };

    let failed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = Arc::clone(&failed);
        map.consume_after_keys_ready(
            pending.iter().cloned().collect(),
            Box::new(|_values| {}),
            Arc::new(|msg: &str, fatal: bool| {
                if fatal {
                    tracing::error!("{msg}");
                } else {
                    tracing::warn!("{msg}");
                }
            }),
            Arc::new(move |key: &ComputedRoot| {
                if let Ok(mut sink) = sink.lock() {
                    sink.push(key.to_string());
                }
            }),
        );
    }
    ts.finish();

    let printer: quarry_scheduler::CyclePrinter<ComputedRoot> = Box::new(|cycle| {
        cycle
            .iter()
            .map(|root| format!("  {root}"))
            .collect::<Vec<_>>()
            .join("\n")
    });
    if let Some(report) = map.detect_cycle(&printer) {
        return Err(RootsError::Cycle(report));
    }
    let failed = failed.lock().map(|f| f.clone()).unwrap_or_default();
    if let Some(first) = failed.first() {
        return Err(RootsError::RootFailed(first.clone()));
    }
    Ok(())
}

/// All computed roots referenced by the configuration.
fn collect_computed_roots(repos: &RepositoryConfig) -> BTreeSet<ComputedRoot> {
    let mut found = BTreeSet::new();
    for (_name, entry) in repos.repositories() {
        for root in [
            &entry.workspace_root,
            &entry.target_root,
            &entry.rule_root,
            &entry.expression_root,
        ] {
            if let Some(computed) = ComputedRoot::from_file_root(root) {
                found.insert(computed);
            }
        }
    }
    found
}

/// The computed roots `key` depends on: every computed root of any
/// repository reachable from the base repository through name mappings.
fn dependencies_of(env: &Arc<RootsEnv>, key: &ComputedRoot) -> Vec<ComputedRoot> {
    let Ok(repos) = env.repos.read() else {
        return Vec::new();
    };
    let mut reachable = BTreeSet::new();
    let mut queue = vec![key.repository.clone()];
    while let Some(name) = queue.pop() {
        if !reachable.insert(name.clone()) {
            continue;
        }
        if let Some(entry) = repos.repository(&name) {
            queue.extend(entry.name_mapping.values().cloned());
        }
    }
    let mut deps = BTreeSet::new();
    for name in reachable {
        let Some(entry) = repos.repository(&name) else {
            continue;
        };
        deps.extend(
            [
                &entry.workspace_root,
                &entry.target_root,
                &entry.rule_root,
                &entry.expression_root,
            ]
            .into_iter()
            .filter_map(ComputedRoot::from_file_root)
            .filter(|dep| dep != key),
        );
    }
    deps.into_iter().collect()
}

/// Analyse, build, stage and import one computed root.
fn materialize_root(env: &Arc<RootsEnv>, key: &ComputedRoot) -> Result<String, String> {
    // All build phases read the configuration under the shared lock; only
    // the final install step takes it exclusively.
    let repos_snapshot = {
        let repos = env
            .repos
            .read()
            .map_err(|_| "repository configuration lock poisoned".to_string())?;
        Arc::new(repos.clone())
    };
    let Some(base_entry) = repos_snapshot.repository(&key.repository) else {
        return Err(format!("unknown repository `{}`", key.repository));
    };
    if !base_entry.is_content_fixed() {
        return Err(format!(
            "repository `{}` of a computed root must be content-fixed",
            key.repository
        ));
    }

    // Isolated bookkeeping per root build.
    let statistics = Arc::new(Statistics::new());
    let ctx = AnalyseContext::new(
        Arc::clone(&repos_snapshot),
        statistics,
        Arc::new(TaskTracker::new()),
        Arc::new(InMemoryTargetCache::new()),
        env.hash_function,
        env.jobs,
    );
    let ts = TaskSystem::new(env.jobs);
    let target = ConfiguredTarget::new(
        EntityName::new(key.repository.clone(), key.module.clone(), key.name.clone()),
        Configuration::from_json(
            &serde_json::from_str(&key.config).unwrap_or(serde_json::json!({})),
        ),
    );
    let result = analyse(&ctx, &ts, target).map_err(|e| e.to_string())?;

    let content = ctx.result_map.to_content();
    env.driver.register_analysis(&content);
    let graph = Arc::new(
        DependencyGraph::from_actions(content.actions.iter().map(Arc::clone))
            .map_err(|e| e.to_string())?,
    );
    let targets: Vec<_> = result.analysed.artifacts().values().cloned().collect();
    let buildable: Vec<_> = targets
        .iter()
        .filter(|artifact| graph.artifact_id(artifact).is_some())
        .cloned()
        .collect();
    if !buildable.is_empty()
        && !traverse(graph, env.driver.executor(), env.jobs, &buildable)
    {
        return Err("building the root's artifacts failed".to_string());
    }

    // Stage the export target's artifacts into a scratch directory.
    let staging = tempfile::Builder::new()
        .prefix("root-staging")
        .tempdir_in(&env.clones_root)
        .map_err(|e| e.to_string())?;
    for (path, artifact) in result.analysed.artifacts() {
        let destination = staging.path().join(path);
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        env.driver.stage_artifact(artifact, &destination)?;
    }

    // Import via a temporary repository, then make the tree reachable in
    // the process-wide object database.
    let tree_id = {
        let _git_ops = env
            .git_ops
            .lock()
            .map_err(|_| "git operations lock poisoned".to_string())?;
        let scratch_repo = tempfile::Builder::new()
            .prefix("root-import")
            .tempdir_in(&env.clones_root)
            .map_err(|e| e.to_string())?;
        let tmp = GitOdb::open_or_init(scratch_repo.path()).map_err(|e| e.to_string())?;
        let (commit, tree_id) = tmp
            .commit_directory(staging.path(), &format!("Content of computed root {key}"))
            .map_err(|e| e.to_string())?;
        tmp.keep_tag(&commit, "Keep computed root").map_err(|e| e.to_string())?;
        let odb = GitOdb::open(&env.odb_path).map_err(|e| e.to_string())?;
        odb.fetch_from_path(scratch_repo.path()).map_err(|e| e.to_string())?;
        if !odb.contains_tree(&tree_id) {
            return Err(format!("imported tree {tree_id} is not in the database"));
        }
        tree_id
    };

    // Install the git root into the configuration for this root's key.
    install_root(env, key, &tree_id)?;
    tracing::info!(root = %key, tree = %tree_id, "computed root materialised");
    Ok(tree_id)
}

/// Replace every occurrence of the computed description by the git tree.
fn install_root(env: &Arc<RootsEnv>, key: &ComputedRoot, tree_id: &str) -> Result<(), String> {
    let computed = key.to_file_root();
    let git_root = FileRoot::GitTree {
        id: tree_id.to_string(),
        odb_path: env.odb_path.clone(),
    };
    let mut repos = env
        .repos
        .write()
        .map_err(|_| "repository configuration lock poisoned".to_string())?;
    let names: Vec<String> = repos.repositories().map(|(name, _)| name.clone()).collect();
    for name in names {
        let Some(entry) = repos.repository(&name) else {
            continue;
        };
        let replace = |root: &FileRoot| -> FileRoot {
            if *root == computed {
                git_root.clone()
            } else {
                root.clone()
            }
        };
        let updated = RepositoryEntry {
            workspace_root: replace(&entry.workspace_root),
            target_root: replace(&entry.target_root),
            rule_root: replace(&entry.rule_root),
            expression_root: replace(&entry.expression_root),
            target_file_name: entry.target_file_name.clone(),
            rule_file_name: entry.rule_file_name.clone(),
            expression_file_name: entry.expression_file_name.clone(),
            name_mapping: entry.name_mapping.clone(),
        };
        repos.set_repository(&name, updated);
    }
    Ok(())
}
