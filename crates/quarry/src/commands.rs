//! Implementation of the command surface.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use miette::{miette, IntoDiagnostic, Result};
use quarry_analysis::{
    analyse, AnalyseContext, AnalysisResult, ConfiguredTarget, InMemoryTargetCache,
    RepositoryConfig,
};
use quarry_cas::{
    compactify, FileLock, GarbageCollector, LocalCas, RepositoryGarbageCollector, MAX_CHUNK_SIZE,
};
use quarry_common::{
    ActionDescription, ArtifactDescription, EntityName, HashFunction, Statistics, TaskTracker,
};
use quarry_expr::Configuration;
use quarry_roots::evaluate_computed_roots;
use quarry_scheduler::TaskSystem;
use quarry_traverser::{traverse, DependencyGraph};

use crate::cli::{Cli, Command, TargetSpec};
use crate::executor::{ExecutorDriver, LocalExecutor};
use crate::progress;

/// Generations kept by the local store.
const NUM_GENERATIONS: usize = 2;
/// Entries larger than this are split during compactification.
const COMPACTIFICATION_THRESHOLD: u64 = 4 * MAX_CHUNK_SIZE as u64;

/// Resolved invocation state shared by the commands.
struct Invocation {
    repos: Arc<RwLock<RepositoryConfig>>,
    main_repository: String,
    jobs: usize,
    hash_function: HashFunction,
    cas_root: PathBuf,
    scratch_root: PathBuf,
    odb_path: PathBuf,
    clones_root: PathBuf,
    statistics: Arc<Statistics>,
    tracker: Arc<TaskTracker>,
}

impl Invocation {
    fn from_cli(cli: &Cli) -> Result<Self> {
        let workspace = match &cli.workspace_root {
            Some(root) => root.clone(),
            None => std::env::current_dir().into_diagnostic()?,
        };
        let repos = match &cli.repository_config {
            Some(path) => parse_repository_config(path)?,
            None => {
                let default = workspace.join("repos.json");
                if default.is_file() {
                    parse_repository_config(&default)?
                } else {
                    RepositoryConfig::single("", &workspace)
                }
            }
        };
        let main_repository = cli
            .main
            .clone()
            .unwrap_or_else(|| repos.main_repository().to_string());
        if repos.repository(&main_repository).is_none() {
            return Err(miette!(
                "main repository `{main_repository}` is not part of the configuration"
            ));
        }
        let build_root = match &cli.local_build_root {
            Some(root) => root.clone(),
            None => default_build_root(&workspace),
        };
        let scratch_root = build_root.join("scratch");
        std::fs::create_dir_all(&scratch_root).into_diagnostic()?;
        Ok(Self {
            repos: Arc::new(RwLock::new(repos)),
            main_repository,
            jobs: cli.jobs.unwrap_or_else(num_cpus::get).max(1),
            hash_function: if cli.compatible {
                HashFunction::Compatible
            } else {
                HashFunction::Native
            },
            cas_root: build_root.join("cas"),
            scratch_root,
            odb_path: build_root.join("git"),
            clones_root: build_root.join("clones"),
            statistics: Arc::new(Statistics::new()),
            tracker: Arc::new(TaskTracker::new()),
        })
    }

    fn open_cas(&self) -> LocalCas {
        LocalCas::new(&self.cas_root, NUM_GENERATIONS, self.hash_function)
    }

    /// Shared lock protecting the store against a concurrent rotation.
    fn hold_store(&self) -> Result<FileLock> {
        GarbageCollector::shared_lock(&self.cas_root)
            .map_err(|e| miette!("cannot lock the local store: {e}"))
    }

    fn executor(&self, cas: LocalCas) -> Arc<LocalExecutor> {
        LocalExecutor::new(
            cas,
            Arc::clone(&self.repos),
            Arc::clone(&self.statistics),
            &self.scratch_root,
        )
    }

    fn configured_target(&self, spec: &TargetSpec) -> Result<ConfiguredTarget> {
        let (module, name) = spec.resolve().map_err(|e| miette!(e))?;
        Ok(ConfiguredTarget::new(
            EntityName::new(self.main_repository.clone(), module, name),
            Configuration::empty(),
        ))
    }

    /// Resolve computed roots, then snapshot the configuration.
    fn prepare_roots(&self, executor: &Arc<LocalExecutor>) -> Result<Arc<RepositoryConfig>> {
        std::fs::create_dir_all(&self.clones_root).into_diagnostic()?;
        evaluate_computed_roots(
            Arc::clone(&self.repos),
            Arc::new(ExecutorDriver(Arc::clone(executor))),
            &self.odb_path,
            &self.clones_root,
            self.hash_function,
            self.jobs,
        )
        .map_err(|e| miette!("{e}"))?;
        let repos = self
            .repos
            .read()
            .map_err(|_| miette!("repository configuration lock poisoned"))?;
        Ok(Arc::new(repos.clone()))
    }

    fn analyse_target(
        &self,
        executor: &Arc<LocalExecutor>,
        spec: &TargetSpec,
    ) -> Result<(Arc<AnalyseContext>, AnalysisResult)> {
        let repos = self.prepare_roots(executor)?;
        let ctx = AnalyseContext::new(
            repos,
            Arc::clone(&self.statistics),
            Arc::clone(&self.tracker),
            Arc::new(InMemoryTargetCache::new()),
            self.hash_function,
            self.jobs,
        );
        let ts = TaskSystem::new(self.jobs);
        let target = self.configured_target(spec)?;
        tracing::info!(target = %target.to_short_string(), "analysing");
        let result = analyse(&ctx, &ts, target).map_err(|e| miette!("{e}"))?;
        Ok((ctx, result))
    }

    /// Analyse and build a target; artifacts end up in the store.
    fn build_target(
        &self,
        spec: &TargetSpec,
    ) -> Result<(Arc<LocalExecutor>, Arc<AnalyseContext>, AnalysisResult)> {
        let executor = self.executor(self.open_cas());
        let (ctx, result) = self.analyse_target(&executor, spec)?;
        let content = ctx.result_map.to_content();
        executor.register_content(&content).map_err(|e| miette!(e))?;
        let graph = Arc::new(
            DependencyGraph::from_actions(content.actions.iter().map(Arc::clone))
                .map_err(|e| miette!("{e}"))?,
        );
        let buildable: Vec<ArtifactDescription> = result
            .analysed
            .artifacts()
            .values()
            .filter(|artifact| graph.artifact_id(artifact).is_some())
            .cloned()
            .collect();
        if !buildable.is_empty() && !traverse(graph, Arc::clone(&executor), self.jobs, &buildable)
        {
            return Err(miette!(
                "build of {} failed",
                result.target.to_short_string()
            ));
        }
        // Whatever is not built is uploaded.
        for artifact in result.analysed.artifacts().values() {
            executor.resolve(artifact).map_err(|e| miette!(e))?;
        }
        Ok((executor, ctx, result))
    }
}

/// Run a parsed command line.
pub fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Version => {
            println!("quarry {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Analyse {
            target,
            dump_actions,
            dump_graph,
        } => analyse_command(cli, target, dump_actions.as_deref(), dump_graph.as_deref()),
        Command::Build { target } | Command::Rebuild { target } => build_command(cli, target),
        Command::Install { target, output } => install_command(cli, target, output),
        Command::InstallCas { path } => install_cas_command(cli, path),
        Command::Traverse { graph, output } => traverse_command(cli, graph, output.as_deref()),
        Command::Execute { graph, action } => execute_command(cli, graph, action),
        Command::Describe { target } => describe_command(cli, target),
        Command::Gc {
            compactify,
            repositories,
        } => gc_command(cli, *compactify, *repositories),
    }
}

fn analyse_command(
    cli: &Cli,
    spec: &TargetSpec,
    dump_actions: Option<&Path>,
    dump_graph: Option<&Path>,
) -> Result<()> {
    let inv = Invocation::from_cli(cli)?;
    let _store = inv.hold_store()?;
    let reporter = progress::start_reporter(&inv.statistics, &inv.tracker);
    let executor = inv.executor(inv.open_cas());
    let (ctx, result) = inv.analyse_target(&executor, spec)?;
    reporter.stop();

    let rendered = serde_json::json!({
        "artifacts": stage_json(result.analysed.artifacts()),
        "runfiles": stage_json(result.analysed.runfiles()),
        "provides": result.analysed.result.provides.to_json(),
    });
    println!("{}", serde_json::to_string_pretty(&rendered).into_diagnostic()?);
    if let Some(path) = dump_actions {
        let dump = ctx.result_map.to_json(true);
        std::fs::write(path, serde_json::to_string_pretty(&dump).into_diagnostic()?)
            .into_diagnostic()?;
        tracing::info!(path = %path.display(), "wrote action graph");
    }
    if let Some(path) = dump_graph {
        let graph = ctx.result_map.configured_targets_graph();
        std::fs::write(path, serde_json::to_string_pretty(&graph).into_diagnostic()?)
            .into_diagnostic()?;
        tracing::info!(path = %path.display(), "wrote configured-target graph");
    }
    Ok(())
}

fn build_command(cli: &Cli, spec: &TargetSpec) -> Result<()> {
    let inv = Invocation::from_cli(cli)?;
    let _store = inv.hold_store()?;
    let reporter = progress::start_reporter(&inv.statistics, &inv.tracker);
    let (executor, ctx, result) = inv.build_target(spec)?;
    reporter.stop();
    for (path, artifact) in result.analysed.artifacts() {
        let (digest, object_type) = executor.resolve(artifact).map_err(|e| miette!(e))?;
        println!("{path} {digest} [{object_type}]");
    }
    let (actions, blobs, trees) = ctx.result_map.counts();
    tracing::info!(
        actions,
        blobs,
        trees,
        executed = inv.statistics.actions_executed_count(),
        "build finished"
    );
    Ok(())
}

fn install_command(cli: &Cli, spec: &TargetSpec, output: &Path) -> Result<()> {
    let inv = Invocation::from_cli(cli)?;
    let _store = inv.hold_store()?;
    let reporter = progress::start_reporter(&inv.statistics, &inv.tracker);
    let (executor, _ctx, result) = inv.build_target(spec)?;
    reporter.stop();
    for (path, artifact) in result.analysed.artifacts() {
        executor
            .stage_to(artifact, &output.join(path))
            .map_err(|e| miette!(e))?;
    }
    tracing::info!(output = %output.display(), "artifacts installed");
    Ok(())
}

fn install_cas_command(cli: &Cli, path: &Path) -> Result<()> {
    let inv = Invocation::from_cli(cli)?;
    let _store = inv.hold_store()?;
    let cas = inv.open_cas();
    let executor = inv.executor(cas.clone());
    let digest = if path.is_dir() {
        executor.import_directory(path).map_err(|e| miette!(e))?
    } else {
        cas.store_blob_from_file(path, false, false)
            .map_err(|e| miette!("{e}"))?
    };
    println!("{digest}");
    Ok(())
}

fn traverse_command(cli: &Cli, graph_file: &Path, output: Option<&Path>) -> Result<()> {
    let inv = Invocation::from_cli(cli)?;
    let _store = inv.hold_store()?;
    let executor = inv.executor(inv.open_cas());
    let (actions, content) = parse_action_graph(graph_file, inv.hash_function)?;
    executor.register_content(&content).map_err(|e| miette!(e))?;
    let graph = Arc::new(
        DependencyGraph::from_actions(actions.iter().map(Arc::clone)).map_err(|e| miette!("{e}"))?,
    );
    let mut targets = Vec::new();
    for action in &actions {
        for path in action.outputs().iter().chain(action.output_dirs()) {
            targets.push(action.output_artifact(path));
        }
    }
    if !traverse(graph, Arc::clone(&executor), inv.jobs, &targets) {
        return Err(miette!("traversal of {} failed", graph_file.display()));
    }
    if let Some(output) = output {
        for action in &actions {
            for path in action.outputs().iter().chain(action.output_dirs()) {
                executor
                    .stage_to(&action.output_artifact(path), &output.join(path))
                    .map_err(|e| miette!(e))?;
            }
        }
    }
    Ok(())
}

fn execute_command(cli: &Cli, graph_file: &Path, action_id: &str) -> Result<()> {
    let inv = Invocation::from_cli(cli)?;
    let _store = inv.hold_store()?;
    let executor = inv.executor(inv.open_cas());
    let (actions, content) = parse_action_graph(graph_file, inv.hash_function)?;
    executor.register_content(&content).map_err(|e| miette!(e))?;
    let action = actions
        .iter()
        .find(|a| a.id() == action_id)
        .ok_or_else(|| miette!("action {action_id} not found in {}", graph_file.display()))?;
    if !quarry_traverser::Executor::process_action(&*executor, action) {
        return Err(miette!("action {action_id} failed"));
    }
    for path in action.outputs().iter().chain(action.output_dirs()) {
        let (digest, object_type) = executor
            .resolve(&action.output_artifact(path))
            .map_err(|e| miette!(e))?;
        println!("{path} {digest} [{object_type}]");
    }
    Ok(())
}

fn describe_command(cli: &Cli, spec: &TargetSpec) -> Result<()> {
    let inv = Invocation::from_cli(cli)?;
    let (module, name) = spec.resolve().map_err(|e| miette!(e))?;
    let repos = inv
        .repos
        .read()
        .map_err(|_| miette!("repository configuration lock poisoned"))?;
    let entry = repos
        .repository(&inv.main_repository)
        .ok_or_else(|| miette!("unknown repository `{}`", inv.main_repository))?;
    let path = if module == "." {
        entry.target_file_name.clone()
    } else {
        format!("{module}/{}", entry.target_file_name)
    };
    let Some(bytes) = entry.target_root.read_file(&path).map_err(|e| miette!(e))? else {
        return Err(miette!("no targets file for module `{module}`"));
    };
    let targets: serde_json::Value = serde_json::from_slice(&bytes).into_diagnostic()?;
    let Some(desc) = targets.get(name.as_str()) else {
        return Err(miette!("target `{name}` not defined in module `{module}`"));
    };
    if let Some(rule_type) = desc.get("type").and_then(|t| t.as_str()) {
        println!("{name} is a {rule_type} target");
    }
    if let Some(doc) = desc.get("doc") {
        println!("{doc}");
    }
    println!("{}", serde_json::to_string_pretty(desc).into_diagnostic()?);
    Ok(())
}

fn gc_command(cli: &Cli, run_compactification: bool, repositories: bool) -> Result<()> {
    let inv = Invocation::from_cli(cli)?;
    if run_compactification {
        let _exclusive = GarbageCollector::exclusive_lock(&inv.cas_root)
            .map_err(|e| miette!("cannot lock the local store: {e}"))?;
        let cas = inv.open_cas();
        let stats = compactify(&cas, COMPACTIFICATION_THRESHOLD).map_err(|e| miette!("{e}"))?;
        tracing::info!(
            invalid = stats.invalid_removed,
            spliced = stats.spliced_removed,
            split = stats.split,
            "store compactified"
        );
        return Ok(());
    }
    GarbageCollector::trigger(&inv.cas_root, NUM_GENERATIONS).map_err(|e| miette!("{e}"))?;
    if repositories {
        RepositoryGarbageCollector::trigger(&inv.clones_root).map_err(|e| miette!("{e}"))?;
    }
    Ok(())
}

fn stage_json(
    stage: &std::collections::BTreeMap<String, ArtifactDescription>,
) -> serde_json::Value {
    serde_json::Value::Object(
        stage
            .iter()
            .map(|(path, artifact)| (path.clone(), artifact.to_json()))
            .collect(),
    )
}

fn default_build_root(workspace: &Path) -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".cache").join("quarry"),
        None => workspace.join(".quarry"),
    }
}

fn parse_repository_config(path: &Path) -> Result<RepositoryConfig> {
    let bytes = std::fs::read(path).into_diagnostic()?;
    let json: serde_json::Value = serde_json::from_slice(&bytes).into_diagnostic()?;
    RepositoryConfig::from_json(&json)
        .map_err(|e| miette!("in configuration {}: {e}", path.display()))
}

/// Rebuild an action graph dump into live descriptions.
fn parse_action_graph(
    path: &Path,
    hash_function: HashFunction,
) -> Result<(Vec<Arc<ActionDescription>>, quarry_analysis::ActionGraphContent)> {
    let bytes = std::fs::read(path).into_diagnostic()?;
    let dump: serde_json::Value = serde_json::from_slice(&bytes).into_diagnostic()?;
    let mut actions = Vec::new();
    if let Some(entries) = dump.get("actions").and_then(|a| a.as_object()) {
        for (id, entry) in entries {
            let action = action_from_json(entry, hash_function)
                .ok_or_else(|| miette!("malformed action entry {id}"))?;
            if action.id() != id {
                return Err(miette!(
                    "action {id} does not hash to its recorded identifier"
                ));
            }
            actions.push(Arc::new(action));
        }
    }
    let mut content = quarry_analysis::ActionGraphContent::default();
    if let Some(blobs) = dump.get("blobs").and_then(|b| b.as_array()) {
        content.blobs = blobs
            .iter()
            .filter_map(|b| b.as_str().map(ToString::to_string))
            .collect();
    }
    if let Some(trees) = dump.get("trees").and_then(|t| t.as_object()) {
        for staged in trees.values() {
            let Some(staged) = staged.as_object() else {
                continue;
            };
            let stage: std::collections::BTreeMap<String, ArtifactDescription> = staged
                .iter()
                .filter_map(|(path, artifact)| {
                    serde_json::from_value(artifact.clone())
                        .ok()
                        .map(|a| (path.clone(), a))
                })
                .collect();
            content
                .trees
                .push(Arc::new(quarry_analysis::StagedTree::new(hash_function, stage)));
        }
    }
    content.actions = actions.clone();
    Ok((actions, content))
}

fn action_from_json(entry: &serde_json::Value, hash_function: HashFunction) -> Option<ActionDescription> {
    let strings = |key: &str| -> Option<Vec<String>> {
        match entry.get(key) {
            None => Some(Vec::new()),
            Some(value) => serde_json::from_value(value.clone()).ok(),
        }
    };
    let string_map = |key: &str| -> Option<std::collections::BTreeMap<String, String>> {
        match entry.get(key) {
            None => Some(std::collections::BTreeMap::new()),
            Some(value) => serde_json::from_value(value.clone()).ok(),
        }
    };
    let inputs: std::collections::BTreeMap<String, ArtifactDescription> = match entry.get("inputs")
    {
        None => std::collections::BTreeMap::new(),
        Some(value) => serde_json::from_value(value.clone()).ok()?,
    };
    Some(ActionDescription::new(
        hash_function,
        strings("command")?,
        string_map("env")?,
        inputs,
        strings("outputs")?,
        strings("output_dirs")?,
        entry
            .get("may_fail")
            .and_then(|m| m.as_str().map(ToString::to_string)),
        entry
            .get("no_cache")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
        entry
            .get("timeout_scale")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(1.0),
        string_map("execution_properties")?,
    ))
}
