//! Wiring of the analysis engine into the async map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use quarry_common::{ArtifactDescription, HashFunction, Statistics, TaskTracker};
use quarry_expr::TargetResult;
use quarry_scheduler::{AsyncMapConsumer, TaskHandle};

use crate::analysed_target::{AnalysedTarget, TargetGraphInformation};
use crate::configured_target::ConfiguredTarget;
use crate::repo_config::RepositoryConfig;
use crate::result_map::ResultTargetMap;
use crate::rules;
use crate::target_cache::TargetCache;

/// The async map of the analysis engine.
pub type TargetMap = AsyncMapConsumer<ConfiguredTarget, Arc<AnalysedTarget>>;

pub(crate) type Logger = quarry_scheduler::Logger;
pub(crate) type Setter = quarry_scheduler::Setter<Arc<AnalysedTarget>>;
pub(crate) type SubCaller = quarry_scheduler::SubCaller<ConfiguredTarget, Arc<AnalysedTarget>>;

/// Everything an analysis shares: the repositories, the result map, the
/// counters and the export cache.
pub struct AnalyseContext {
    pub repos: Arc<RepositoryConfig>,
    pub result_map: Arc<ResultTargetMap>,
    pub statistics: Arc<Statistics>,
    pub tracker: Arc<TaskTracker>,
    pub target_cache: Arc<dyn TargetCache>,
    pub hash_function: HashFunction,
    pub jobs: usize,
    targets_files: Mutex<HashMap<(String, String), Arc<TargetsFile>>>,
}

type TargetsFile = serde_json::Map<String, serde_json::Value>;

impl AnalyseContext {
    #[must_use]
    pub fn new(
        repos: Arc<RepositoryConfig>,
        statistics: Arc<Statistics>,
        tracker: Arc<TaskTracker>,
        target_cache: Arc<dyn TargetCache>,
        hash_function: HashFunction,
        jobs: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            repos,
            result_map: Arc::new(ResultTargetMap::new(jobs)),
            statistics,
            tracker,
            target_cache,
            hash_function,
            jobs,
            targets_files: Mutex::new(HashMap::new()),
        })
    }

    /// The parsed targets file of a module, cached per invocation.
    ///
    /// A missing file is an empty map: every name then denotes a source
    /// file.
    pub(crate) fn targets_file(
        &self,
        repository: &str,
        module: &str,
    ) -> Result<Arc<TargetsFile>, String> {
        let cache_key = (repository.to_string(), module.to_string());
        if let Ok(cache) = self.targets_files.lock() {
            if let Some(found) = cache.get(&cache_key) {
                return Ok(Arc::clone(found));
            }
        }
        let entry = self
            .repos
            .repository(repository)
            .ok_or_else(|| format!("unknown repository `{repository}`"))?;
        let path = if module == "." {
            entry.target_file_name.clone()
        } else {
            format!("{module}/{}", entry.target_file_name)
        };
        let parsed: TargetsFile = match entry.target_root.read_file(&path)? {
            Some(bytes) => serde_json::from_slice::<serde_json::Value>(&bytes)
                .map_err(|e| format!("malformed targets file {path}: {e}"))?
                .as_object()
                .cloned()
                .ok_or_else(|| format!("targets file {path} must contain a map"))?,
            None => TargetsFile::new(),
        };
        let parsed = Arc::new(parsed);
        if let Ok(mut cache) = self.targets_files.lock() {
            cache.insert(cache_key, Arc::clone(&parsed));
        }
        Ok(parsed)
    }
}

/// Create the target map over a context.
#[must_use]
pub fn create_target_map(ctx: &Arc<AnalyseContext>, ts: &TaskHandle) -> TargetMap {
    let ctx = Arc::clone(ctx);
    AsyncMapConsumer::new(
        ts,
        ctx.jobs,
        Box::new(move |_ts, setter, logger, subcaller, key: &ConfiguredTarget| {
            analyse_value_creator(&ctx, setter, logger, subcaller, key);
        }),
    )
}

fn analyse_value_creator(
    ctx: &Arc<AnalyseContext>,
    setter: Setter,
    logger: Logger,
    subcaller: SubCaller,
    key: &ConfiguredTarget,
) {
    let label = key.to_short_string();
    ctx.tracker.start(&label);
    let setter: Setter = {
        let tracker = Arc::clone(&ctx.tracker);
        let label = label.clone();
        Box::new(move |value| {
            tracker.stop(&label);
            setter(value);
        })
    };
    let logger: Logger = {
        let tracker = Arc::clone(&ctx.tracker);
        let inner = Arc::clone(&logger);
        Arc::new(move |msg: &str, fatal: bool| {
            if fatal {
                tracker.stop(&label);
            }
            inner(msg, fatal);
        })
    };

    let targets = match ctx.targets_file(&key.target.repository, &key.target.module) {
        Ok(targets) => targets,
        Err(err) => {
            logger(
                &format!("While reading targets for {}:\n{err}", key.target),
                true,
            );
            return;
        }
    };
    match targets.get(&key.target.name) {
        Some(desc) => {
            let rule_type = desc.get("type");
            let Some(rule_name) = rule_type.and_then(|t| t.as_str()) else {
                logger(
                    &format!("target {} has no rule type", key.target),
                    true,
                );
                return;
            };
            if !rules::handle_built_in(rule_name, desc, key, ctx, subcaller, setter, logger.clone())
            {
                logger(
                    &format!("unknown rule type `{rule_name}` for target {}", key.target),
                    true,
                );
            }
        }
        None => analyse_source_target(ctx, key, setter, &logger),
    }
}

/// A name without a targets-file entry denotes a source file of the
/// workspace root, staged under its own name.
fn analyse_source_target(
    ctx: &Arc<AnalyseContext>,
    key: &ConfiguredTarget,
    setter: Setter,
    logger: &Logger,
) {
    let Some(entry) = ctx.repos.repository(&key.target.repository) else {
        logger(
            &format!("unknown repository `{}`", key.target.repository),
            true,
        );
        return;
    };
    let path = if key.target.module == "." {
        quarry_common::normalize(&key.target.name)
    } else {
        quarry_common::normalize(&format!("{}/{}", key.target.module, key.target.name))
    };
    match entry.workspace_root.contains_file(&path) {
        Ok(true) => {}
        Ok(false) => {
            logger(
                &format!(
                    "target {} is neither a defined target nor a source file",
                    key.target
                ),
                true,
            );
            return;
        }
        Err(err) => {
            logger(&format!("While checking source {path}:\n{err}"), true);
            return;
        }
    }
    let artifact = ArtifactDescription::Local {
        repository: key.target.repository.clone(),
        path,
    };
    let mut stage = std::collections::BTreeMap::new();
    stage.insert(key.target.name.clone(), artifact);
    let effective = key.config.prune(std::iter::empty::<&str>());
    let analysed = AnalysedTarget {
        result: TargetResult {
            artifact_stage: stage.clone(),
            runfiles: stage,
            provides: quarry_expr::Value::Map(std::collections::BTreeMap::new()),
        },
        graph_info: TargetGraphInformation::new(
            ConfiguredTarget::new(key.target.clone(), effective),
            Vec::new(),
        ),
        ..AnalysedTarget::default()
    };
    setter(Arc::new(analysed));
}
