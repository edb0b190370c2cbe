//! `install`: compose a stage from dependencies, single files and
//! directories.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use quarry_common::EntityName;
use quarry_expr::{FunctionMap, TargetResult, Value};

use crate::analysed_target::{AnalysedTarget, TargetGraphInformation};
use crate::configured_target::ConfiguredTarget;
use crate::rules::utils::{
    check_tainted_superset, entity_from_value, eval_field, get_tainted, merge_stage,
    tree_conflict, FieldReader,
};
use crate::target_map::{AnalyseContext, Logger, Setter, SubCaller};

const FIELDS: [&str; 6] = ["arguments_config", "deps", "dirs", "files", "tainted", "type"];

pub(crate) fn handle(
    desc: &serde_json::Value,
    key: &ConfiguredTarget,
    ctx: &Arc<AnalyseContext>,
    subcaller: SubCaller,
    setter: Setter,
    logger: Logger,
) {
    let reader = FieldReader::new(desc, &logger);
    if !reader.expect_fields(&FIELDS) {
        return;
    }
    let Some(param_vars) = reader.string_list("arguments_config") else {
        return;
    };
    let param_config = key.config.prune(param_vars.iter().map(String::as_str));
    let functions = FunctionMap::new();

    let mut dependency_keys: Vec<ConfiguredTarget> = Vec::new();

    // deps: a list of target names contributing their runfiles.
    let deps_expr = reader.optional_expr("deps", serde_json::json!([]));
    let Some(deps_value) = eval_field("deps", &deps_expr, &param_config, &functions, &logger) else {
        return;
    };
    let Ok(deps_list) = deps_value.as_list() else {
        logger("Expected deps to evaluate to a list of targets", true);
        return;
    };
    let mut deps: Vec<EntityName> = Vec::with_capacity(deps_list.len());
    for dep in deps_list {
        match entity_from_value(dep, &key.target, &ctx.repos) {
            Ok(entity) => {
                dependency_keys.push(ConfiguredTarget::new(entity.clone(), key.config.clone()));
                deps.push(entity);
            }
            Err(err) => {
                logger(&format!("Parsing dep entry failed with:\n{err}"), true);
                return;
            }
        }
    }

    // files: a map from staging path to a target expression.
    let files_expr = reader.optional_expr("files", serde_json::json!({}));
    let Some(files_map) = files_expr.as_object() else {
        logger("Expected files to be a map of target expressions", true);
        return;
    };
    let mut files: Vec<(String, EntityName)> = Vec::with_capacity(files_map.len());
    for (path, dep_expr) in files_map {
        let Some(dep_value) = eval_field(
            &format!("files entry for {path}"),
            dep_expr,
            &param_config,
            &functions,
            &logger,
        ) else {
            return;
        };
        match entity_from_value(&dep_value, &key.target, &ctx.repos) {
            Ok(entity) => {
                dependency_keys.push(ConfiguredTarget::new(entity.clone(), key.config.clone()));
                files.push((path.clone(), entity));
            }
            Err(err) => {
                logger(
                    &format!("Parsing file entry for {path} failed with:\n{err}"),
                    true,
                );
                return;
            }
        }
    }

    // dirs: a list of [target, path] pairs staged wholesale.
    let dirs_expr = reader.optional_expr("dirs", serde_json::json!([]));
    let Some(dirs_value) = eval_field("dirs", &dirs_expr, &param_config, &functions, &logger) else {
        return;
    };
    let Ok(dirs_list) = dirs_value.as_list() else {
        logger(
            "Expected dirs to evaluate to a list of target-path pairs",
            true,
        );
        return;
    };
    let mut dirs: Vec<(EntityName, String)> = Vec::with_capacity(dirs_list.len());
    for entry in dirs_list {
        let pair = match entry.as_list() {
            Ok([target, Value::String(path)]) => (target, path.clone()),
            _ => {
                logger(
                    "Expected dirs to evaluate to a list of target-path pairs",
                    true,
                );
                return;
            }
        };
        match entity_from_value(pair.0, &key.target, &ctx.repos) {
            Ok(entity) => {
                dependency_keys.push(ConfiguredTarget::new(entity.clone(), key.config.clone()));
                dirs.push((entity, pair.1));
            }
            Err(err) => {
                logger(
                    &format!("Parsing dir entry for {} failed with:\n{err}", pair.1),
                    true,
                );
                return;
            }
        }
    }

    let continuation = {
        let desc = desc.clone();
        let key = key.clone();
        let ctx = Arc::clone(ctx);
        let logger = Arc::clone(&logger);
        let dependency_keys = dependency_keys.clone();
        Box::new(move |values: Vec<Arc<Arc<AnalysedTarget>>>| {
            with_deps(
                &desc,
                &key,
                &ctx,
                &dependency_keys,
                values,
                param_vars,
                &deps,
                &files,
                &dirs,
                setter,
                &logger,
            );
        })
    };
    subcaller(dependency_keys, continuation, logger);
}

fn with_deps(
    desc: &serde_json::Value,
    key: &ConfiguredTarget,
    ctx: &Arc<AnalyseContext>,
    dependency_keys: &[ConfiguredTarget],
    values: Vec<Arc<Arc<AnalysedTarget>>>,
    param_vars: Vec<String>,
    deps: &[EntityName],
    files: &[(String, EntityName)],
    dirs: &[(EntityName, String)],
    setter: Setter,
    logger: &Logger,
) {
    let reader = FieldReader::new(desc, logger);
    let param_config = key.config.prune(param_vars.iter().map(String::as_str));
    let mut deps_by_target: HashMap<&EntityName, &Arc<AnalysedTarget>> =
        HashMap::with_capacity(values.len());
    for (dep_key, value) in dependency_keys.iter().zip(values.iter()) {
        deps_by_target.insert(&dep_key.target, &**value);
    }

    let Some(tainted) = get_tainted(&reader, &param_config, logger) else {
        return;
    };
    if !check_tainted_superset(&tainted, &values, logger) {
        return;
    }

    let mut vars: BTreeSet<String> = param_vars.into_iter().collect();
    for dep in &values {
        vars.extend(dep.vars.iter().cloned());
    }
    let effective_config = key.config.prune(vars.iter().map(String::as_str));

    // Stage deps: runfiles only.
    let mut stage = BTreeMap::new();
    for dep in deps {
        let Some(resolved) = deps_by_target.get(dep) else {
            continue;
        };
        if let Err(path) = merge_stage(&mut stage, resolved.runfiles()) {
            logger(&format!("Staging conflict for path {path}"), true);
            return;
        }
    }

    // Stage files: exactly one artifact each, runfiles as fallback.
    for (path, target) in files {
        if stage.contains_key(path) {
            logger(&format!("Staging conflict for path {path}"), true);
            return;
        }
        let Some(resolved) = deps_by_target.get(target) else {
            continue;
        };
        let artifacts = if resolved.artifacts().is_empty() {
            resolved.runfiles()
        } else {
            resolved.artifacts()
        };
        if artifacts.is_empty() {
            logger(
                &format!("No artifacts or runfiles for {target} to be staged to {path}"),
                true,
            );
            return;
        }
        if artifacts.len() != 1 {
            logger(
                &format!("Not precisely one entry for {target} to be staged to {path}"),
                true,
            );
            return;
        }
        if let Some(artifact) = artifacts.values().next() {
            stage.insert(path.clone(), artifact.clone());
        }
    }

    // Stage dirs: artifacts take precedence, runfiles fill the rest.
    for (target, dir_path) in dirs {
        let Some(resolved) = deps_by_target.get(target) else {
            continue;
        };
        let mut subdir_stage = BTreeMap::new();
        for (path, artifact) in resolved.artifacts() {
            subdir_stage.insert(
                quarry_common::normalize(&format!("{dir_path}/{path}")),
                artifact.clone(),
            );
        }
        for (path, artifact) in resolved.runfiles() {
            subdir_stage
                .entry(quarry_common::normalize(&format!("{dir_path}/{path}")))
                .or_insert_with(|| artifact.clone());
        }
        if let Err(path) = merge_stage(&mut stage, &subdir_stage) {
            logger(&format!("Staging conflict for path {path}"), true);
            return;
        }
    }

    if let Some(subtree) = tree_conflict(&stage) {
        logger(&format!("TREE conflict on subtree {subtree}"), true);
        return;
    }

    let graph_info = TargetGraphInformation::new(
        ConfiguredTarget::new(key.target.clone(), effective_config.clone()),
        values
            .iter()
            .zip(dependency_keys)
            .map(|(dep, fallback)| dep.graph_info.node.clone().unwrap_or_else(|| fallback.clone()))
            .collect(),
    );
    let analysed = AnalysedTarget {
        result: TargetResult {
            artifact_stage: stage.clone(),
            runfiles: stage,
            provides: Value::Map(BTreeMap::new()),
        },
        actions: Vec::new(),
        blobs: Vec::new(),
        trees: Vec::new(),
        vars,
        tainted,
        graph_info,
    };
    let canonical = ctx.result_map.add(
        key.target.clone(),
        effective_config,
        Arc::new(analysed),
        None,
        false,
    );
    setter(canonical);
}
