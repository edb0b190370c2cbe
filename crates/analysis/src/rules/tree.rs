//! `tree`: stage all dependencies into a single directory artifact.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use quarry_expr::{FunctionMap, TargetResult, Value};

use crate::analysed_target::{AnalysedTarget, StagedTree, TargetGraphInformation};
use crate::configured_target::ConfiguredTarget;
use crate::rules::utils::{
    check_tainted_superset, entity_from_value, eval_field, get_tainted, merge_stage,
    tree_conflict, FieldReader,
};
use crate::target_map::{AnalyseContext, Logger, Setter, SubCaller};

const FIELDS: [&str; 5] = ["arguments_config", "deps", "name", "tainted", "type"];

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

    let deps_expr = reader.optional_expr("deps", serde_json::json!([]));
    let Some(deps_value) = eval_field("deps", &deps_expr, &param_config, &FunctionMap::new(), &logger)
    else {
        return;
    };
    let Ok(deps_list) = deps_value.as_list() else {
        logger("Expected deps to evaluate to a list of targets", true);
        return;
    };
    let mut dependency_keys = Vec::with_capacity(deps_list.len());
    for dep in deps_list {
        match entity_from_value(dep, &key.target, &ctx.repos) {
            Ok(entity) => {
                dependency_keys.push(ConfiguredTarget::new(entity, key.config.clone()));
            }
            Err(err) => {
                logger(&format!("Parsing dep entry failed with:\n{err}"), true);
                return;
            }
        }
    }
    let name_expr = reader.optional_expr("name", serde_json::json!(""));
    let Some(name_value) = eval_field("name", &name_expr, &param_config, &FunctionMap::new(), &logger)
    else {
        return;
    };
    let Ok(name) = name_value.as_str().map(ToString::to_string) else {
        logger(
            &format!(
                "Expected name to evaluate to a string, but got {}",
                name_value.type_name()
            ),
            true,
        );
        return;
    };

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
                &name,
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
    name: &str,
    setter: Setter,
    logger: &Logger,
) {
    let reader = FieldReader::new(desc, logger);
    let param_config = key.config.prune(param_vars.iter().map(String::as_str));
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

    // Merge each dependency's runfiles overlaid by its artifacts; equal
    // duplicates are fine, diverging ones are a staging conflict.
    let mut stage = BTreeMap::new();
    for dep in &values {
        let mut dep_stage = dep.runfiles().clone();
        for (path, artifact) in dep.artifacts() {
            dep_stage.insert(path.clone(), artifact.clone());
        }
        if let Err(path) = merge_stage(&mut stage, &dep_stage) {
            logger(&format!("Staging conflict for path {path}"), true);
            return;
        }
    }
    if let Some(subtree) = tree_conflict(&stage) {
        logger(&format!("TREE conflict on subtree {subtree}"), true);
        return;
    }

    let content: BTreeMap<_, _> = stage
        .into_iter()
        .map(|(path, artifact)| (quarry_common::normalize(&path), artifact))
        .collect();
    let tree = Arc::new(StagedTree::new(ctx.hash_function, content));
    ctx.statistics.increment_trees_analysed();

    let mut result_stage = BTreeMap::new();
    result_stage.insert(name.to_string(), tree.artifact());
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
            artifact_stage: result_stage.clone(),
            runfiles: result_stage,
            provides: Value::Map(BTreeMap::new()),
        },
        actions: Vec::new(),
        blobs: Vec::new(),
        trees: vec![tree],
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
