//! `generic`: a single action described by literal commands and outputs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use quarry_common::ActionDescription;
use quarry_expr::{Configuration, FunctionMap, TargetResult, Value};

use crate::analysed_target::{AnalysedTarget, TargetGraphInformation};
use crate::configured_target::ConfiguredTarget;
use crate::rules::utils::{
    check_tainted_superset, entity_from_value, eval_field, get_tainted, string_fields_functions,
    FieldReader,
};
use crate::target_map::{AnalyseContext, Logger, Setter, SubCaller};

const FIELDS: [&str; 11] = [
    "arguments_config",
    "cmds",
    "deps",
    "env",
    "execution properties",
    "out_dirs",
    "outs",
    "sh -c",
    "tainted",
    "timeout scaling",
    "type",
];

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
    let Some(deps_value) =
        eval_field("deps", &deps_expr, &param_config, &FunctionMap::new(), &logger)
    else {
        return;
    };
    let Ok(deps_list) = deps_value.as_list() else {
        logger("Expected deps to evaluate to a list of targets", true);
        return;
    };
    let mut dependency_keys = Vec::with_capacity(deps_list.len());
    let mut transition_keys = Vec::with_capacity(deps_list.len());
    for dep in deps_list {
        match entity_from_value(dep, &key.target, &ctx.repos) {
            Ok(entity) => {
                dependency_keys.push(ConfiguredTarget::new(entity.clone(), key.config.clone()));
                transition_keys.push(ConfiguredTarget::new(entity, Configuration::empty()));
            }
            Err(err) => {
                logger(&format!("Parsing dep entry failed with:\n{err}"), true);
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
                transition_keys,
                values,
                param_vars,
                setter,
                &logger,
            );
        })
    };
    subcaller(dependency_keys, continuation, logger);
}

/// A list field that must evaluate to strings.
fn string_list_field(
    reader: &FieldReader,
    field: &str,
    param_config: &Configuration,
    functions: &FunctionMap,
    logger: &Logger,
) -> Option<Vec<String>> {
    let expr = reader.optional_expr(field, serde_json::json!([]));
    let value = eval_field(field, &expr, param_config, functions, logger)?;
    let Ok(items) = value.as_list() else {
        logger(
            &format!("{field} has to evaluate to a list of strings"),
            true,
        );
        return None;
    };
    let mut strings = Vec::with_capacity(items.len());
    for item in items {
        match item.as_str() {
            Ok(s) => strings.push(s.to_string()),
            Err(_) => {
                logger(
                    &format!("{field} has to evaluate to a list of strings"),
                    true,
                );
                return None;
            }
        }
    }
    Some(strings)
}

fn with_deps(
    desc: &serde_json::Value,
    key: &ConfiguredTarget,
    ctx: &Arc<AnalyseContext>,
    dependency_keys: &[ConfiguredTarget],
    transition_keys: Vec<ConfiguredTarget>,
    values: Vec<Arc<Arc<AnalysedTarget>>>,
    param_vars: Vec<String>,
    setter: Setter,
    logger: &Logger,
) {
    let reader = FieldReader::new(desc, logger);
    let param_config = key.config.prune(param_vars.iter().map(String::as_str));

    let mut deps_by_transition: HashMap<ConfiguredTarget, Arc<Arc<AnalysedTarget>>> =
        HashMap::with_capacity(2 * values.len());
    for ((dep_key, transition_key), value) in dependency_keys
        .iter()
        .zip(transition_keys)
        .zip(values.iter())
    {
        deps_by_transition.insert(dep_key.clone(), Arc::clone(value));
        deps_by_transition.insert(transition_key, Arc::clone(value));
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

    let functions = string_fields_functions(key, &ctx.repos, Arc::new(deps_by_transition));

    let Some(mut outs) = string_list_field(&reader, "outs", &param_config, &functions, logger)
    else {
        return;
    };
    let Some(mut out_dirs) =
        string_list_field(&reader, "out_dirs", &param_config, &functions, logger)
    else {
        return;
    };
    if outs.is_empty() && out_dirs.is_empty() {
        logger(
            r#"At least one of "outs" and "out_dirs" must be specified for "generic""#,
            true,
        );
        return;
    }
    outs.sort();
    outs.dedup();
    out_dirs.sort();
    out_dirs.dedup();
    let repeated: Vec<&String> = outs
        .iter()
        .filter(|out| out_dirs.binary_search(*out).is_ok())
        .collect();
    if !repeated.is_empty() {
        logger(
            &format!(
                "outs and out_dirs for generic must be disjoint. Found repeated entries:\n{repeated:?}"
            ),
            true,
        );
        return;
    }

    let Some(cmds) = string_list_field(&reader, "cmds", &param_config, &functions, logger) else {
        return;
    };
    let mut command = String::new();
    for line in &cmds {
        command.push_str(line);
        command.push('\n');
    }

    let env_expr = reader.optional_expr("env", serde_json::json!({}));
    let Some(env_value) = eval_field("env", &env_expr, &param_config, &functions, logger) else {
        return;
    };
    let Ok(env_map) = env_value.as_map() else {
        logger("env has to evaluate to a map of strings", true);
        return;
    };
    let mut env = BTreeMap::new();
    for (name, value) in env_map {
        match value.as_str() {
            Ok(s) => {
                env.insert(name.clone(), s.to_string());
            }
            Err(_) => {
                logger("env has to evaluate to a map of strings", true);
                return;
            }
        }
    }

    // "sh -c": list of strings or null; empty and null mean the default.
    let sh_expr = reader.optional_expr("sh -c", serde_json::json!([]));
    let Some(sh_value) = eval_field("sh -c", &sh_expr, &param_config, &functions, logger) else {
        return;
    };
    let sh: Vec<String> = match &sh_value {
        Value::Null => Vec::new(),
        Value::List(items) => {
            let mut sh = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Ok(s) => sh.push(s.to_string()),
                    Err(_) => {
                        logger("sh -c has to evaluate to a list of strings or null", true);
                        return;
                    }
                }
            }
            sh
        }
        _ => {
            logger("sh -c has to evaluate to a list of strings or null", true);
            return;
        }
    };
    let sh = if sh.is_empty() {
        vec!["sh".to_string(), "-c".to_string()]
    } else {
        sh
    };

    let scale_expr = reader.optional_expr("timeout scaling", serde_json::json!(1.0));
    let Some(scale_value) =
        eval_field("timeout scaling", &scale_expr, &param_config, &functions, logger)
    else {
        return;
    };
    let timeout_scale = match scale_value {
        Value::Number(n) => n,
        Value::Null => 1.0,
        _ => {
            logger(
                "timeout scaling has to evaluate to a number (or null for default)",
                true,
            );
            return;
        }
    };

    let props_expr = reader.optional_expr("execution properties", serde_json::json!({}));
    let Some(props_value) = eval_field(
        "execution properties",
        &props_expr,
        &param_config,
        &functions,
        logger,
    ) else {
        return;
    };
    let mut execution_properties = BTreeMap::new();
    match &props_value {
        Value::Null => {}
        Value::Map(map) => {
            for (name, value) in map {
                match value.as_str() {
                    Ok(s) => {
                        execution_properties.insert(name.clone(), s.to_string());
                    }
                    Err(_) => {
                        logger(
                            "execution properties has to evaluate to a map of strings (or null for default)",
                            true,
                        );
                        return;
                    }
                }
            }
        }
        _ => {
            logger(
                "execution properties has to evaluate to a map of strings (or null for default)",
                true,
            );
            return;
        }
    }

    // Inputs: runfiles of all dependencies, then artifacts; artifacts win
    // on overlap.
    let mut inputs = BTreeMap::new();
    for dep in &values {
        for (path, artifact) in dep.runfiles() {
            inputs.insert(path.clone(), artifact.clone());
        }
    }
    for dep in &values {
        for (path, artifact) in dep.artifacts() {
            inputs.insert(path.clone(), artifact.clone());
        }
    }

    let mut argv = sh;
    argv.push(command);
    let action = Arc::new(ActionDescription::new(
        ctx.hash_function,
        argv,
        env,
        inputs,
        outs.clone(),
        out_dirs.clone(),
        None,
        false,
        timeout_scale,
        execution_properties,
    ));
    let mut artifact_stage = BTreeMap::new();
    for path in outs.iter().chain(out_dirs.iter()) {
        artifact_stage.insert(path.clone(), action.output_artifact(path));
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
            artifact_stage,
            runfiles: BTreeMap::new(),
            provides: Value::Map(BTreeMap::new()),
        },
        actions: vec![action],
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
