//! `file_gen` and `symlink`: targets whose single artifact is a literal
//! blob.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use quarry_common::{ArtifactDescription, ObjectType};
use quarry_expr::{Configuration, TargetResult, Value};

use crate::analysed_target::{AnalysedTarget, TargetGraphInformation};
use crate::configured_target::ConfiguredTarget;
use crate::rules::utils::{
    check_tainted_superset, entity_from_value, eval_field, get_tainted, string_fields_functions,
    FieldReader,
};
use crate::target_map::{AnalyseContext, Logger, Setter, SubCaller};

const FIELDS: [&str; 6] = ["arguments_config", "data", "deps", "name", "tainted", "type"];

pub(crate) fn handle(
    desc: &serde_json::Value,
    key: &ConfiguredTarget,
    ctx: &Arc<AnalyseContext>,
    subcaller: SubCaller,
    setter: Setter,
    logger: Logger,
    blob_type: ObjectType,
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
    let Some(deps_value) = eval_field(
        "deps",
        &deps_expr,
        &param_config,
        &quarry_expr::FunctionMap::new(),
        &logger,
    ) else {
        return;
    };
    let Ok(deps_list) = deps_value.as_list() else {
        logger(
            &format!(
                "Expected deps to evaluate to a list of targets, but found {}",
                deps_value.type_name()
            ),
            true,
        );
        return;
    };
    let mut dependency_keys = Vec::with_capacity(deps_list.len());
    let mut transition_keys = Vec::with_capacity(deps_list.len());
    for dep in deps_list {
        let entity = match entity_from_value(dep, &key.target, &ctx.repos) {
            Ok(entity) => entity,
            Err(err) => {
                logger(&format!("Parsing dep entry failed with:\n{err}"), true);
                return;
            }
        };
        dependency_keys.push(ConfiguredTarget::new(entity.clone(), key.config.clone()));
        transition_keys.push(ConfiguredTarget::new(entity, Configuration::empty()));
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
                blob_type,
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
    transition_keys: Vec<ConfiguredTarget>,
    values: Vec<Arc<Arc<AnalysedTarget>>>,
    param_vars: Vec<String>,
    setter: Setter,
    logger: &Logger,
    blob_type: ObjectType,
) {
    let reader = FieldReader::new(desc, logger);
    let param_config = key.config.prune(param_vars.iter().map(String::as_str));

    // Dependencies stay addressable for the `outs`/`runfiles` host
    // functions, under the current configuration and the empty transition.
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
    let name_expr = reader.optional_expr("name", serde_json::json!("out.txt"));
    let Some(name_value) = eval_field("name", &name_expr, &param_config, &functions, logger) else {
        return;
    };
    let Ok(name) = name_value.as_str() else {
        logger(
            &format!(
                "name should evaluate to a string, but got {}",
                name_value.type_name()
            ),
            true,
        );
        return;
    };
    let data_expr = reader.optional_expr("data", serde_json::json!(""));
    let Some(data_value) = eval_field("data", &data_expr, &param_config, &functions, logger) else {
        return;
    };
    let Ok(data) = data_value.as_str() else {
        logger(
            &format!(
                "data should evaluate to a string, but got {}",
                data_value.type_name()
            ),
            true,
        );
        return;
    };
    if blob_type == ObjectType::Symlink && !quarry_common::is_non_upwards(data) {
        logger(
            &format!("data string {data:?} does not constitute a non-upwards symlink target path"),
            true,
        );
        return;
    }

    let mut stage = BTreeMap::new();
    stage.insert(
        name.to_string(),
        ArtifactDescription::Known {
            digest: ctx.hash_function.hash_blob(data.as_bytes()),
            object_type: blob_type,
        },
    );
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
        blobs: vec![data.to_string()],
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
