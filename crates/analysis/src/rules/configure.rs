//! `configure`: analyse a target under an updated configuration.

use std::collections::BTreeSet;
use std::sync::Arc;

use quarry_expr::{Configuration, FunctionMap};

use crate::analysed_target::{AnalysedTarget, TargetGraphInformation};
use crate::configured_target::ConfiguredTarget;
use crate::rules::utils::{entity_from_value, eval_field, get_tainted, FieldReader};
use crate::target_map::{AnalyseContext, Logger, Setter, SubCaller};

const FIELDS: [&str; 5] = ["arguments_config", "config", "tainted", "target", "type"];

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

    let Some(target_expr) = reader.required_expr("target") else {
        return;
    };
    let Some(target_value) =
        eval_field("target", &target_expr, &param_config, &FunctionMap::new(), &logger)
    else {
        return;
    };
    let entity = match entity_from_value(&target_value, &key.target, &ctx.repos) {
        Ok(entity) => entity,
        Err(err) => {
            logger(&format!("Parsing target name failed with:\n{err}"), true);
            return;
        }
    };

    let Some(tainted) = get_tainted(&reader, &param_config, &logger) else {
        return;
    };

    let config_expr = reader.optional_expr("config", serde_json::json!({}));
    let Some(config_value) =
        eval_field("config", &config_expr, &param_config, &FunctionMap::new(), &logger)
    else {
        return;
    };
    let Ok(config_map) = config_value.as_map() else {
        logger(
            &format!(
                "'config' must evaluate to a map, but found {}",
                config_value.type_name()
            ),
            true,
        );
        return;
    };
    let transition = Configuration::new(config_map.clone());
    let target_config = key.config.update(config_map);
    let configured = ConfiguredTarget::new(entity, target_config);

    let continuation = {
        let key = key.clone();
        let ctx = Arc::clone(ctx);
        let logger = Arc::clone(&logger);
        let configured = configured.clone();
        Box::new(move |values: Vec<Arc<Arc<AnalysedTarget>>>| {
            let dep = &values[0];
            if !dep.tainted.is_subset(&tainted) {
                logger(
                    "Not tainted with all strings the dependencies are tainted with",
                    true,
                );
                return;
            }
            // Variables the transition fixes are not consumed from the
            // incoming configuration.
            let mut vars: BTreeSet<String> = dep
                .vars
                .iter()
                .filter(|v| !transition.variable_fixed(v))
                .cloned()
                .collect();
            vars.extend(param_vars);
            let effective_config = key.config.prune(vars.iter().map(String::as_str));

            let graph_info = TargetGraphInformation::new(
                ConfiguredTarget::new(key.target.clone(), effective_config.clone()),
                vec![dep
                    .graph_info
                    .node
                    .clone()
                    .unwrap_or_else(|| configured.clone())],
            );
            let analysed = AnalysedTarget {
                result: dep.result.clone(),
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
        })
    };
    subcaller(vec![configured], continuation, logger);
}
