//! `export`: declare a target cacheable under a flexible configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use quarry_expr::Value;

use crate::analysed_target::{AnalysedTarget, TargetGraphInformation};
use crate::configured_target::ConfiguredTarget;
use crate::rules::utils::{entity_from_value, FieldReader};
use crate::target_cache::TargetCacheKey;
use crate::target_map::{AnalyseContext, Logger, Setter, SubCaller};

const FIELDS: [&str; 6] = [
    "config_doc",
    "doc",
    "fixed_config",
    "flexible_config",
    "target",
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
    let Some(flexible_config) = reader.string_list("flexible_config") else {
        return;
    };
    let fixed_expr = reader.optional_expr("fixed_config", serde_json::json!({}));
    let Some(fixed_map) = fixed_expr.as_object().cloned() else {
        logger("fixed_config has to be a map", true);
        return;
    };
    let overlap: Vec<&String> = fixed_map
        .keys()
        .filter(|k| flexible_config.contains(k))
        .collect();
    if !overlap.is_empty() {
        logger(
            &format!("fixed_config and flexible_config must not overlap, found {overlap:?}"),
            true,
        );
        return;
    }
    let Some(target_expr) = reader.required_expr("target") else {
        return;
    };
    let entity = match entity_from_value(
        &Value::from_json(&target_expr),
        &key.target,
        &ctx.repos,
    ) {
        Ok(entity) => entity,
        Err(err) => {
            logger(&format!("Parsing target name failed with:\n{err}"), true);
            return;
        }
    };

    let effective_config = key.config.prune(flexible_config.iter().map(String::as_str));
    let vars: BTreeSet<String> = flexible_config.into_iter().collect();

    // Only content-fixed repositories give reproducible cache keys.
    let eligible = ctx
        .repos
        .repository(&key.target.repository)
        .is_some_and(crate::repo_config::RepositoryEntry::is_content_fixed);
    let cache_key = eligible.then(|| {
        TargetCacheKey::new(
            ctx.hash_function,
            &ConfiguredTarget::new(key.target.clone(), effective_config.clone()),
        )
    });
    if let Some(cache_key) = &cache_key {
        if let Some(hit) = ctx.target_cache.lookup(cache_key) {
            ctx.statistics.increment_exports_cached();
            tracing::debug!(target = %key.target, "export target served from cache");
            let canonical = ctx.result_map.add(
                key.target.clone(),
                effective_config,
                hit,
                Some(cache_key.clone()),
                true,
            );
            setter(canonical);
            return;
        }
        ctx.statistics.increment_exports_uncached();
    } else {
        ctx.statistics.increment_exports_not_eligible();
    }

    let fixed: BTreeMap<String, Value> = fixed_map
        .iter()
        .map(|(k, v)| (k.clone(), Value::from_json(v)))
        .collect();
    let target_config = effective_config.update(&fixed);
    let configured = ConfiguredTarget::new(entity, target_config);

    let continuation = {
        let key = key.clone();
        let ctx = Arc::clone(ctx);
        let configured = configured.clone();
        Box::new(move |values: Vec<Arc<Arc<AnalysedTarget>>>| {
            let dep = &values[0];
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
                tainted: dep.tainted.clone(),
                graph_info,
            };
            let canonical = ctx.result_map.add(
                key.target.clone(),
                effective_config,
                Arc::new(analysed),
                cache_key.clone(),
                true,
            );
            if let Some(cache_key) = &cache_key {
                ctx.target_cache.store(cache_key, &canonical);
            }
            setter(canonical);
        })
    };
    subcaller(vec![configured], continuation, logger);
}
