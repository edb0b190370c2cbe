//! Shared plumbing of the built-in rules.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use quarry_common::{ArtifactDescription, EntityName};
use quarry_expr::{Configuration, EvalError, Evaluator, FunctionMap, Value};

use crate::analysed_target::AnalysedTarget;
use crate::configured_target::ConfiguredTarget;
use crate::repo_config::RepositoryConfig;
use crate::target_map::Logger;

/// Reader over a target description with strict field validation.
pub(crate) struct FieldReader<'a> {
    desc: &'a serde_json::Value,
    logger: &'a Logger,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(desc: &'a serde_json::Value, logger: &'a Logger) -> Self {
        Self { desc, logger }
    }

    /// Exact-field-set check: any field outside `allowed` is fatal.
    pub(crate) fn expect_fields(&self, allowed: &[&str]) -> bool {
        let Some(map) = self.desc.as_object() else {
            (self.logger)("target description must be a map", true);
            return false;
        };
        for field in map.keys() {
            if !allowed.contains(&field.as_str()) {
                (self.logger)(
                    &format!("unknown field `{field}`; expected one of {allowed:?}"),
                    true,
                );
                return false;
            }
        }
        true
    }

    /// A field that must be a list of strings; absent means empty.
    pub(crate) fn string_list(&self, field: &str) -> Option<Vec<String>> {
        match self.desc.get(field) {
            None => Some(Vec::new()),
            Some(serde_json::Value::Array(items)) => {
                let strings: Option<Vec<String>> = items
                    .iter()
                    .map(|item| item.as_str().map(ToString::to_string))
                    .collect();
                if strings.is_none() {
                    (self.logger)(
                        &format!("field `{field}` must be a list of strings"),
                        true,
                    );
                }
                strings
            }
            Some(other) => {
                (self.logger)(
                    &format!("field `{field}` must be a list of strings, found {other}"),
                    true,
                );
                None
            }
        }
    }

    /// A field as an expression, with a default when absent.
    pub(crate) fn optional_expr(&self, field: &str, default: serde_json::Value) -> serde_json::Value {
        self.desc.get(field).cloned().unwrap_or(default)
    }

    /// A field that must be present.
    pub(crate) fn required_expr(&self, field: &str) -> Option<serde_json::Value> {
        let value = self.desc.get(field).cloned();
        if value.is_none() {
            (self.logger)(&format!("mandatory field `{field}` is missing"), true);
        }
        value
    }
}

/// Evaluate a field expression, logging failures under the field name.
pub(crate) fn eval_field(
    field: &str,
    expr: &serde_json::Value,
    config: &Configuration,
    functions: &FunctionMap,
    logger: &Logger,
) -> Option<Value> {
    match Evaluator::new(functions).eval(expr, config) {
        Ok(value) => Some(value),
        Err(err) => {
            logger(&format!("While evaluating {field}:\n{err}"), true);
            None
        }
    }
}

/// Read and evaluate the `tainted` field into a label set.
pub(crate) fn get_tainted(
    reader: &FieldReader,
    param_config: &Configuration,
    logger: &Logger,
) -> Option<BTreeSet<String>> {
    let expr = reader.optional_expr("tainted", serde_json::json!([]));
    let value = eval_field("tainted", &expr, param_config, &FunctionMap::new(), logger)?;
    let Ok(items) = value.as_list() else {
        logger("tainted must evaluate to a list of strings", true);
        return None;
    };
    let mut tainted = BTreeSet::new();
    for item in items {
        match item.as_str() {
            Ok(label) => {
                tainted.insert(label.to_string());
            }
            Err(_) => {
                logger("tainted must evaluate to a list of strings", true);
                return None;
            }
        }
    }
    Some(tainted)
}

/// A target must be tainted with every label of each dependency.
pub(crate) fn check_tainted_superset(
    tainted: &BTreeSet<String>,
    deps: &[Arc<Arc<AnalysedTarget>>],
    logger: &Logger,
) -> bool {
    for dep in deps {
        if !dep.tainted.is_subset(tainted) {
            logger(
                "Not tainted with all strings the dependencies are tainted with",
                true,
            );
            return false;
        }
    }
    true
}

/// Resolve a dependency expression value into an entity name.
///
/// Plain strings name targets of the current module; lists are
/// `[module, name]` or `[repository, module, name]`, with the repository
/// resolved through the current repository's name mapping.
pub(crate) fn entity_from_value(
    value: &Value,
    current: &EntityName,
    repos: &RepositoryConfig,
) -> Result<EntityName, String> {
    let json = value.to_json();
    let parsed = EntityName::parse(&json, &current.repository, &current.module)
        .map_err(|e| e.to_string())?;
    if parsed.repository == current.repository {
        Ok(parsed)
    } else {
        let mapped = repos
            .repository(&current.repository)
            .map_or(parsed.repository.clone(), |entry| {
                entry.global_name(&parsed.repository).to_string()
            });
        if repos.repository(&mapped).is_none() {
            return Err(format!("unknown repository `{mapped}`"));
        }
        Ok(EntityName::new(mapped, parsed.module, parsed.name))
    }
}

/// Merge additions into a stage; a duplicate path with a different
/// artifact is a staging conflict reported as the offending path.
pub(crate) fn merge_stage(
    stage: &mut BTreeMap<String, ArtifactDescription>,
    additions: &BTreeMap<String, ArtifactDescription>,
) -> Result<(), String> {
    for (path, artifact) in additions {
        match stage.get(path) {
            Some(present) if present != artifact => return Err(path.clone()),
            Some(_) => {}
            None => {
                stage.insert(path.clone(), artifact.clone());
            }
        }
    }
    Ok(())
}

/// A staged path that is also a proper prefix of another staged path.
pub(crate) fn tree_conflict(stage: &BTreeMap<String, ArtifactDescription>) -> Option<String> {
    let normalized: BTreeSet<String> = stage
        .keys()
        .map(|path| quarry_common::normalize(path))
        .collect();
    for path in &normalized {
        let mut prefix = String::new();
        for segment in path.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            if prefix != *path && normalized.contains(&prefix) {
                return Some(prefix);
            }
        }
    }
    None
}

/// Host functions `outs` and `runfiles` over the resolved dependencies.
///
/// The form `{"type": "outs", "dep": <name>}` evaluates to the sorted
/// list of artifact paths of the named dependency; `runfiles` does the
/// same over the runfile stage. Dependencies are looked up under the
/// current configuration and under the empty transition.
pub(crate) fn string_fields_functions(
    key: &ConfiguredTarget,
    repos: &Arc<RepositoryConfig>,
    deps_by_transition: Arc<HashMap<ConfiguredTarget, Arc<Arc<AnalysedTarget>>>>,
) -> FunctionMap {
    let stage_keys = |runfiles: bool| {
        let key = key.clone();
        let repos = Arc::clone(repos);
        let deps = Arc::clone(&deps_by_transition);
        move |evaluator: &Evaluator,
              config: &Configuration,
              expr: &serde_json::Value|
              -> quarry_expr::Result<Value> {
            let dep_expr = expr
                .get("dep")
                .ok_or_else(|| EvalError::Function("missing field `dep`".to_string()))?;
            let dep_value = evaluator.eval(dep_expr, config)?;
            let entity = entity_from_value(&dep_value, &key.target, &repos)
                .map_err(EvalError::Function)?;
            let resolved = deps
                .get(&ConfiguredTarget::new(entity.clone(), key.config.clone()))
                .or_else(|| {
                    deps.get(&ConfiguredTarget::new(
                        entity.clone(),
                        Configuration::empty(),
                    ))
                })
                .ok_or_else(|| {
                    EvalError::Function(format!("`{entity}` is not a declared dependency"))
                })?;
            let stage = if runfiles {
                resolved.runfiles()
            } else {
                resolved.artifacts()
            };
            Ok(Value::List(
                stage
                    .keys()
                    .map(|path| Value::String(path.clone()))
                    .collect(),
            ))
        }
    };
    FunctionMap::new()
        .with("outs", Arc::new(stage_keys(false)))
        .with("runfiles", Arc::new(stage_keys(true)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::{HashFunction, ObjectType};

    fn known(content: &str) -> ArtifactDescription {
        ArtifactDescription::Known {
            digest: HashFunction::Native.hash_blob(content.as_bytes()),
            object_type: ObjectType::File,
        }
    }

    #[test]
    fn merge_detects_conflicting_duplicates() {
        let mut stage = BTreeMap::new();
        stage.insert("a".to_string(), known("one"));
        let mut same = BTreeMap::new();
        same.insert("a".to_string(), known("one"));
        assert!(merge_stage(&mut stage, &same).is_ok());
        let mut different = BTreeMap::new();
        different.insert("a".to_string(), known("two"));
        assert_eq!(merge_stage(&mut stage, &different).unwrap_err(), "a");
    }

    #[test]
    fn tree_conflicts_report_the_subtree() {
        let mut stage = BTreeMap::new();
        stage.insert("a/b".to_string(), known("x"));
        stage.insert("a".to_string(), known("y"));
        assert_eq!(tree_conflict(&stage).as_deref(), Some("a"));

        let mut clean = BTreeMap::new();
        clean.insert("a/b".to_string(), known("x"));
        clean.insert("a/c".to_string(), known("y"));
        clean.insert("ab".to_string(), known("z"));
        assert!(tree_conflict(&clean).is_none());
    }
}
