//! Sharded collection of analysed targets by canonical configuration.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use quarry_common::{ActionDescription, ActionIdentifier, EntityName};
use quarry_expr::Configuration;

use crate::analysed_target::AnalysedTarget;
use crate::configured_target::ConfiguredTarget;
use crate::target_cache::TargetCacheKey;

#[derive(Default)]
struct Shard {
    targets: HashMap<ConfiguredTarget, Arc<AnalysedTarget>>,
    cache_targets: HashMap<TargetCacheKey, Arc<AnalysedTarget>>,
    export_targets: HashSet<ConfiguredTarget>,
    num_actions: usize,
    num_blobs: usize,
    num_trees: usize,
}

/// The collected output of analysis: everything the builder needs.
#[derive(Debug, Default)]
pub struct ActionGraphContent {
    pub actions: Vec<Arc<ActionDescription>>,
    pub blobs: Vec<String>,
    pub trees: Vec<Arc<crate::analysed_target::StagedTree>>,
    /// Per action, the configured targets that produced it with the
    /// position of the action within each target.
    pub origins: HashMap<ActionIdentifier, Vec<(ConfiguredTarget, usize)>>,
}

/// Map collecting analysed targets for their canonical configuration.
///
/// Insertion is per-shard insert-once: the first analysed target stored
/// for a `(target, effective configuration)` pair wins and is returned to
/// every later caller; the action/blob/tree counters advance only on
/// first insertion.
pub struct ResultTargetMap {
    shards: Vec<Mutex<Shard>>,
}

impl ResultTargetMap {
    /// Create a map with `2 * jobs + 1` shards.
    #[must_use]
    pub fn new(jobs: usize) -> Self {
        let width = (2 * jobs + 1).max(1);
        Self {
            shards: (0..width).map(|_| Mutex::new(Shard::default())).collect(),
        }
    }

    fn shard_of(&self, name: &EntityName) -> usize {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        name.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Insert an analysed target for its effective configuration.
    ///
    /// Returns the canonical instance: the given one on first insertion,
    /// the already-present one otherwise.
    pub fn add(
        &self,
        target: EntityName,
        effective_config: Configuration,
        result: Arc<AnalysedTarget>,
        cache_key: Option<TargetCacheKey>,
        is_export: bool,
    ) -> Arc<AnalysedTarget> {
        let shard_index = self.shard_of(&target);
        let key = ConfiguredTarget::new(target, effective_config);
        let Ok(mut shard) = self.shards[shard_index].lock() else {
            return result;
        };
        let entry = match shard.targets.entry(key.clone()) {
            std::collections::hash_map::Entry::Occupied(present) => Arc::clone(present.get()),
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&result));
                shard.num_actions += result.actions.len();
                shard.num_blobs += result.blobs.len();
                shard.num_trees += result.trees.len();
                result
            }
        };
        if let Some(cache_key) = cache_key {
            shard.cache_targets.insert(cache_key, Arc::clone(&entry));
        }
        if is_export {
            shard.export_targets.insert(key);
        }
        entry
    }

    /// Totals of the first-insertion counters: actions, blobs, trees.
    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut totals = (0, 0, 0);
        for shard in &self.shards {
            if let Ok(shard) = shard.lock() {
                totals.0 += shard.num_actions;
                totals.1 += shard.num_blobs;
                totals.2 += shard.num_trees;
            }
        }
        totals
    }

    /// All analysed configured targets, sorted by rendering.
    #[must_use]
    pub fn configured_targets(&self) -> Vec<ConfiguredTarget> {
        let mut targets = Vec::new();
        for shard in &self.shards {
            if let Ok(shard) = shard.lock() {
                targets.extend(shard.targets.keys().cloned());
            }
        }
        targets.sort_by_key(ToString::to_string);
        targets
    }

    /// All export targets, sorted by rendering.
    #[must_use]
    pub fn export_targets(&self) -> Vec<ConfiguredTarget> {
        let mut targets = Vec::new();
        for shard in &self.shards {
            if let Ok(shard) = shard.lock() {
                targets.extend(shard.export_targets.iter().cloned());
            }
        }
        targets.sort_by_key(ToString::to_string);
        targets
    }

    /// Export targets recorded for cache write-through.
    #[must_use]
    pub fn cache_targets(&self) -> HashMap<TargetCacheKey, Arc<AnalysedTarget>> {
        let mut merged = HashMap::new();
        for shard in &self.shards {
            if let Ok(shard) = shard.lock() {
                merged.extend(
                    shard
                        .cache_targets
                        .iter()
                        .map(|(k, v)| (k.clone(), Arc::clone(v))),
                );
            }
        }
        merged
    }

    /// The analysed target recorded for a configured target, if any.
    #[must_use]
    pub fn get(&self, key: &ConfiguredTarget) -> Option<Arc<AnalysedTarget>> {
        let shard = self.shards[self.shard_of(&key.target)].lock().ok()?;
        shard.targets.get(key).cloned()
    }

    /// Look up an action by identifier, scanning all shards.
    #[must_use]
    pub fn get_action(&self, id: &ActionIdentifier) -> Option<Arc<ActionDescription>> {
        for shard in &self.shards {
            if let Ok(shard) = shard.lock() {
                for target in shard.targets.values() {
                    if let Some(action) = target.actions.iter().find(|a| a.id() == id) {
                        return Some(Arc::clone(action));
                    }
                }
            }
        }
        None
    }

    /// The configured-target graph as JSON, node to dependency lists.
    #[must_use]
    pub fn configured_targets_graph(&self) -> serde_json::Value {
        let mut graph = serde_json::Map::new();
        for shard in &self.shards {
            if let Ok(shard) = shard.lock() {
                for analysed in shard.targets.values() {
                    if let Some(node) = &analysed.graph_info.node {
                        graph.insert(node.to_string(), analysed.graph_info.deps_to_json());
                    }
                }
            }
        }
        serde_json::Value::Object(graph)
    }

    /// Collect actions, blobs and trees of every analysed target.
    ///
    /// Actions and trees are deduplicated by identifier, blobs by
    /// content; origins record every `(target, position)` that produced
    /// an action.
    #[must_use]
    pub fn to_content(&self) -> ActionGraphContent {
        let mut content = ActionGraphContent::default();
        let mut seen_actions = HashSet::new();
        let mut seen_trees = HashSet::new();
        let mut seen_blobs = HashSet::new();
        for shard in &self.shards {
            let Ok(shard) = shard.lock() else { continue };
            let mut entries: Vec<_> = shard.targets.iter().collect();
            entries.sort_by_key(|(key, _)| key.to_string());
            for (key, analysed) in entries {
                for (position, action) in analysed.actions.iter().enumerate() {
                    content
                        .origins
                        .entry(action.id().clone())
                        .or_default()
                        .push((key.clone(), position));
                    if seen_actions.insert(action.id().clone()) {
                        content.actions.push(Arc::clone(action));
                    }
                }
                for blob in &analysed.blobs {
                    if seen_blobs.insert(blob.clone()) {
                        content.blobs.push(blob.clone());
                    }
                }
                for tree in &analysed.trees {
                    if seen_trees.insert(tree.id().to_string()) {
                        content.trees.push(Arc::clone(tree));
                    }
                }
            }
        }
        content.blobs.sort();
        for origins in content.origins.values_mut() {
            origins.sort_by(|(ta, pa), (tb, pb)| {
                ta.to_string().cmp(&tb.to_string()).then(pa.cmp(pb))
            });
        }
        content
    }

    /// The stable action-graph dump.
    ///
    /// Three top-level keys: `"actions"` mapping action id to its
    /// description (with origins when requested), `"blobs"` as a sorted
    /// deduplicated list, and `"trees"` mapping tree id to its staged
    /// content.
    #[must_use]
    pub fn to_json(&self, include_origins: bool) -> serde_json::Value {
        let content = self.to_content();
        let mut actions = serde_json::Map::new();
        for action in &content.actions {
            let mut entry = action.to_json();
            if include_origins {
                if let (Some(origins), Some(object)) =
                    (content.origins.get(action.id()), entry.as_object_mut())
                {
                    let rendered: Vec<serde_json::Value> = origins
                        .iter()
                        .map(|(target, subtask)| {
                            serde_json::json!({
                                "target": [
                                    target.target.repository,
                                    target.target.module,
                                    target.target.name,
                                ],
                                "config": target.config.to_json(),
                                "subtask": subtask,
                            })
                        })
                        .collect();
                    object.insert("origins".to_string(), serde_json::Value::Array(rendered));
                }
            }
            actions.insert(action.id().clone(), entry);
        }
        let trees: serde_json::Map<String, serde_json::Value> = content
            .trees
            .iter()
            .map(|tree| {
                let staged: BTreeMap<&String, serde_json::Value> = tree
                    .content()
                    .iter()
                    .map(|(path, artifact)| (path, artifact.to_json()))
                    .collect();
                (
                    tree.id().to_string(),
                    serde_json::to_value(staged).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();
        serde_json::json!({
            "actions": actions,
            "blobs": content.blobs,
            "trees": trees,
        })
    }
}
