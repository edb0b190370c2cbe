//! The export-target cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use quarry_common::HashFunction;
use quarry_expr::Configuration;

use crate::analysed_target::AnalysedTarget;
use crate::configured_target::ConfiguredTarget;

/// Cache key of an export target: the content hash of the target name and
/// its effective configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetCacheKey(String);

impl TargetCacheKey {
    #[must_use]
    pub fn new(hash_function: HashFunction, target: &ConfiguredTarget) -> Self {
        let rendered = serde_json::json!({
            "target": [
                target.target.repository,
                target.target.module,
                target.target.name,
            ],
            "config": target.config.to_json(),
        })
        .to_string();
        Self(hash_function.hash_blob(rendered.as_bytes()).hash().to_string())
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// Storage layer consulted for export targets before recursing.
pub trait TargetCache: Send + Sync {
    /// A cached analysed target for the key, if any.
    fn lookup(&self, key: &TargetCacheKey) -> Option<Arc<AnalysedTarget>>;

    /// Record an analysed export target for later invocations.
    fn store(&self, key: &TargetCacheKey, target: &Arc<AnalysedTarget>);
}

/// Process-local target cache.
#[derive(Default)]
pub struct InMemoryTargetCache {
    entries: Mutex<HashMap<TargetCacheKey, Arc<AnalysedTarget>>>,
}

impl InMemoryTargetCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TargetCache for InMemoryTargetCache {
    fn lookup(&self, key: &TargetCacheKey) -> Option<Arc<AnalysedTarget>> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn store(&self, key: &TargetCacheKey, target: &Arc<AnalysedTarget>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.entry(key.clone()).or_insert_with(|| Arc::clone(target));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::EntityName;

    #[test]
    fn keys_depend_on_name_and_configuration() {
        let name = EntityName::new("main", ".", "lib");
        let a = TargetCacheKey::new(
            HashFunction::Native,
            &ConfiguredTarget::new(
                name.clone(),
                Configuration::from_json(&serde_json::json!({"OS": "linux"})),
            ),
        );
        let b = TargetCacheKey::new(
            HashFunction::Native,
            &ConfiguredTarget::new(name, Configuration::empty()),
        );
        assert_ne!(a, b);
    }

    #[test]
    fn cache_round_trip() {
        let cache = InMemoryTargetCache::new();
        let key = TargetCacheKey::new(
            HashFunction::Native,
            &ConfiguredTarget::new(EntityName::new("", ".", "t"), Configuration::empty()),
        );
        assert!(cache.lookup(&key).is_none());
        let target = Arc::new(AnalysedTarget::default());
        cache.store(&key, &target);
        assert!(cache.lookup(&key).is_some());
    }
}
