//! Configurations with a tracked variable domain.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::value::Value;

/// An immutable map from variable name to value.
///
/// The key set is the *domain*; pruning restricts it, updating unions it.
/// Configurations are cheap to clone and structurally hashable, which
/// makes the pruned projection onto the variables a target actually
/// consumes the cache key of the analysis engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Configuration {
    values: Arc<BTreeMap<String, Value>>,
}

impl Configuration {
    /// Configuration with an empty domain.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Configuration over the given bindings.
    #[must_use]
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self {
            values: Arc::new(values),
        }
    }

    /// Parse from a JSON object of variable bindings.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Object(map) => Self::new(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
            _ => Self::empty(),
        }
    }

    /// The value bound to a variable; null when outside the domain.
    #[must_use]
    pub fn get(&self, key: &str) -> Value {
        self.values.get(key).cloned().unwrap_or(Value::Null)
    }

    /// Whether the variable is part of the domain.
    #[must_use]
    pub fn variable_fixed(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// The variable names of the domain.
    pub fn domain(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Restrict the domain to `vars`.
    ///
    /// The result's domain is the intersection of `vars` with the current
    /// domain; values are taken unchanged. Pruning is idempotent.
    #[must_use]
    pub fn prune<'a, I>(&self, vars: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let pruned: BTreeMap<String, Value> = vars
            .into_iter()
            .filter_map(|var| {
                self.values
                    .get(var)
                    .map(|value| (var.to_string(), value.clone()))
            })
            .collect();
        Self::new(pruned)
    }

    /// Override pointwise and union the domains.
    #[must_use]
    pub fn update(&self, overrides: &BTreeMap<String, Value>) -> Self {
        if overrides.is_empty() {
            return self.clone();
        }
        let mut values = (*self.values).clone();
        for (key, value) in overrides {
            values.insert(key.clone(), value.clone());
        }
        Self::new(values)
    }

    /// Render as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Abbreviated rendering for progress lines.
    #[must_use]
    pub fn to_short_string(&self, max_len: usize) -> String {
        let full = self.to_json().to_string();
        if full.len() <= max_len {
            return full;
        }
        let head: String = full.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
