//! The primary cache key of the analysis engine.

use quarry_common::EntityName;
use quarry_expr::Configuration;

/// Rendered configurations are capped at this length in progress lines.
const CONFIG_DISPLAY_LENGTH: usize = 320;

/// A target name paired with the configuration it is analysed in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfiguredTarget {
    pub target: EntityName,
    pub config: Configuration,
}

impl ConfiguredTarget {
    #[must_use]
    pub fn new(target: EntityName, config: Configuration) -> Self {
        Self { target, config }
    }

    /// Abbreviated rendering for progress lines and diagnostics.
    #[must_use]
    pub fn to_short_string(&self) -> String {
        format!(
            "[{},{}]",
            self.target,
            self.config.to_short_string(CONFIG_DISPLAY_LENGTH)
        )
    }
}

impl std::fmt::Display for ConfiguredTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.target, self.config.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_includes_the_configuration() {
        let name = EntityName::new("", ".", "hello");
        let a = ConfiguredTarget::new(
            name.clone(),
            Configuration::from_json(&serde_json::json!({"OS": "linux"})),
        );
        let b = ConfiguredTarget::new(
            name.clone(),
            Configuration::from_json(&serde_json::json!({"OS": "mac"})),
        );
        let c = ConfiguredTarget::new(
            name,
            Configuration::from_json(&serde_json::json!({"OS": "linux"})),
        );
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}
