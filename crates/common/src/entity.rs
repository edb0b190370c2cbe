//! Entity names: the (repository, module, name) triple identifying a target.

use serde::{Deserialize, Serialize};

use crate::error::{CommonError, Result};
use crate::paths::normalize;

/// Name of a target, rule or expression entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityName {
    pub repository: String,
    pub module: String,
    pub name: String,
}

impl EntityName {
    /// Construct a name with a normalised module path.
    #[must_use]
    pub fn new(
        repository: impl Into<String>,
        module: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let module = normalize(&module.into());
        Self {
            repository: repository.into(),
            module,
            name: name.into(),
        }
    }

    /// Parse a target expression relative to a module.
    ///
    /// Accepted forms mirror the command line: a plain string names a
    /// target in the current module; a two-element JSON list is
    /// `[module, name]`; a three-element list is `[repository, module,
    /// name]`. Relative modules are resolved against `current_module`.
    pub fn parse(
        expr: &serde_json::Value,
        current_repository: &str,
        current_module: &str,
    ) -> Result<Self> {
        match expr {
            serde_json::Value::String(name) => Ok(Self::new(
                current_repository,
                current_module,
                name.clone(),
            )),
            serde_json::Value::Array(parts) => {
                let strings: Option<Vec<&str>> =
                    parts.iter().map(serde_json::Value::as_str).collect();
                match strings.as_deref() {
                    Some([module, name]) => {
                        let module = if let Some(rel) = module.strip_prefix("./") {
                            normalize(&format!("{current_module}/{rel}"))
                        } else {
                            normalize(module)
                        };
                        Ok(Self::new(current_repository, module, *name))
                    }
                    Some([repository, module, name]) => {
                        Ok(Self::new(*repository, *module, *name))
                    }
                    _ => Err(CommonError::InvalidEntityName(expr.to_string())),
                }
            }
            _ => Err(CommonError::InvalidEntityName(expr.to_string())),
        }
    }
}

impl std::fmt::Display for EntityName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[\"{}\",\"{}\",\"{}\"]", self.repository, self.module, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        let plain = EntityName::parse(&serde_json::json!("hello"), "main", "src").unwrap();
        assert_eq!(plain, EntityName::new("main", "src", "hello"));

        let pair = EntityName::parse(&serde_json::json!(["lib", "hello"]), "main", "src").unwrap();
        assert_eq!(pair.module, "lib");

        let rel =
            EntityName::parse(&serde_json::json!(["./sub", "hello"]), "main", "src").unwrap();
        assert_eq!(rel.module, "src/sub");

        let triple =
            EntityName::parse(&serde_json::json!(["other", ".", "x"]), "main", "src").unwrap();
        assert_eq!(triple.repository, "other");
        assert_eq!(triple.module, ".");
    }

    #[test]
    fn rejects_malformed() {
        assert!(EntityName::parse(&serde_json::json!(42), "main", ".").is_err());
        assert!(EntityName::parse(&serde_json::json!([1, 2]), "main", ".").is_err());
        assert!(EntityName::parse(&serde_json::json!(["a"]), "main", ".").is_err());
    }
}
