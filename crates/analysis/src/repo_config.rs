//! The multi-repository configuration.
//!
//! Each named repository carries four roots (workspace, target, rule,
//! expression), a targets-file name and a mapping from local repository
//! names to global ones. A root is either a filesystem path, a git tree
//! pinned by id, or a computed root produced by building an export target
//! of another repository; the computed-root evaluator replaces computed
//! roots by git-tree roots before analysis proper starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use quarry_git::GitOdb;

/// Description of one root of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRoot {
    /// A plain directory in the local filesystem.
    Path(PathBuf),
    /// A git tree, content-fixed by id, inside the object database at
    /// `odb_path`.
    GitTree { id: String, odb_path: PathBuf },
    /// The output tree of an export target of another repository.
    Computed {
        repository: String,
        module: String,
        name: String,
        config: serde_json::Value,
    },
}

impl FileRoot {
    /// Whether this root pins its content.
    #[must_use]
    pub fn is_content_fixed(&self) -> bool {
        matches!(self, FileRoot::GitTree { .. })
    }

    /// Parse a root description.
    ///
    /// A JSON string is a filesystem path; an object is either a
    /// `"git tree"` or a `"computed"` root.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, String> {
        match json {
            serde_json::Value::String(path) => Ok(FileRoot::Path(PathBuf::from(path))),
            serde_json::Value::Object(map) => {
                match map.get("type").and_then(|t| t.as_str()) {
                    Some("git tree") => {
                        let id = map
                            .get("id")
                            .and_then(|v| v.as_str())
                            .ok_or("git tree root needs an \"id\"")?;
                        let odb = map
                            .get("repository")
                            .and_then(|v| v.as_str())
                            .ok_or("git tree root needs a \"repository\" path")?;
                        Ok(FileRoot::GitTree {
                            id: id.to_string(),
                            odb_path: PathBuf::from(odb),
                        })
                    }
                    Some("computed") => {
                        let repository = map
                            .get("repository")
                            .and_then(|v| v.as_str())
                            .ok_or("computed root needs a \"repository\"")?;
                        let target = map
                            .get("target")
                            .and_then(|v| v.as_array())
                            .ok_or("computed root needs a [module, name] \"target\"")?;
                        let (module, name) = match target.as_slice() {
                            [serde_json::Value::String(module), serde_json::Value::String(name)] => {
                                (module.clone(), name.clone())
                            }
                            _ => return Err("computed root target must be [module, name]".into()),
                        };
                        Ok(FileRoot::Computed {
                            repository: repository.to_string(),
                            module,
                            name,
                            config: map
                                .get("config")
                                .cloned()
                                .unwrap_or(serde_json::json!({})),
                        })
                    }
                    other => Err(format!("unknown root type {other:?}")),
                }
            }
            other => Err(format!("unusable root description {other}")),
        }
    }

    /// Read a file below this root, if it exists.
    pub fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, String> {
        match self {
            FileRoot::Path(root) => {
                let full = root.join(path);
                if full.is_file() {
                    std::fs::read(&full)
                        .map(Some)
                        .map_err(|e| format!("reading {}: {e}", full.display()))
                } else {
                    Ok(None)
                }
            }
            FileRoot::GitTree { id, odb_path } => {
                let odb = GitOdb::open(odb_path).map_err(|e| e.to_string())?;
                match odb.object_info_under_path(id, path) {
                    Ok(Some(info)) if !info.object_type.is_tree() => {
                        odb.read_blob(&info.id).map(Some).map_err(|e| e.to_string())
                    }
                    Ok(_) => Ok(None),
                    Err(e) => Err(e.to_string()),
                }
            }
            FileRoot::Computed { .. } => {
                Err("computed root used before it was evaluated".to_string())
            }
        }
    }

    /// Whether an entry (file or symlink) exists below this root.
    pub fn contains_file(&self, path: &str) -> Result<bool, String> {
        match self {
            FileRoot::Path(root) => Ok(root.join(path).is_file() || root.join(path).is_symlink()),
            FileRoot::GitTree { id, odb_path } => {
                let odb = GitOdb::open(odb_path).map_err(|e| e.to_string())?;
                match odb.object_info_under_path(id, path) {
                    Ok(Some(info)) => Ok(!info.object_type.is_tree()),
                    Ok(None) => Ok(false),
                    Err(e) => Err(e.to_string()),
                }
            }
            FileRoot::Computed { .. } => {
                Err("computed root used before it was evaluated".to_string())
            }
        }
    }
}

/// One repository of the configuration.
#[derive(Debug, Clone)]
pub struct RepositoryEntry {
    pub workspace_root: FileRoot,
    pub target_root: FileRoot,
    pub rule_root: FileRoot,
    pub expression_root: FileRoot,
    pub target_file_name: String,
    /// Name of rule files below the rule root. Parsed and carried for
    /// schema fidelity; with the built-in rule set a closed enumeration
    /// nothing consults it yet.
    pub rule_file_name: String,
    /// Name of expression files below the expression root; carried like
    /// `rule_file_name`.
    pub expression_file_name: String,
    pub name_mapping: BTreeMap<String, String>,
}

impl RepositoryEntry {
    /// All roots content-fixed makes export targets of this repository
    /// eligible for caching.
    #[must_use]
    pub fn is_content_fixed(&self) -> bool {
        self.workspace_root.is_content_fixed()
            && self.target_root.is_content_fixed()
            && self.rule_root.is_content_fixed()
            && self.expression_root.is_content_fixed()
    }

    /// Resolve a repository name a target of this repository refers to.
    #[must_use]
    pub fn global_name<'a>(&'a self, local: &'a str) -> &'a str {
        self.name_mapping.get(local).map_or(local, String::as_str)
    }
}

/// The full multi-repository configuration.
#[derive(Debug, Clone, Default)]
pub struct RepositoryConfig {
    main: String,
    repositories: BTreeMap<String, RepositoryEntry>,
}

impl RepositoryConfig {
    /// Parse the external JSON configuration.
    ///
    /// Layout: `{ "main": string?, "repositories": { name: entry, … } }`
    /// where every root of an entry is a root description and
    /// `workspace_root` is the fallback for the other roots.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, String> {
        let repositories_json = json
            .get("repositories")
            .and_then(|r| r.as_object())
            .ok_or("configuration needs a \"repositories\" map")?;
        let mut repositories = BTreeMap::new();
        for (name, entry) in repositories_json {
            let workspace_json = entry
                .get("workspace_root")
                .ok_or_else(|| format!("repository {name} needs a workspace_root"))?;
            let workspace_root = FileRoot::from_json(workspace_json)
                .map_err(|e| format!("repository {name}: {e}"))?;
            let root_or_workspace = |key: &str| -> Result<FileRoot, String> {
                match entry.get(key) {
                    Some(json) => {
                        FileRoot::from_json(json).map_err(|e| format!("repository {name}: {e}"))
                    }
                    None => Ok(workspace_root.clone()),
                }
            };
            let name_mapping = entry
                .get("name_mapping")
                .and_then(|m| m.as_object())
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| {
                            v.as_str().map(|v| (k.clone(), v.to_string()))
                        })
                        .collect()
                })
                .unwrap_or_default();
            let file_name = |key: &str, default: &str| -> String {
                entry
                    .get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or(default)
                    .to_string()
            };
            repositories.insert(
                name.clone(),
                RepositoryEntry {
                    target_root: root_or_workspace("target_root")?,
                    rule_root: root_or_workspace("rule_root")?,
                    expression_root: root_or_workspace("expression_root")?,
                    workspace_root,
                    target_file_name: file_name("target_file_name", "TARGETS"),
                    rule_file_name: file_name("rule_file_name", "RULES"),
                    expression_file_name: file_name("expression_file_name", "EXPRESSIONS"),
                    name_mapping,
                },
            );
        }
        let main = match json.get("main").and_then(|m| m.as_str()) {
            Some(main) => main.to_string(),
            None => repositories
                .keys()
                .next()
                .cloned()
                .ok_or("configuration contains no repositories")?,
        };
        if !repositories.contains_key(&main) {
            return Err(format!("main repository `{main}` is not defined"));
        }
        Ok(Self { main, repositories })
    }

    /// Single-repository configuration rooted at a workspace directory.
    #[must_use]
    pub fn single(name: &str, workspace: &Path) -> Self {
        let root = FileRoot::Path(workspace.to_path_buf());
        let mut repositories = BTreeMap::new();
        repositories.insert(
            name.to_string(),
            RepositoryEntry {
                workspace_root: root.clone(),
                target_root: root.clone(),
                rule_root: root.clone(),
                expression_root: root,
                target_file_name: "TARGETS".to_string(),
                rule_file_name: "RULES".to_string(),
                expression_file_name: "EXPRESSIONS".to_string(),
                name_mapping: BTreeMap::new(),
            },
        );
        Self {
            main: name.to_string(),
            repositories,
        }
    }

    #[must_use]
    pub fn main_repository(&self) -> &str {
        &self.main
    }

    #[must_use]
    pub fn repository(&self, name: &str) -> Option<&RepositoryEntry> {
        self.repositories.get(name)
    }

    pub fn repositories(&self) -> impl Iterator<Item = (&String, &RepositoryEntry)> {
        self.repositories.iter()
    }

    /// Replace a repository's roots; used when computed roots resolve.
    pub fn set_repository(&mut self, name: &str, entry: RepositoryEntry) {
        self.repositories.insert(name.to_string(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_configuration() {
        let json = serde_json::json!({
            "main": "tool",
            "repositories": {
                "tool": {
                    "workspace_root": "/src/tool",
                    "target_file_name": "BUILD.json",
                    "rule_file_name": "BUILD.rules",
                    "name_mapping": {"deps": "third-party"},
                },
                "third-party": {
                    "workspace_root": {"type": "git tree", "id": "abc123", "repository": "/odb"},
                },
            },
        });
        let config = RepositoryConfig::from_json(&json).unwrap();
        assert_eq!(config.main_repository(), "tool");
        let tool = config.repository("tool").unwrap();
        assert_eq!(tool.target_file_name, "BUILD.json");
        assert_eq!(tool.rule_file_name, "BUILD.rules");
        // Unset file names fall back to their defaults.
        assert_eq!(tool.expression_file_name, "EXPRESSIONS");
        let third_party = config.repository("third-party").unwrap();
        assert_eq!(third_party.target_file_name, "TARGETS");
        assert_eq!(third_party.rule_file_name, "RULES");
        assert_eq!(tool.global_name("deps"), "third-party");
        assert_eq!(tool.global_name("unmapped"), "unmapped");
        assert!(!tool.is_content_fixed());
        // target_root falls back to workspace_root.
        assert_eq!(tool.target_root, tool.workspace_root);
    }

    #[test]
    fn computed_roots_parse() {
        let root = FileRoot::from_json(&serde_json::json!({
            "type": "computed",
            "repository": "base",
            "target": ["modules", "exported"],
            "config": {"OS": "linux"},
        }))
        .unwrap();
        match root {
            FileRoot::Computed {
                repository,
                module,
                name,
                config,
            } => {
                assert_eq!(repository, "base");
                assert_eq!(module, "modules");
                assert_eq!(name, "exported");
                assert_eq!(config["OS"], "linux");
            }
            other => panic!("unexpected root {other:?}"),
        }
        assert!(FileRoot::from_json(&serde_json::json!({"type": "nope"})).is_err());
    }
}
