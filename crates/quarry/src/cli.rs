//! Command-line surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Multi-repository content-addressed build tool.
#[derive(Parser, Debug)]
#[command(name = "quarry", version, about, max_term_width = 100)]
pub struct Cli {
    /// Path to the workspace root.
    #[arg(short = 'C', long, global = true)]
    pub workspace_root: Option<PathBuf>,

    /// Path to the multi-repository configuration file.
    #[arg(long, global = true)]
    pub repository_config: Option<PathBuf>,

    /// Name of the main repository.
    #[arg(long, global = true)]
    pub main: Option<String>,

    /// Number of parallel jobs.
    #[arg(short = 'j', long, global = true)]
    pub jobs: Option<usize>,

    /// Root directory for the local store and repository clones.
    #[arg(long, global = true)]
    pub local_build_root: Option<PathBuf>,

    /// Hash objects compatibly with flat remote-execution digests
    /// instead of git-style object hashing.
    #[arg(long, global = true)]
    pub compatible: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// A target expression: a plain name, `module name`, or a JSON list.
#[derive(Debug, Clone, clap::Args)]
pub struct TargetSpec {
    /// Module of the target, or the target itself when no name follows.
    pub module_or_target: String,

    /// Name of the target within the module.
    pub target: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Analyse a target without building it.
    Analyse {
        #[command(flatten)]
        target: TargetSpec,

        /// Write the action graph (with origins) to this file.
        #[arg(long)]
        dump_actions: Option<PathBuf>,

        /// Write the configured-target graph to this file.
        #[arg(long)]
        dump_graph: Option<PathBuf>,
    },

    /// Analyse and build a target.
    Build {
        #[command(flatten)]
        target: TargetSpec,
    },

    /// Build a target and stage its artifacts to an output directory.
    Install {
        #[command(flatten)]
        target: TargetSpec,

        /// Directory the artifacts are staged to.
        #[arg(short = 'o', long)]
        output: PathBuf,
    },

    /// Rebuild a target, re-executing all its actions.
    Rebuild {
        #[command(flatten)]
        target: TargetSpec,
    },

    /// Store a file or directory in the local store and print its digest.
    InstallCas {
        /// The file or directory to store.
        path: PathBuf,
    },

    /// Build artifacts from a previously dumped action graph.
    Traverse {
        /// The action-graph file to execute.
        #[arg(short = 'g', long)]
        graph: PathBuf,

        /// Stage all built outputs to this directory.
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },

    /// Rotate the generations of the local store.
    Gc {
        /// Compactify the newest generation instead of rotating.
        #[arg(long)]
        compactify: bool,

        /// Rotate the repository-clone generations as well.
        #[arg(long)]
        repositories: bool,
    },

    /// Execute a single action from an action-graph file.
    Execute {
        /// The action-graph file holding the action.
        #[arg(short = 'g', long)]
        graph: PathBuf,

        /// Identifier of the action to execute.
        action: String,
    },

    /// Print the rule fields of a target.
    Describe {
        #[command(flatten)]
        target: TargetSpec,
    },

    /// Print version information.
    Version,
}

impl TargetSpec {
    /// Resolve the positional arguments into `(module, name)`.
    ///
    /// A single argument is a name in the top-level module or a JSON
    /// list; two arguments are module and name.
    pub fn resolve(&self) -> Result<(String, String), String> {
        if let Some(name) = &self.target {
            return Ok((self.module_or_target.clone(), name.clone()));
        }
        let raw = &self.module_or_target;
        if raw.starts_with('[') {
            let parsed: serde_json::Value = serde_json::from_str(raw)
                .map_err(|e| format!("malformed target expression {raw}: {e}"))?;
            return match parsed.as_array().map(Vec::as_slice) {
                Some([serde_json::Value::String(module), serde_json::Value::String(name)]) => {
                    Ok((module.clone(), name.clone()))
                }
                _ => Err(format!(
                    "target expression {raw} must be a [module, name] list"
                )),
            };
        }
        Ok((".".to_string(), raw.clone()))
    }
}
