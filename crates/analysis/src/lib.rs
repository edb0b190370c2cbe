//! The target analysis engine.
//!
//! Analysing a configured target means dispatching on the `type` field of
//! its description, recursively analysing its dependencies through the
//! async map, evaluating the rule's expression fields against the pruned
//! configuration, and assembling the immutable analysed result: the
//! artifact and runfile stages, the actions, auxiliary blobs and staged
//! trees, the effective variable set and the taint labels. Analysed
//! targets are deduplicated by their *effective* configuration, the
//! incoming configuration pruned to the variables the target actually
//! consumes. That projection is the central caching invariant of the
//! engine.

mod analyse;
mod analysed_target;
mod configured_target;
mod repo_config;
mod result_map;
mod rules;
mod target_cache;
mod target_map;

pub use analyse::{analyse, AnalysisError, AnalysisResult};
pub use analysed_target::{AnalysedTarget, StagedTree, TargetGraphInformation};
pub use configured_target::ConfiguredTarget;
pub use repo_config::{FileRoot, RepositoryConfig, RepositoryEntry};
pub use result_map::{ActionGraphContent, ResultTargetMap};
pub use rules::is_built_in_rule;
pub use target_cache::{InMemoryTargetCache, TargetCache, TargetCacheKey};
pub use target_map::{create_target_map, AnalyseContext, TargetMap};
