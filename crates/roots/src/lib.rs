//! Evaluation of computed repository roots.
//!
//! A computed root is a repository root whose on-disk content is defined
//! as the output of an export target in another, content-fixed
//! repository. Before analysis proper starts, every computed root is
//! resolved in dependency order: the export target is analysed and
//! built, its artifacts are staged into a scratch directory, the
//! directory is imported into the process-wide git object database via a
//! temporary repository (commit, keep tag, fetch), and the resulting
//! git-tree root replaces the computed description in the repository
//! configuration. Roots depending on other computed roots are driven
//! depth-first through the async map, so each root is materialised
//! exactly once.

mod evaluate;

pub use evaluate::{evaluate_computed_roots, BuildDriver, RootsError};
