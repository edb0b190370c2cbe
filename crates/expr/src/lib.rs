//! Expression values, configurations and the evaluator.
//!
//! Targets are described by JSON expressions evaluated against an
//! immutable [`Configuration`] with a tracked variable domain. Evaluation
//! is pure: the same expression against configurations that agree on the
//! variables it consumes yields the same [`Value`], which is what makes
//! pruned configurations a sound cache key for the analysis engine.

mod configuration;
mod error;
mod eval;
mod value;

pub use configuration::Configuration;
pub use error::{EvalError, Result};
pub use eval::{Evaluator, FunctionMap, HostFunction};
pub use value::{TargetResult, Value};
