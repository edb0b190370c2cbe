//! The built-in rules.
//!
//! The rule set is a closed enumeration; the `type` field of a target
//! description names one of them. Every handler follows the same shape:
//! validate the exact field set, prune the configuration to
//! `arguments_config`, request dependencies through the sub-caller, and
//! assemble the analysed target in the continuation once they resolved.

mod blob_gen;
mod configure;
mod export;
mod generic;
mod install;
mod tree;
pub(crate) mod utils;

use std::sync::Arc;

use quarry_common::ObjectType;

use crate::configured_target::ConfiguredTarget;
use crate::target_map::{AnalyseContext, Logger, Setter, SubCaller};

const BUILT_IN_RULES: [&str; 7] = [
    "configure",
    "export",
    "file_gen",
    "generic",
    "install",
    "symlink",
    "tree",
];

/// Whether a `type` field names a built-in rule.
#[must_use]
pub fn is_built_in_rule(rule_type: &serde_json::Value) -> bool {
    rule_type
        .as_str()
        .is_some_and(|name| BUILT_IN_RULES.contains(&name))
}

/// Dispatch to the handler of a built-in rule.
///
/// Returns false when the name is not a built-in rule; the caller
/// reports that as an unknown rule type.
pub(crate) fn handle_built_in(
    rule_name: &str,
    desc: &serde_json::Value,
    key: &ConfiguredTarget,
    ctx: &Arc<AnalyseContext>,
    subcaller: SubCaller,
    setter: Setter,
    logger: Logger,
) -> bool {
    let target_logger: Logger = {
        let prefix = format!("While evaluating {rule_name} target {}", key.target);
        let inner = Arc::clone(&logger);
        Arc::new(move |msg: &str, fatal: bool| {
            inner(&format!("{prefix}:\n{msg}"), fatal);
        })
    };
    match rule_name {
        "file_gen" => {
            blob_gen::handle(desc, key, ctx, subcaller, setter, target_logger, ObjectType::File);
        }
        "symlink" => {
            blob_gen::handle(
                desc,
                key,
                ctx,
                subcaller,
                setter,
                target_logger,
                ObjectType::Symlink,
            );
        }
        "tree" => tree::handle(desc, key, ctx, subcaller, setter, target_logger),
        "install" => install::handle(desc, key, ctx, subcaller, setter, target_logger),
        "generic" => generic::handle(desc, key, ctx, subcaller, setter, target_logger),
        "configure" => configure::handle(desc, key, ctx, subcaller, setter, target_logger),
        "export" => export::handle(desc, key, ctx, subcaller, setter, target_logger),
        _ => return false,
    }
    true
}
