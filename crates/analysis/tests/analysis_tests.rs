//! End-to-end analysis of small workspaces on disk.

use std::sync::{Arc, Mutex};

use quarry_analysis::{
    analyse, AnalyseContext, ConfiguredTarget, InMemoryTargetCache, RepositoryConfig,
};
use quarry_common::{ArtifactDescription, EntityName, HashFunction, ObjectType, Statistics,
    TaskTracker};
use quarry_expr::Configuration;
use quarry_scheduler::TaskSystem;

fn workspace(targets: serde_json::Value) -> (tempfile::TempDir, Arc<AnalyseContext>) {
    let dir = tempfile::tempdir().expect("scratch dir");
    std::fs::write(
        dir.path().join("TARGETS"),
        serde_json::to_vec_pretty(&targets).expect("serialise targets"),
    )
    .expect("write targets file");
    let repos = Arc::new(RepositoryConfig::single("", dir.path()));
    let ctx = AnalyseContext::new(
        repos,
        Arc::new(Statistics::new()),
        Arc::new(TaskTracker::new()),
        Arc::new(InMemoryTargetCache::new()),
        HashFunction::Native,
        4,
    );
    (dir, ctx)
}

fn target(name: &str, config: serde_json::Value) -> ConfiguredTarget {
    ConfiguredTarget::new(
        EntityName::new("", ".", name),
        Configuration::from_json(&config),
    )
}

#[test]
fn file_gen_stages_a_known_blob() {
    let (_dir, ctx) = workspace(serde_json::json!({
        "hello": {"type": "file_gen", "name": "hello.txt", "data": "hi"},
    }));
    let ts = TaskSystem::new(4);
    let result = analyse(&ctx, &ts, target("hello", serde_json::json!({}))).expect("analysis");
    let analysed = &result.analysed;

    let expected = ArtifactDescription::Known {
        digest: HashFunction::Native.hash_blob(b"hi"),
        object_type: ObjectType::File,
    };
    assert_eq!(analysed.artifacts().len(), 1);
    assert_eq!(analysed.artifacts().get("hello.txt"), Some(&expected));
    assert_eq!(analysed.runfiles(), analysed.artifacts());
    assert!(analysed.actions.is_empty());
    assert_eq!(analysed.blobs, vec!["hi".to_string()]);
    assert!(analysed.vars.is_empty());
    assert!(analysed.tainted.is_empty());
}

#[test]
fn install_with_nested_paths_is_a_tree_conflict() {
    let (_dir, ctx) = workspace(serde_json::json!({
        "x": {"type": "file_gen", "name": "x.txt", "data": "x"},
        "y": {"type": "file_gen", "name": "y.txt", "data": "y"},
        "broken": {
            "type": "install",
            "files": {"a/b": "x", "a": "y"},
        },
    }));
    let ts = TaskSystem::new(4);
    let err = analyse(&ctx, &ts, target("broken", serde_json::json!({}))).unwrap_err();
    assert!(err.to_string().contains("broken"));
    // The conflicting target is not recorded in the result map.
    assert!(ctx
        .result_map
        .configured_targets()
        .iter()
        .all(|t| t.target.name != "broken"));
}

#[test]
fn generic_emits_exactly_one_action() {
    let (_dir, ctx) = workspace(serde_json::json!({
        "gen": {
            "type": "generic",
            "outs": ["out.txt"],
            "cmds": ["echo hi > out.txt"],
        },
    }));
    let ts = TaskSystem::new(4);
    let result = analyse(&ctx, &ts, target("gen", serde_json::json!({}))).expect("analysis");
    let analysed = &result.analysed;

    assert_eq!(analysed.actions.len(), 1);
    let action = &analysed.actions[0];
    assert_eq!(action.argv(), ["sh", "-c", "echo hi > out.txt\n"]);
    assert_eq!(action.outputs(), ["out.txt"]);
    assert!(action.output_dirs().is_empty());
    assert_eq!(
        analysed.artifacts().get("out.txt"),
        Some(&ArtifactDescription::Action {
            action_id: action.id().clone(),
            path: "out.txt".to_string(),
        })
    );
    assert!(analysed.runfiles().is_empty());
}

#[test]
fn generic_requires_some_output() {
    let (_dir, ctx) = workspace(serde_json::json!({
        "bad": {"type": "generic", "cmds": ["true"]},
    }));
    let ts = TaskSystem::new(2);
    assert!(analyse(&ctx, &ts, target("bad", serde_json::json!({}))).is_err());
}

#[test]
fn configure_fixes_variables_for_the_inner_target() {
    let targets = serde_json::json!({
        "inner": {
            "type": "file_gen",
            "arguments_config": ["OS"],
            "name": "os.txt",
            "data": {"type": "var", "name": "OS", "default": "unknown"},
        },
        "outer": {
            "type": "configure",
            "target": "inner",
            "config": {"OS": "linux"},
        },
    });

    // Analysing `outer` under mac must behave like `inner` under linux.
    let (_dir, ctx) = workspace(targets.clone());
    let ts = TaskSystem::new(4);
    let outer = analyse(
        &ctx,
        &ts,
        target("outer", serde_json::json!({"OS": "mac", "CPU": "x86"})),
    )
    .expect("analysis");
    let expected = ArtifactDescription::Known {
        digest: HashFunction::Native.hash_blob(b"linux"),
        object_type: ObjectType::File,
    };
    assert_eq!(outer.analysed.artifacts().get("os.txt"), Some(&expected));
    // The transition fixes OS, so the outer target consumes nothing.
    assert!(outer.analysed.vars.is_empty());

    let (_dir2, ctx2) = workspace(targets);
    let ts2 = TaskSystem::new(4);
    let inner = analyse(
        &ctx2,
        &ts2,
        target("inner", serde_json::json!({"OS": "linux", "CPU": "x86"})),
    )
    .expect("analysis");
    assert_eq!(
        inner.analysed.artifacts().get("os.txt"),
        outer.analysed.artifacts().get("os.txt")
    );
    assert_eq!(
        inner.analysed.vars,
        ["OS".to_string()].into_iter().collect()
    );
}

#[test]
fn effective_configuration_deduplicates_analysis() {
    let (_dir, ctx) = workspace(serde_json::json!({
        "plain": {"type": "file_gen", "name": "f.txt", "data": "fixed"},
    }));
    // Two configurations that agree on the (empty) consumed variable set.
    let ts = TaskSystem::new(4);
    let a = analyse(&ctx, &ts, target("plain", serde_json::json!({"OS": "linux"})))
        .expect("analysis");
    let b = analyse(&ctx, &ts, target("plain", serde_json::json!({"OS": "mac"})))
        .expect("analysis");
    assert!(Arc::ptr_eq(&a.analysed, &b.analysed));
    assert_eq!(ctx.result_map.configured_targets().len(), 1);
}

#[test]
fn dependency_vars_propagate_upward() {
    let (_dir, ctx) = workspace(serde_json::json!({
        "leaf": {
            "type": "file_gen",
            "arguments_config": ["ARCH"],
            "name": "leaf.txt",
            "data": {"type": "var", "name": "ARCH", "default": ""},
        },
        "top": {
            "type": "install",
            "arguments_config": ["OS"],
            "files": {"copy.txt": "leaf"},
        },
    }));
    let ts = TaskSystem::new(4);
    let result = analyse(
        &ctx,
        &ts,
        target("top", serde_json::json!({"OS": "linux", "ARCH": "arm", "JOBS": 8})),
    )
    .expect("analysis");
    let vars: Vec<&str> = result.analysed.vars.iter().map(String::as_str).collect();
    assert_eq!(vars, ["ARCH", "OS"]);
}

#[test]
fn tainted_must_cover_dependencies() {
    let (_dir, ctx) = workspace(serde_json::json!({
        "dirty": {"type": "file_gen", "name": "d.txt", "data": "x", "tainted": ["test"]},
        "clean-consumer": {"type": "install", "files": {"out": "dirty"}},
        "tainted-consumer": {
            "type": "install",
            "files": {"out": "dirty"},
            "tainted": ["test"],
        },
    }));
    let ts = TaskSystem::new(4);
    assert!(analyse(&ctx, &ts, target("clean-consumer", serde_json::json!({}))).is_err());
    let ok = analyse(&ctx, &ts, target("tainted-consumer", serde_json::json!({})))
        .expect("tainted consumer analyses");
    assert_eq!(
        ok.analysed.tainted,
        ["test".to_string()].into_iter().collect()
    );
}

#[test]
fn unknown_rule_types_are_fatal() {
    let (_dir, ctx) = workspace(serde_json::json!({
        "strange": {"type": "cc_library"},
    }));
    let ts = TaskSystem::new(2);
    let err = analyse(&ctx, &ts, target("strange", serde_json::json!({}))).unwrap_err();
    assert!(err.to_string().contains("strange"));
}

#[test]
fn dependency_cycles_are_reported_minimally() {
    let (_dir, ctx) = workspace(serde_json::json!({
        "a": {"type": "install", "deps": ["b"]},
        "b": {"type": "install", "deps": ["c"]},
        "c": {"type": "install", "deps": ["a"]},
    }));
    let ts = TaskSystem::new(4);
    let err = analyse(&ctx, &ts, target("a", serde_json::json!({}))).unwrap_err();
    let report = err.to_string();
    assert!(report.contains("Cyclic dependency"), "got: {report}");
    // All three members of the minimal cycle are listed.
    for name in ["a", "b", "c"] {
        assert!(report.contains(&format!("\"{name}\"")), "missing {name}: {report}");
    }
}

#[test]
fn source_files_analyse_to_local_artifacts() {
    let (dir, ctx) = workspace(serde_json::json!({
        "pack": {"type": "install", "files": {"src/main.c": "main.c"}},
    }));
    std::fs::write(dir.path().join("main.c"), b"int main(void) { return 0; }").unwrap();
    let ts = TaskSystem::new(2);
    let result = analyse(&ctx, &ts, target("pack", serde_json::json!({}))).expect("analysis");
    assert_eq!(
        result.analysed.artifacts().get("src/main.c"),
        Some(&ArtifactDescription::Local {
            repository: String::new(),
            path: "main.c".to_string(),
        })
    );
}

#[test]
fn export_targets_are_recorded_and_counted() {
    let dir = tempfile::tempdir().expect("scratch dir");
    // A content-fixed repository is required for cache eligibility; a
    // plain path root must be counted as not eligible instead.
    std::fs::write(
        dir.path().join("TARGETS"),
        serde_json::to_vec(&serde_json::json!({
            "lib": {"type": "file_gen", "name": "lib.txt", "data": "content"},
            "api": {"type": "export", "target": "lib", "flexible_config": ["OS"]},
        }))
        .unwrap(),
    )
    .unwrap();
    let stats = Arc::new(Statistics::new());
    let ctx = AnalyseContext::new(
        Arc::new(RepositoryConfig::single("", dir.path())),
        Arc::clone(&stats),
        Arc::new(TaskTracker::new()),
        Arc::new(InMemoryTargetCache::new()),
        HashFunction::Native,
        2,
    );
    let ts = TaskSystem::new(2);
    let result = analyse(&ctx, &ts, target("api", serde_json::json!({"OS": "linux"})))
        .expect("analysis");
    assert_eq!(stats.exports_not_eligible_count(), 1);
    assert_eq!(stats.exports_cached_count(), 0);
    assert_eq!(ctx.result_map.export_targets().len(), 1);
    assert_eq!(
        result.analysed.vars,
        ["OS".to_string()].into_iter().collect()
    );
}

#[test]
fn tree_conflicts_name_the_subtree() {
    let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let (_dir, ctx) = workspace(serde_json::json!({
        "x": {"type": "file_gen", "name": "x.txt", "data": "x"},
        "y": {"type": "file_gen", "name": "y.txt", "data": "y"},
        "broken": {
            "type": "install",
            "files": {"a/b": "x", "a": "y"},
        },
    }));
    let ts = TaskSystem::new(2);
    let map = quarry_analysis::create_target_map(&ctx, &ts.handle());
    let sink = Arc::clone(&messages);
    map.consume_after_keys_ready(
        vec![target("broken", serde_json::json!({}))],
        Box::new(|_values| {}),
        Arc::new(move |msg: &str, _fatal: bool| {
            if let Ok(mut sink) = sink.lock() {
                sink.push(msg.to_string());
            }
        }),
        Arc::new(|_key| {}),
    );
    ts.finish();
    let messages = messages.lock().unwrap();
    assert!(
        messages
            .iter()
            .any(|m| m.contains("TREE conflict on subtree a")),
        "got: {messages:?}"
    );
}

#[test]
fn staging_conflicts_name_the_path() {
    let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let (_dir, ctx) = workspace(serde_json::json!({
        "one": {"type": "file_gen", "name": "same.txt", "data": "one"},
        "two": {"type": "file_gen", "name": "same.txt", "data": "two"},
        "merged": {"type": "tree", "deps": ["one", "two"]},
    }));
    let ts = TaskSystem::new(2);
    let map = quarry_analysis::create_target_map(&ctx, &ts.handle());
    let sink = Arc::clone(&messages);
    map.consume_after_keys_ready(
        vec![target("merged", serde_json::json!({}))],
        Box::new(|_values| {}),
        Arc::new(move |msg: &str, _fatal: bool| {
            if let Ok(mut sink) = sink.lock() {
                sink.push(msg.to_string());
            }
        }),
        Arc::new(|_key| {}),
    );
    ts.finish();
    let messages = messages.lock().unwrap();
    assert!(
        messages
            .iter()
            .any(|m| m.contains("Staging conflict for path same.txt")),
        "got: {messages:?}"
    );
}
