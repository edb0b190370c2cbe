//! Property tests for paths and the tree codec.

use proptest::prelude::*;
use quarry_common::{decode_tree, encode_tree, is_non_upwards, normalize, ObjectType, TreeEntry};

fn arb_segment() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(".".to_string()),
        Just("..".to_string()),
        "[a-z]{1,6}".prop_map(|s| s),
    ]
}

fn arb_path() -> impl Strategy<Value = String> {
    proptest::collection::vec(arb_segment(), 0..6).prop_map(|segments| segments.join("/"))
}

fn arb_entry() -> impl Strategy<Value = TreeEntry> {
    (
        "[a-z][a-z0-9._-]{0,12}",
        prop_oneof![
            Just(ObjectType::File),
            Just(ObjectType::Executable),
            Just(ObjectType::Symlink),
            Just(ObjectType::Tree),
        ],
        proptest::collection::vec(any::<u8>(), 20),
    )
        .prop_map(|(name, object_type, hash)| TreeEntry {
            name,
            object_type,
            hash,
        })
}

proptest! {
    /// Normalisation is idempotent.
    #[test]
    fn normalize_is_idempotent(path in arb_path()) {
        let once = normalize(&path);
        prop_assert_eq!(normalize(&once), once);
    }

    /// Normal forms contain neither `.` segments nor inner `..`.
    #[test]
    fn normal_forms_are_clean(path in arb_path()) {
        let normal = normalize(&path);
        if normal != "." {
            let segments: Vec<&str> = normal.split('/').collect();
            let inner_dots = segments
                .iter()
                .skip_while(|s| **s == "..")
                .any(|s| *s == "." || *s == ".." || s.is_empty());
            prop_assert!(!inner_dots, "normal form {} is not clean", normal);
        }
    }

    /// A non-upwards target prefixed with `../` stops being non-upwards.
    #[test]
    fn upwards_prefix_escapes(path in "[a-z]{1,8}(/[a-z]{1,8}){0,3}") {
        prop_assert!(is_non_upwards(&path));
        let up_prefixed = format!("../{}", path);
        let root_prefixed = format!("/{}", path);
        prop_assert!(!is_non_upwards(&up_prefixed));
        prop_assert!(!is_non_upwards(&root_prefixed));
    }

    /// Encoding entries and decoding the bytes is the identity up to
    /// the canonical order.
    #[test]
    fn tree_codec_round_trip(entries in proptest::collection::vec(arb_entry(), 0..12)) {
        // Entry names must be unique within a tree.
        let mut seen = std::collections::HashSet::new();
        let entries: Vec<TreeEntry> = entries
            .into_iter()
            .filter(|e| seen.insert(e.name.clone()))
            .collect();
        let bytes = encode_tree(&entries);
        let decoded = decode_tree(&bytes, 20).unwrap();
        prop_assert_eq!(decoded.len(), entries.len());
        for entry in &entries {
            prop_assert!(decoded.contains(entry));
        }
        // Re-encoding the decoded entries is byte-identical.
        prop_assert_eq!(encode_tree(&decoded), bytes);
    }
}
