//! Property tests for configuration pruning.

use std::collections::BTreeMap;

use proptest::prelude::*;
use quarry_expr::{Configuration, Value};

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1000i32..1000).prop_map(|n| Value::Number(f64::from(n))),
        "[a-z]{0,8}".prop_map(Value::String),
    ]
}

fn arb_config() -> impl Strategy<Value = Configuration> {
    proptest::collection::btree_map("[A-F]", arb_value(), 0..6)
        .prop_map(|map: BTreeMap<String, Value>| Configuration::new(map))
}

fn arb_vars() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::vec("[A-H]", 0..6)
}

proptest! {
    /// Prune(Prune(C, V), V) = Prune(C, V).
    #[test]
    fn prune_is_idempotent(config in arb_config(), vars in arb_vars()) {
        let names: Vec<&str> = vars.iter().map(String::as_str).collect();
        let once = config.prune(names.iter().copied());
        let twice = once.prune(names.iter().copied());
        prop_assert_eq!(once, twice);
    }

    /// The pruned domain is a subset of both the variable set and the
    /// original domain.
    #[test]
    fn pruned_domain_is_an_intersection(config in arb_config(), vars in arb_vars()) {
        let names: Vec<&str> = vars.iter().map(String::as_str).collect();
        let pruned = config.prune(names.iter().copied());
        for key in pruned.domain() {
            prop_assert!(names.contains(&key));
            prop_assert!(config.variable_fixed(key));
        }
    }

    /// Configurations that agree on V prune equally on V, and hash
    /// equally via structural equality.
    #[test]
    fn agreement_on_vars_means_equal_projections(
        config in arb_config(),
        extra in proptest::collection::btree_map("[G-K]", arb_value(), 0..4),
        vars in arb_vars(),
    ) {
        // `other` differs from `config` only outside [A-F] ∪ vars.
        let other = config.update(&extra);
        let names: Vec<&str> = vars
            .iter()
            .map(String::as_str)
            .filter(|v| !extra.contains_key(*v))
            .collect();
        prop_assert_eq!(config.prune(names.iter().copied()), other.prune(names.iter().copied()));
    }

    /// Values survive pruning unchanged.
    #[test]
    fn prune_preserves_values(config in arb_config(), vars in arb_vars()) {
        let names: Vec<&str> = vars.iter().map(String::as_str).collect();
        let pruned = config.prune(names.iter().copied());
        for key in names {
            if pruned.variable_fixed(key) {
                prop_assert_eq!(pruned.get(key), config.get(key));
            }
        }
    }
}
