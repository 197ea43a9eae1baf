use std::collections::{BTreeMap, HashSet};

use tessera_schema::{EntityKey, Value};

/// Merges `incoming` into `existing` at the entity level: objects merge
/// recursively, arrays replace wholesale, proxies replace the slot, and
/// absent (`Undefined`) incoming slots leave existing data untouched.
pub fn deep_merge(existing: &mut BTreeMap<String, Value>, incoming: BTreeMap<String, Value>) {
    for (key, incoming_value) in incoming {
        if incoming_value.is_undefined() {
            continue;
        }
        let merged = match (existing.remove(&key), incoming_value) {
            (Some(Value::Object(mut old)), Value::Object(new)) => {
                deep_merge(&mut old, new);
                Value::Object(old)
            }
            (_, new) => new,
        };
        existing.insert(key, merged);
    }
}

/// Collects the keys of all entities reachable from `map` without crossing
/// another proxy boundary (a proxy's own references are tracked by its own
/// record).
pub fn collect_entity_refs(map: &BTreeMap<String, Value>) -> HashSet<EntityKey> {
    let mut refs = HashSet::new();
    for value in map.values() {
        collect_from_value(value, &mut refs);
    }
    refs
}

fn collect_from_value(value: &Value, refs: &mut HashSet<EntityKey>) {
    match value {
        Value::Entity(handle) => {
            refs.insert(handle.entity_key());
        }
        Value::Object(map) => {
            for v in map.values() {
                collect_from_value(v, refs);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_from_value(v, refs);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: Vec<(&str, Value)>) -> BTreeMap<String, Value> {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn objects_merge_recursively() {
        let mut existing = map(vec![
            ("name", Value::String("Alice".into())),
            (
                "meta",
                Value::Object(map(vec![
                    ("a", Value::Number(1.0)),
                    ("b", Value::Number(2.0)),
                ])),
            ),
        ]);
        deep_merge(
            &mut existing,
            map(vec![(
                "meta",
                Value::Object(map(vec![("b", Value::Number(20.0))])),
            )]),
        );
        let meta = existing.get("meta").unwrap().as_object().unwrap();
        assert_eq!(meta.get("a"), Some(&Value::Number(1.0)));
        assert_eq!(meta.get("b"), Some(&Value::Number(20.0)));
        assert_eq!(existing.get("name"), Some(&Value::String("Alice".into())));
    }

    #[test]
    fn arrays_replace() {
        let mut existing = map(vec![(
            "tags",
            Value::Array(vec![Value::Number(1.0), Value::Number(2.0)]),
        )]);
        deep_merge(
            &mut existing,
            map(vec![("tags", Value::Array(vec![Value::Number(3.0)]))]),
        );
        assert_eq!(
            existing.get("tags"),
            Some(&Value::Array(vec![Value::Number(3.0)]))
        );
    }

    #[test]
    fn undefined_slots_do_not_erase() {
        let mut existing = map(vec![("email", Value::String("a@x".into()))]);
        deep_merge(&mut existing, map(vec![("email", Value::Undefined)]));
        assert_eq!(existing.get("email"), Some(&Value::String("a@x".into())));
    }

    proptest::proptest! {
        #[test]
        fn merge_keys_are_the_union_and_incoming_wins(
            old in proptest::collection::btree_map("[a-z]{1,6}", proptest::num::f64::NORMAL, 0..8),
            new in proptest::collection::btree_map("[a-z]{1,6}", proptest::num::f64::NORMAL, 0..8),
        ) {
            let mut existing: BTreeMap<String, Value> =
                old.iter().map(|(k, v)| (k.clone(), Value::Number(*v))).collect();
            let incoming: BTreeMap<String, Value> =
                new.iter().map(|(k, v)| (k.clone(), Value::Number(*v))).collect();
            deep_merge(&mut existing, incoming);

            for (k, v) in &new {
                proptest::prop_assert_eq!(existing.get(k), Some(&Value::Number(*v)));
            }
            for (k, v) in &old {
                if !new.contains_key(k) {
                    proptest::prop_assert_eq!(existing.get(k), Some(&Value::Number(*v)));
                }
            }
            proptest::prop_assert_eq!(
                existing.len(),
                old.keys().chain(new.keys()).collect::<std::collections::HashSet<_>>().len()
            );
        }
    }
}
