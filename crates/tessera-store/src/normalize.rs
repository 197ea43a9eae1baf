use std::collections::HashSet;

use tessera_schema::{EntityKey, Schema, SchemaError, TypeMask, Value};
use tracing::warn;

use crate::store::EntityStore;

/// Decomposes `value` under `schema`: interns every reachable entity into
/// `store`, replaces entity subtrees with proxies, and records the keys of
/// entities referenced at this level into `refs`.
///
/// The walk is pruned by `sub_entity_paths`: entity-free subtrees are left
/// untouched. Values are stored raw; per-field validation happens lazily at
/// proxy reads.
pub fn normalize(
    value: &Value,
    schema: &Schema,
    store: &EntityStore,
    refs: &mut HashSet<EntityKey>,
) -> Result<Value, SchemaError> {
    schema.ensure_reified()?;
    let mask = schema.mask();

    if !mask.accepts(value.kind()) {
        return Ok(value.clone());
    }

    if schema.is_union() {
        return normalize_union(value, schema, store, refs);
    }

    if let Some(child) = schema.child() {
        // Arrays and records share the element walk.
        return match value {
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(normalize(item, child, store, refs)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = map.clone();
                for (key, item) in map {
                    out.insert(key.clone(), normalize(item, child, store, refs)?);
                }
                Ok(Value::Object(out))
            }
            _ => Ok(value.clone()),
        };
    }

    if schema.has_shape() {
        return normalize_object(value, schema, store, refs);
    }

    Ok(value.clone())
}

fn normalize_union(
    value: &Value,
    schema: &Schema,
    store: &EntityStore,
    refs: &mut HashSet<EntityKey>,
) -> Result<Value, SchemaError> {
    let info = schema.union_info()?;
    if let Value::Array(_) = value {
        if let Some(branch) = &info.array_branch {
            return normalize(value, branch, store, refs);
        }
        return Ok(value.clone());
    }
    let Some(map) = value.as_object() else {
        return Ok(value.clone());
    };
    let Some(field) = &info.typename_field else {
        if let Some(branch) = &info.record_branch {
            return normalize(value, branch, store, refs);
        }
        return Ok(value.clone());
    };
    match map.get(field) {
        Some(Value::String(typename)) => match info.discriminants.get(typename) {
            Some(branch) => normalize(value, branch, store, refs),
            None => match &info.record_branch {
                Some(branch) => normalize(value, branch, store, refs),
                None => Ok(value.clone()),
            },
        },
        _ => match &info.record_branch {
            Some(branch) => normalize(value, branch, store, refs),
            None => Ok(value.clone()),
        },
    }
}

fn normalize_object(
    value: &Value,
    schema: &Schema,
    store: &EntityStore,
    refs: &mut HashSet<EntityKey>,
) -> Result<Value, SchemaError> {
    // Already a proxy: nothing to do.
    if let Some(handle) = value.as_entity() {
        refs.insert(handle.entity_key());
        return Ok(value.clone());
    }
    // A serialized stub from cache hydration resolves to the preloaded
    // record without writing.
    if let Some(key) = value.entity_ref() {
        refs.insert(key);
        return match store.get(key) {
            Some(proxy) => Ok(Value::Entity(std::rc::Rc::new(proxy))),
            None => {
                warn!(%key, "entity stub points at a record that was never preloaded");
                Ok(value.clone())
            }
        };
    }

    let Some(map) = value.as_object() else {
        return Ok(value.clone());
    };
    let shape = schema.shape_info()?;
    let is_entity = schema.is_entity();

    let mut map = map.clone();
    let mut own_refs = HashSet::new();
    let child_refs: &mut HashSet<EntityKey> = if is_entity { &mut own_refs } else { refs };

    if schema.mask().contains(TypeMask::HAS_SUB_ENTITY) {
        for path in &shape.sub_entity_paths {
            let Some(slot) = map.get(path).cloned() else {
                continue;
            };
            let Some(field_schema) = shape.field_schema(path) else {
                continue;
            };
            let normalized = normalize(&slot, field_schema, store, child_refs)?;
            map.insert(path.clone(), normalized);
        }
    }

    if !is_entity {
        return Ok(Value::Object(map));
    }

    let type_name = match &shape.typename_value {
        Some(name) => name.clone(),
        None => return Err(SchemaError::MissingTypename),
    };
    let Some(id_field) = &shape.id_field else {
        return Err(SchemaError::MissingIdField(type_name));
    };
    let Some(id) = map.get(id_field).and_then(id_to_string) else {
        warn!(
            type_name,
            id_field, "entity payload has no usable id; leaving subtree unnormalized"
        );
        return Ok(Value::Object(map));
    };

    // Stamp the discriminator so persisted snapshots identify their schema
    // even when the wire payload omitted it.
    if let Some(typename_field) = &shape.typename_field {
        map.entry(typename_field.clone())
            .or_insert_with(|| Value::String(type_name.clone()));
    }

    let proxy = store.write(&type_name, &id, schema, map);
    refs.insert(proxy.key());
    Ok(Value::Entity(std::rc::Rc::new(proxy)))
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.fract() == 0.0 => Some(format!("{}", *n as i64)),
        Value::Number(n) => Some(format!("{n}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_reactive::Scope;
    use tessera_schema::{t, EntityHandle};

    fn user() -> Schema {
        t::entity(|| {
            vec![
                ("__typename".into(), t::typename("User")),
                ("id".into(), t::id()),
                ("name".into(), t::string()),
                ("address".into(), t::optional(&address())),
            ]
        })
    }

    fn address() -> Schema {
        t::entity(|| {
            vec![
                ("__typename".into(), t::typename("Address")),
                ("id".into(), t::id()),
                ("city".into(), t::string()),
            ]
        })
    }

    fn setup() -> (Scope, EntityStore) {
        let scope = Scope::new();
        let store = EntityStore::new(&scope);
        (scope, store)
    }

    #[test]
    fn interns_reachable_entities() {
        let (_scope, store) = setup();
        let schema = t::object(vec![("user".to_string(), user())]);
        let payload = Value::from(json!({
            "user": {
                "__typename": "User",
                "id": 1,
                "name": "Alice",
                "address": {"__typename": "Address", "id": 100, "city": "Oslo"}
            }
        }));
        let mut refs = HashSet::new();
        let result = normalize(&payload, &schema, &store, &mut refs).unwrap();

        assert!(store.contains(EntityKey::of("User", "1")));
        assert!(store.contains(EntityKey::of("Address", "100")));
        // Top-level refs contain only the directly referenced user.
        assert_eq!(refs.len(), 1);
        assert!(refs.contains(&EntityKey::of("User", "1")));
        // The user's record references the address.
        assert!(store
            .ref_ids(EntityKey::of("User", "1"))
            .contains(&EntityKey::of("Address", "100")));

        let map = result.as_object().unwrap();
        let user_value = map.get("user").unwrap();
        assert!(user_value.as_entity().is_some());
    }

    #[test]
    fn arrays_of_entities_normalize_each_element() {
        let (_scope, store) = setup();
        let schema = t::array(user());
        let payload = Value::from(json!([
            {"__typename": "User", "id": 1, "name": "A"},
            {"__typename": "User", "id": 2, "name": "B"},
        ]));
        let mut refs = HashSet::new();
        normalize(&payload, &schema, &store, &mut refs).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn stubs_resolve_without_writes() {
        let (_scope, store) = setup();
        let schema = user();
        let payload = Value::from(json!({"__typename": "User", "id": 1, "name": "Alice"}));
        let mut refs = HashSet::new();
        normalize(&payload, &schema, &store, &mut refs).unwrap();
        let key = EntityKey::of("User", "1");
        let notifier_before = store.get(key).unwrap().field("name");

        let stub = Value::from(json!({"__entityRef": key.0}));
        let mut refs2 = HashSet::new();
        let hydrated = normalize(&stub, &schema, &store, &mut refs2).unwrap();
        assert!(hydrated.as_entity().is_some());
        assert_eq!(store.len(), 1);
        assert_eq!(refs2.len(), 1);
        assert_eq!(
            store.get(key).unwrap().field("name"),
            notifier_before
        );
    }

    #[test]
    fn union_payloads_dispatch_by_typename() {
        let (_scope, store) = setup();
        let admin = t::entity(|| {
            vec![
                ("__typename".into(), t::typename("Admin")),
                ("id".into(), t::id()),
            ]
        });
        let schema = t::union(vec![user(), admin]).unwrap();
        let payload = Value::from(json!({"__typename": "Admin", "id": 7}));
        let mut refs = HashSet::new();
        normalize(&payload, &schema, &store, &mut refs).unwrap();
        assert!(store.contains(EntityKey::of("Admin", "7")));
        assert!(!store.contains(EntityKey::of("User", "7")));
    }

    #[test]
    fn entity_free_payloads_pass_through() {
        let (_scope, store) = setup();
        let schema = t::object(vec![("count".to_string(), t::number())]);
        let payload = Value::from(json!({"count": 3}));
        let mut refs = HashSet::new();
        let result = normalize(&payload, &schema, &store, &mut refs).unwrap();
        assert_eq!(result, payload);
        assert!(store.is_empty());
        assert!(refs.is_empty());
    }

    #[test]
    fn dedup_across_payloads_updates_one_record() {
        let (_scope, store) = setup();
        let schema = user();
        let mut refs = HashSet::new();
        normalize(
            &Value::from(json!({"__typename": "User", "id": 1, "name": "Alice", "email": "a@x"})),
            &schema,
            &store,
            &mut refs,
        )
        .unwrap();
        normalize(
            &Value::from(json!({"__typename": "User", "id": 1, "name": "Alice Updated"})),
            &schema,
            &store,
            &mut refs,
        )
        .unwrap();
        assert_eq!(store.len(), 1);
        let proxy = store.get(EntityKey::of("User", "1")).unwrap();
        assert_eq!(proxy.field("name"), Value::String("Alice Updated".into()));
        assert_eq!(proxy.field("email"), Value::String("a@x".into()));
    }
}
