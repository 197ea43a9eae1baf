use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use tessera_reactive::{OwnerId, ReactiveFn, Scope, Signal};
use tessera_schema::{EntityKey, Schema, Value};
use tracing::debug;

use crate::merge::{collect_entity_refs, deep_merge};
use crate::proxy::EntityRef;

pub(crate) struct EntityRecord {
    pub key: EntityKey,
    pub type_name: String,
    pub id: String,
    pub schema: Schema,
    /// The unparsed field map. Sub-entity slots hold proxies.
    pub data: Signal<BTreeMap<String, Value>>,
    /// Bumped on every write; proxy reads consume it to re-check.
    pub notifier: Signal<u64>,
    /// Per-field parse cache, cleared on every write.
    pub cache: RefCell<HashMap<String, Value>>,
    /// Keys of entities this record references.
    pub ref_ids: RefCell<HashSet<EntityKey>>,
    pub owner: OwnerId,
    /// Reactive method wrappers, bound once per proxy.
    pub bound: RefCell<HashMap<String, Rc<tessera_reactive::CachedMethod<(u32, String), Value>>>>,
}

pub(crate) struct StoreInner {
    pub scope: Scope,
    pub records: RefCell<HashMap<EntityKey, Rc<EntityRecord>>>,
    /// Entity schemas by typename, for hydrating persisted records.
    pub schemas: RefCell<HashMap<String, Schema>>,
    /// Shared reactive function behind entity method reads; memoized per
    /// `(entity key, method name)`.
    pub method_fn: RefCell<Option<ReactiveFn<(u32, String), Value>>>,
}

/// The shared, mutable map of interned entities.
///
/// Writes flow through [`EntityStore::write`], which deep-merges into the
/// record's data signal; proxies are read-only views.
#[derive(Clone)]
pub struct EntityStore {
    pub(crate) inner: Rc<StoreInner>,
}

impl EntityStore {
    pub fn new(scope: &Scope) -> Self {
        let store = Self {
            inner: Rc::new(StoreInner {
                scope: scope.clone(),
                records: RefCell::new(HashMap::new()),
                schemas: RefCell::new(HashMap::new()),
                method_fn: RefCell::new(None),
            }),
        };
        let for_methods = store.clone();
        let method_fn = ReactiveFn::new(move |(key, name): &(u32, String)| {
            match for_methods.get(EntityKey(*key)) {
                Some(proxy) => proxy.invoke_method(name, &[]),
                None => Value::Undefined,
            }
        });
        *store.inner.method_fn.borrow_mut() = Some(method_fn);
        store
    }

    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// Interns or merges an entity record and returns its proxy.
    ///
    /// On an existing record the map is deep-merged, the parse cache is
    /// cleared, and the notifier is bumped; the data signal only re-notifies
    /// value readers when the merged map actually changed.
    pub fn write(
        &self,
        type_name: &str,
        id: &str,
        schema: &Schema,
        map: BTreeMap<String, Value>,
    ) -> EntityRef {
        self.register_schema(type_name, schema);
        let key = EntityKey::of(type_name, id);
        let existing = self.inner.records.borrow().get(&key).cloned();
        let record = match existing {
            Some(record) => {
                let mut merged = record.data.get_untracked();
                deep_merge(&mut merged, map);
                *record.ref_ids.borrow_mut() = collect_entity_refs(&merged);
                record.data.set(merged);
                record.cache.borrow_mut().clear();
                record.notifier.update(|n| *n += 1);
                record
            }
            None => {
                let mut initial = BTreeMap::new();
                deep_merge(&mut initial, map);
                let refs = collect_entity_refs(&initial);
                let owner = self.inner.scope.new_owner();
                self.inner.scope.adopt_owner(owner, &self.inner.scope);
                let record = Rc::new(EntityRecord {
                    key,
                    type_name: type_name.to_string(),
                    id: id.to_string(),
                    schema: schema.clone(),
                    data: Signal::new(&self.inner.scope, initial),
                    notifier: Signal::new(&self.inner.scope, 0),
                    cache: RefCell::new(HashMap::new()),
                    ref_ids: RefCell::new(refs),
                    owner,
                    bound: RefCell::new(HashMap::new()),
                });
                debug!(%key, type_name, id, "interned entity");
                self.inner.records.borrow_mut().insert(key, record.clone());
                record
            }
        };
        EntityRef::new(record, &self.inner)
    }

    /// Records the entity schema behind a typename so persisted records can
    /// be hydrated after a restart.
    pub fn register_schema(&self, type_name: &str, schema: &Schema) {
        self.inner
            .schemas
            .borrow_mut()
            .entry(type_name.to_string())
            .or_insert_with(|| schema.clone());
    }

    /// The registered entity schema for a typename.
    pub fn schema_for(&self, type_name: &str) -> Option<Schema> {
        self.inner.schemas.borrow().get(type_name).cloned()
    }

    /// Hydrates a persisted entity record. The snapshot carries its typename
    /// (stamped at normalization time) in the schema's discriminator slot;
    /// the schema itself is resolved from the registry.
    pub fn hydrate(&self, snapshot: &serde_json::Value) -> Option<EntityRef> {
        let value = Value::from(snapshot.clone());
        let map = value.as_object()?.clone();
        let schemas: Vec<(String, Schema)> = self
            .inner
            .schemas
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (type_name, schema) in schemas {
            let Ok(shape) = schema.shape_info() else {
                continue;
            };
            let Some(typename_field) = shape.typename_field.clone() else {
                continue;
            };
            match map.get(&typename_field) {
                Some(Value::String(s)) if *s == type_name => {}
                _ => continue,
            }
            let id_field = shape.id_field.clone()?;
            let id = match map.get(&id_field)? {
                Value::String(s) => s.clone(),
                Value::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
                Value::Number(n) => format!("{n}"),
                _ => return None,
            };
            return Some(self.write(&type_name, &id, &schema, map));
        }
        None
    }

    /// The proxy for an interned entity, if present.
    pub fn get(&self, key: EntityKey) -> Option<EntityRef> {
        let record = self.inner.records.borrow().get(&key).cloned()?;
        Some(EntityRef::new(record, &self.inner))
    }

    pub fn contains(&self, key: EntityKey) -> bool {
        self.inner.records.borrow().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.inner.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.borrow().is_empty()
    }

    /// Keys of entities directly referenced by `key`'s record.
    pub fn ref_ids(&self, key: EntityKey) -> HashSet<EntityKey> {
        self.inner
            .records
            .borrow()
            .get(&key)
            .map(|r| r.ref_ids.borrow().clone())
            .unwrap_or_default()
    }

    /// The record's raw field map with proxies collapsed to stubs, for
    /// persistence.
    pub fn snapshot(&self, key: EntityKey) -> Option<serde_json::Value> {
        let record = self.inner.records.borrow().get(&key).cloned()?;
        Some(Value::Object(record.data.get_untracked()).to_json())
    }

    /// Drops a record from memory (used when cascade deletion reaches an
    /// entity with no remaining references).
    pub fn remove(&self, key: EntityKey) {
        self.inner.records.borrow_mut().remove(&key);
    }

    /// All interned keys (diagnostics and tests).
    pub fn keys(&self) -> Vec<EntityKey> {
        self.inner.records.borrow().keys().copied().collect()
    }
}
