use std::fmt;
use std::rc::{Rc, Weak};

use tessera_reactive::CachedMethod;
use tessera_schema::{parse_at, EntityHandle, EntityKey, Path, Value};
use tracing::warn;

use crate::store::{EntityRecord, StoreInner};

/// Read-only proxy over an interned entity.
///
/// Field reads register reactive dependencies on the record's data signal
/// and notifier, then lazily parse the raw slot through the entity schema,
/// memoizing the result until the next write.
pub struct EntityRef {
    record: Rc<EntityRecord>,
    store: Weak<StoreInner>,
}

impl EntityRef {
    pub(crate) fn new(record: Rc<EntityRecord>, store: &Rc<StoreInner>) -> Self {
        Self {
            record,
            store: Rc::downgrade(store),
        }
    }

    pub fn key(&self) -> EntityKey {
        self.record.key
    }

    /// Invokes a schema method directly with `args`. Reads the method makes
    /// through this proxy are tracked like any other reactive read.
    pub fn invoke_method(&self, name: &str, args: &[Value]) -> Value {
        let table = match self.record.schema.methods() {
            Ok(Some(table)) => table,
            Ok(None) => {
                warn!(entity = %self.record.key, name, "method call on entity without methods");
                return Value::Undefined;
            }
            Err(e) => {
                warn!(entity = %self.record.key, name, error = %e, "method table failed to build");
                return Value::Undefined;
            }
        };
        match table.get(name) {
            Some(method) => method(self, args),
            None => {
                warn!(entity = %self.record.key, name, "unknown entity method");
                Value::Undefined
            }
        }
    }

    /// Reads a zero-argument method through its once-bound reactive wrapper:
    /// the result is memoized per `(entity, method)` in the owner's scope
    /// and recomputes only when the fields it read change.
    pub fn method_value(&self, name: &str) -> Value {
        if let Some(bound) = self.record.bound.borrow().get(name).cloned() {
            return bound.call((self.record.key.0, name.to_string()));
        }
        let Some(store) = self.store.upgrade() else {
            return Value::Undefined;
        };
        let Some(method_fn) = store.method_fn.borrow().clone() else {
            return Value::Undefined;
        };
        let bound = Rc::new(CachedMethod::bind(
            &store.scope,
            self.record.owner,
            method_fn,
        ));
        self.record
            .bound
            .borrow_mut()
            .insert(name.to_string(), bound.clone());
        bound.call((self.record.key.0, name.to_string()))
    }
}

impl Clone for EntityRef {
    fn clone(&self) -> Self {
        Self {
            record: self.record.clone(),
            store: self.store.clone(),
        }
    }
}

impl EntityHandle for EntityRef {
    fn entity_key(&self) -> EntityKey {
        self.record.key
    }

    fn type_name(&self) -> String {
        self.record.type_name.clone()
    }

    fn id(&self) -> String {
        self.record.id.clone()
    }

    fn field(&self, name: &str) -> Value {
        // Consume the notifier so any write forces a re-check, then read the
        // data signal to register value-level reactivity.
        let _ = self.record.notifier.get();
        if let Some(cached) = self.record.cache.borrow().get(name).cloned() {
            return cached;
        }
        let raw = self
            .record
            .data
            .with(|map| map.get(name).cloned())
            .unwrap_or(Value::Undefined);

        // A persisted sub-entity slot holds a reference stub; resolve it to
        // the interned record before parsing.
        if let Some(stub_key) = raw.entity_ref() {
            if let Some(store) = self.store.upgrade() {
                if let Some(record) = store.records.borrow().get(&stub_key).cloned() {
                    let resolved = Value::Entity(Rc::new(EntityRef::new(record, &store)));
                    self.record
                        .cache
                        .borrow_mut()
                        .insert(name.to_string(), resolved.clone());
                    return resolved;
                }
            }
            warn!(entity = %self.record.key, field = name, %stub_key, "dangling entity stub");
            return Value::Undefined;
        }

        let parsed = match self.record.schema.shape_info() {
            Ok(shape) => match shape.field_schema(name) {
                Some(field_schema) => {
                    let mut path = Path::root();
                    path.push_field(name);
                    match parse_at(&raw, field_schema, &mut path, false) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            warn!(entity = %self.record.key, error = %e, "field failed to parse");
                            Value::Undefined
                        }
                    }
                }
                // Fields outside the schema pass through unparsed.
                None => raw,
            },
            Err(e) => {
                warn!(entity = %self.record.key, error = %e, "entity shape failed to reify");
                raw
            }
        };
        self.record
            .cache
            .borrow_mut()
            .insert(name.to_string(), parsed.clone());
        parsed
    }

    fn raw_field(&self, name: &str) -> Option<Value> {
        self.record.data.with(|map| map.get(name).cloned())
    }

    fn field_names(&self) -> Vec<String> {
        self.record
            .data
            .get_untracked()
            .keys()
            .cloned()
            .collect()
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} {{", self.record.type_name, self.record.id)?;
        let data = self.record.data.get_untracked();
        for (i, (name, value)) in data.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {name}: {value}")?;
        }
        write!(f, " }}")
    }
}
