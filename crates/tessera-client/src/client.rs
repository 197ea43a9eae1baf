use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use tessera_persist::QueryPersistence;
use tessera_reactive::Scope;
use tessera_schema::Schema;
use tessera_store::EntityStore;
use tracing::debug;

use crate::definition::{HttpFetch, QueryContext, QueryDef};
use crate::error::ClientError;
use crate::keys::{query_key, Params};
use crate::network::NetworkManager;
use crate::result::QueryResult;

/// Construction options for [`QueryClient`].
pub struct ClientOptions {
    pub fetch: HttpFetch,
    /// Servers default to zero fetch retries.
    pub is_server: bool,
    /// Scales the memory-eviction delay applied after last-unwatch.
    pub eviction_multiplier: f64,
    pub initially_online: bool,
    /// Injectable clock (epoch milliseconds); tests pin this.
    pub now_fn: Option<Rc<dyn Fn() -> i64>>,
}

impl ClientOptions {
    pub fn new(fetch: HttpFetch) -> Self {
        Self {
            fetch,
            is_server: false,
            eviction_multiplier: 1.0,
            initially_online: true,
            now_fn: None,
        }
    }
}

pub(crate) struct ClientInner {
    pub scope: Scope,
    pub entities: EntityStore,
    pub persist: Rc<dyn QueryPersistence>,
    pub context: Rc<QueryContext>,
    pub network: NetworkManager,
    pub is_server: bool,
    pub eviction_multiplier: f64,
    pub registry: RefCell<HashMap<u32, QueryResult>>,
    eviction_gens: RefCell<HashMap<u32, u64>>,
    now_fn: Rc<dyn Fn() -> i64>,
}

impl ClientInner {
    pub fn now(&self) -> i64 {
        (self.now_fn)()
    }

    pub fn cancel_eviction(&self, query_key: u32) {
        let mut gens = self.eviction_gens.borrow_mut();
        let generation = gens.entry(query_key).or_insert(0);
        *generation += 1;
    }

    /// Schedules removal of the query result from the in-memory registry.
    /// Re-activation before the deadline cancels it; the persisted cache
    /// entry survives either way, subject to the store's LRU.
    pub fn schedule_eviction(self: &Rc<Self>, query_key: u32, delay_ms: u64) {
        let generation = {
            let mut gens = self.eviction_gens.borrow_mut();
            let generation = gens.entry(query_key).or_insert(0);
            *generation += 1;
            *generation
        };
        let weak = Rc::downgrade(self);
        let spawned = self.scope.spawn(Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let Some(client) = weak.upgrade() else {
                return;
            };
            let current = client
                .eviction_gens
                .borrow()
                .get(&query_key)
                .copied()
                .unwrap_or(0);
            if current != generation {
                return;
            }
            let still_watched = client
                .registry
                .borrow()
                .get(&query_key)
                .map(|result| result.watcher_count() > 0)
                .unwrap_or(false);
            if !still_watched {
                client.registry.borrow_mut().remove(&query_key);
                client.eviction_gens.borrow_mut().remove(&query_key);
                debug!(query_key, "evicted query result from memory");
            }
        }));
        if !spawned {
            debug!(query_key, "no spawner; memory eviction skipped");
        }
    }
}

/// The query registry: materializes (or reuses) a [`QueryResult`] per
/// `(definition, parameter identity)` pair, wires the network manager, and
/// owns memory eviction. All cache writes go through the persistence
/// façade; the client never mutates persistent state directly.
#[derive(Clone)]
pub struct QueryClient {
    inner: Rc<ClientInner>,
}

impl QueryClient {
    pub fn new(persist: Rc<dyn QueryPersistence>, options: ClientOptions) -> Self {
        let scope = Scope::new();
        let entities = EntityStore::new(&scope);
        let network = NetworkManager::new(&scope, options.initially_online);
        let now_fn = options
            .now_fn
            .unwrap_or_else(|| Rc::new(|| chrono::Utc::now().timestamp_millis()));
        Self {
            inner: Rc::new(ClientInner {
                scope,
                entities,
                persist,
                context: Rc::new(QueryContext {
                    fetch: options.fetch,
                }),
                network,
                is_server: options.is_server,
                eviction_multiplier: options.eviction_multiplier,
                registry: RefCell::new(HashMap::new()),
                eviction_gens: RefCell::new(HashMap::new()),
                now_fn,
            }),
        }
    }

    /// The reactive scope the client schedules on. Install a spawner
    /// (e.g. `tokio::task::spawn_local`) before activating queries.
    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// The interned entity store.
    pub fn entities(&self) -> &EntityStore {
        &self.inner.entities
    }

    pub fn network(&self) -> &NetworkManager {
        &self.inner.network
    }

    /// The injected fetch-era context handed to fetch and subscribe
    /// callables.
    pub fn get_context(&self) -> Rc<QueryContext> {
        self.inner.context.clone()
    }

    /// Materializes a query result, reusing the live instance under the
    /// same query key (in-flight dedup).
    pub fn query(&self, def: &QueryDef, params: Params) -> Result<QueryResult, ClientError> {
        def.shape.ensure_reified()?;
        let mut visited = HashSet::new();
        register_entity_schemas(&def.shape, &self.inner.entities, &mut visited);

        let key = query_key(def, &params)?;
        if let Some(existing) = self.inner.registry.borrow().get(&key) {
            return Ok(existing.clone());
        }
        let result = QueryResult::new(&self.inner, def.clone(), params, key);
        self.inner.registry.borrow_mut().insert(key, result.clone());
        debug!(query_key = key, def_id = %def.id, "materialized query result");
        Ok(result)
    }

    /// Number of live query results (diagnostics and tests).
    pub fn registry_len(&self) -> usize {
        self.inner.registry.borrow().len()
    }
}

/// Walks a response shape and registers every entity schema by typename,
/// so persisted records can hydrate before their first network write.
fn register_entity_schemas(schema: &Schema, entities: &EntityStore, visited: &mut HashSet<String>) {
    if schema.ensure_reified().is_err() {
        return;
    }
    if schema.is_entity() {
        let Some(type_name) = schema.typename_value() else {
            return;
        };
        if !visited.insert(type_name.clone()) {
            return;
        }
        entities.register_schema(&type_name, schema);
    }
    if schema.has_shape() {
        if let Ok(shape) = schema.shape_info() {
            for (_, child) in &shape.fields {
                register_entity_schemas(child, entities, visited);
            }
        }
    } else if let Some(child) = schema.child() {
        register_entity_schemas(child, entities, visited);
    } else if schema.is_union() {
        if let Ok(info) = schema.union_info() {
            for branch in info.discriminants.values() {
                register_entity_schemas(branch, entities, visited);
            }
            if let Some(branch) = &info.array_branch {
                register_entity_schemas(branch, entities, visited);
            }
            if let Some(branch) = &info.record_branch {
                register_entity_schemas(branch, entities, visited);
            }
        }
    }
}
