use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::future::{LocalBoxFuture, Shared};
use futures::FutureExt;
use tessera_persist::SaveQueryRequest;
use tessera_reactive::{
    untracked, Effect, ReactiveError, ReactivePromise, Relay, RelayHooks, RelayWatch, Signal,
};
use tessera_schema::{parse, EntityKey, Value};
use tessera_store::normalize;
use tracing::{debug, warn};

use crate::client::ClientInner;
use crate::definition::{ParamValues, QueryDef, QueryKind, StreamHandler, Unsubscribe};
use crate::error::ClientError;
use crate::keys::{extract_params, storage_key, Params};
use crate::network::NetworkMode;

type SharedFetch = Shared<LocalBoxFuture<'static, Result<Value, ClientError>>>;

#[derive(Clone, Default)]
enum NextPage {
    /// Not derived from the current last page yet.
    #[default]
    NotComputed,
    /// `get_next_page_params` returned `undefined`: pagination is done.
    Exhausted,
    /// Params for the next fetch, merged over current params.
    Ready(ParamValues),
}

pub(crate) struct ResultInner {
    pub def: QueryDef,
    pub client: Weak<ClientInner>,
    pub params: Params,
    pub query_key: u32,
    relay: RefCell<Option<Relay<Value>>>,

    initialized: Cell<bool>,
    storage_key: Cell<u32>,
    updated_at: Cell<Option<i64>>,
    current_values: RefCell<ParamValues>,
    /// Normalized raw pages (proxies in place). Plain queries keep exactly
    /// one; infinite queries accumulate.
    pages: RefCell<Vec<Value>>,
    ref_ids: RefCell<HashSet<EntityKey>>,
    /// Entities delivered by a secondary stream that the cached value does
    /// not reference; persisted so they stay pinned.
    orphan_refs: RefCell<HashSet<EntityKey>>,
    next_page: RefCell<NextPage>,

    is_refetching: Signal<bool>,
    is_fetching_more: Signal<bool>,
    paused: Signal<bool>,
    effect_primed: Cell<bool>,

    unsubscribe: RefCell<Option<Unsubscribe>>,
    update_effect: RefCell<Option<Effect>>,
    debounce_gen: Cell<u64>,
    fetch_gen: Cell<u64>,
    interval_gen: Cell<u64>,
    refetch_shared: RefCell<Option<SharedFetch>>,
}

/// A cacheable, reactive, refetchable handle to a single query's result.
///
/// Backed by a relay: the first watcher activates the lifecycle (cache
/// load, entity preload, fetch), the last unwatch deactivates it and
/// schedules memory eviction. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct QueryResult {
    pub(crate) inner: Rc<ResultInner>,
}

/// Watch guard: holds the query active. Dropping the last one deactivates.
pub struct QueryWatch {
    _watch: RelayWatch<Value>,
}

impl QueryResult {
    pub(crate) fn new(
        client: &Rc<ClientInner>,
        def: QueryDef,
        params: Params,
        query_key: u32,
    ) -> Self {
        let scope = client.scope.clone();
        let inner = Rc::new(ResultInner {
            def,
            client: Rc::downgrade(client),
            params,
            query_key,
            relay: RefCell::new(None),
            initialized: Cell::new(false),
            storage_key: Cell::new(0),
            updated_at: Cell::new(None),
            current_values: RefCell::new(ParamValues::new()),
            pages: RefCell::new(Vec::new()),
            ref_ids: RefCell::new(HashSet::new()),
            orphan_refs: RefCell::new(HashSet::new()),
            next_page: RefCell::new(NextPage::NotComputed),
            is_refetching: Signal::new(&scope, false),
            is_fetching_more: Signal::new(&scope, false),
            paused: Signal::new(&scope, false),
            effect_primed: Cell::new(false),
            unsubscribe: RefCell::new(None),
            update_effect: RefCell::new(None),
            debounce_gen: Cell::new(0),
            fetch_gen: Cell::new(0),
            interval_gen: Cell::new(0),
            refetch_shared: RefCell::new(None),
        });
        let weak = Rc::downgrade(&inner);
        let relay = Relay::new(&scope, move |_handle| match weak.upgrade() {
            Some(inner) => ResultInner::activate(&inner),
            None => RelayHooks::default(),
        });
        *inner.relay.borrow_mut() = Some(relay);
        Self { inner }
    }

    /// Starts watching: the first watcher activates the query.
    pub fn watch(&self) -> QueryWatch {
        let relay = self.relay();
        QueryWatch {
            _watch: relay.watch(),
        }
    }

    fn relay(&self) -> Relay<Value> {
        self.inner
            .relay
            .borrow()
            .clone()
            .unwrap_or_else(|| unreachable_relay())
    }

    /// The promise surface: value, error, and status flags.
    pub fn promise(&self) -> ReactivePromise<Value> {
        self.relay().promise()
    }

    pub fn value(&self) -> Option<Value> {
        self.promise().value()
    }

    pub fn error(&self) -> Option<ReactiveError> {
        self.promise().error()
    }

    pub fn is_pending(&self) -> bool {
        self.promise().is_pending()
    }

    pub fn is_resolved(&self) -> bool {
        self.promise().is_resolved()
    }

    pub fn is_rejected(&self) -> bool {
        self.promise().is_rejected()
    }

    pub fn is_ready(&self) -> bool {
        self.promise().is_ready()
    }

    pub fn is_settled(&self) -> bool {
        self.promise().is_settled()
    }

    /// Resolves at the next settlement.
    pub async fn wait(&self) -> Result<Value, ReactiveError> {
        self.promise().wait().await
    }

    pub fn is_refetching(&self) -> bool {
        self.inner.is_refetching.get()
    }

    pub fn is_fetching_more(&self) -> bool {
        self.inner.is_fetching_more.get()
    }

    /// `isPending ∨ isRefetching ∨ isFetchingMore`.
    pub fn is_fetching(&self) -> bool {
        self.is_pending() || self.is_refetching() || self.is_fetching_more()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.get()
    }

    /// `now − updatedAt ≥ staleTime`. Streams are never stale.
    pub fn is_stale(&self) -> bool {
        self.inner.is_stale()
    }

    /// True while another page may exist. Derives the next page's params on
    /// demand from the last page.
    pub fn has_next_page(&self) -> bool {
        !matches!(self.inner.ensure_next_page(), NextPage::Exhausted)
    }

    pub fn query_key(&self) -> u32 {
        self.inner.query_key
    }

    /// Number of active watchers (diagnostics; drives eviction checks).
    pub fn watcher_count(&self) -> usize {
        self.relay().watcher_count()
    }

    pub fn storage_key(&self) -> u32 {
        self.inner.storage_key.get()
    }

    /// Re-runs the fetch with reset semantics: the page array restarts and
    /// the reference set is replaced. While a refetch is already in flight
    /// the same promise is returned; while paginating, rejects.
    pub fn refetch(&self) -> LocalBoxFuture<'static, Result<Value, ClientError>> {
        ResultInner::refetch(&self.inner, true)
    }

    /// Fetches the next page and appends it. Rejects while refetching, on
    /// streams, and when pagination is exhausted.
    pub fn fetch_next_page(&self) -> LocalBoxFuture<'static, Result<Value, ClientError>> {
        ResultInner::fetch_next_page(&self.inner)
    }
}

fn unreachable_relay() -> Relay<Value> {
    // The relay is installed in `new` before any handle escapes; this path
    // exists only to avoid panicking APIs.
    warn!("query result used before its relay was installed");
    Relay::new(&tessera_reactive::Scope::new(), |_| RelayHooks::default())
}

impl ResultInner {
    // -- activation ---------------------------------------------------------

    fn activate(inner: &Rc<Self>) -> RelayHooks {
        let Some(client) = inner.client.upgrade() else {
            return RelayHooks::default();
        };
        client.cancel_eviction(inner.query_key);

        // Reactive update surface: re-extracts params and pause state, and
        // reacts to changes while watched.
        inner.effect_primed.set(false);
        let effect_inner = Rc::downgrade(inner);
        let effect = Effect::new(&client.scope, move || {
            if let Some(inner) = effect_inner.upgrade() {
                ResultInner::on_reactive_update(&inner);
            }
        });
        *inner.update_effect.borrow_mut() = Some(effect);

        let task_inner = inner.clone();
        spawn(&client, async move {
            ResultInner::activation_task(&task_inner).await;
        });

        let deactivate_inner = Rc::downgrade(inner);
        RelayHooks {
            on_update: None,
            on_deactivate: Some(Box::new(move || {
                if let Some(inner) = deactivate_inner.upgrade() {
                    ResultInner::deactivate(&inner);
                }
            })),
        }
    }

    async fn activation_task(inner: &Rc<Self>) {
        let Some(client) = inner.client.upgrade() else {
            return;
        };
        let values = untracked(|| extract_params(&inner.params));
        let skey = match storage_key(&inner.def, &values) {
            Ok(skey) => skey,
            Err(e) => {
                inner.commit(Err(ClientError::Schema(e)));
                return;
            }
        };
        inner.storage_key.set(skey);
        *inner.current_values.borrow_mut() = values;

        let paused = untracked(|| inner.compute_paused(&client));
        inner.paused.set(paused);

        // Cache load never fails the query: errors demote to a warning.
        if inner.updated_at.get().is_none() {
            match client
                .persist
                .load_query(
                    &inner.def.id,
                    skey,
                    inner.def.cache.max_count,
                    inner.def.cache.gc_time_ms,
                    client.now(),
                )
                .await
            {
                Ok(Some(cached)) => {
                    Self::preload_entities(&client, cached.ref_ids.as_deref()).await;
                    if let Some(orphans) = cached.extra.stream_orphan_refs.as_deref() {
                        Self::preload_entities(&client, Some(orphans)).await;
                        inner
                            .orphan_refs
                            .borrow_mut()
                            .extend(orphans.iter().map(|k| EntityKey(*k)));
                    }
                    inner.publish_snapshot(&client, cached.value, cached.updated_at, cached.ref_ids);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "cache load failed; proceeding to fetch");
                }
            }
        }

        let first = !inner.initialized.get();
        inner.initialized.set(true);

        if inner.def.kind == QueryKind::Stream {
            Self::subscribe_stream(inner, &client);
            return;
        }
        // Secondary stream subscriptions come up on every activation.
        if inner.def.subscribe_fn.is_some() {
            Self::subscribe_stream(inner, &client);
        }

        let paused = inner.paused.get_untracked();
        if first {
            if inner.updated_at.get().is_some() {
                if !paused && inner.is_stale() {
                    if inner.def.debounce_ms.is_some() {
                        Self::schedule_debounced_refetch(inner);
                    } else {
                        let _ = Self::refetch(inner, false).await;
                    }
                }
            } else {
                // No cache: immediate, non-debounced initial fetch.
                let values = inner.current_values.borrow().clone();
                let result = Self::run_query(inner, values, true).await;
                if !matches!(result, Err(ClientError::Superseded)) {
                    inner.commit(result);
                }
            }
        } else if !paused && inner.is_stale() {
            let _ = Self::refetch(inner, false).await;
        }

        if let Some(interval) = inner.def.cache.refetch_interval_ms {
            Self::spawn_refetch_interval(inner, interval);
        }
    }

    fn deactivate(inner: &Rc<Self>) {
        inner.debounce_gen.set(inner.debounce_gen.get() + 1);
        inner.interval_gen.set(inner.interval_gen.get() + 1);
        if let Some(effect) = inner.update_effect.borrow_mut().take() {
            effect.dispose();
        }
        if let Some(unsubscribe) = inner.unsubscribe.borrow_mut().take() {
            unsubscribe();
        }
        if let Some(client) = inner.client.upgrade() {
            let delay =
                (inner.def.cache.gc_time_ms as f64 * client.eviction_multiplier).max(0.0) as u64;
            client.schedule_eviction(inner.query_key, delay);
        }
        debug!(query_key = inner.query_key, "query deactivated");
    }

    // -- reactive update ----------------------------------------------------

    fn on_reactive_update(inner: &Rc<Self>) {
        let Some(client) = inner.client.upgrade() else {
            return;
        };
        // Tracked reads: param signals and the online cell.
        let values = extract_params(&inner.params);
        let paused_now = inner.compute_paused(&client);

        if !inner.effect_primed.get() {
            inner.effect_primed.set(true);
            return;
        }

        let was_paused = inner.paused.get_untracked();
        if was_paused != paused_now {
            inner.paused.set(paused_now);
            if was_paused
                && !paused_now
                && inner.def.kind != QueryKind::Stream
                && inner.def.cache.refresh_stale_on_reconnect
                && inner.is_stale()
            {
                let refetch_inner = inner.clone();
                spawn(&client, async move {
                    let _ = ResultInner::refetch(&refetch_inner, false).await;
                });
            }
        }

        let changed = { *inner.current_values.borrow() != values };
        if changed {
            let Ok(new_skey) = storage_key(&inner.def, &values) else {
                return;
            };
            let old_skey = inner.storage_key.get();
            *inner.current_values.borrow_mut() = values;
            if new_skey == old_skey {
                return;
            }
            inner.storage_key.set(new_skey);
            inner.updated_at.set(None);
            *inner.next_page.borrow_mut() = NextPage::NotComputed;
            debug!(query_key = inner.query_key, "params changed, storage key rotated");
            if inner.def.kind == QueryKind::Stream {
                Self::subscribe_stream(inner, &client);
            } else {
                Self::schedule_debounced_refetch(inner);
            }
        }
    }

    // -- fetch path ---------------------------------------------------------

    fn refetch(inner: &Rc<Self>, manual: bool) -> LocalBoxFuture<'static, Result<Value, ClientError>> {
        if inner.def.kind == QueryKind::Stream {
            return ready_err(ClientError::Misuse("refetch is not available on streams"));
        }
        if inner.is_fetching_more.get_untracked() {
            return ready_err(ClientError::Misuse("refetch while a page fetch is running"));
        }
        if let Some(existing) = inner.refetch_shared.borrow().clone() {
            return Box::pin(existing);
        }
        if manual {
            // A manual refetch cancels any pending debounced one.
            inner.debounce_gen.set(inner.debounce_gen.get() + 1);
        }
        *inner.next_page.borrow_mut() = NextPage::NotComputed;
        inner.is_refetching.set(true);

        let run_inner = inner.clone();
        let future = async move {
            let values = { run_inner.current_values.borrow().clone() };
            let result = ResultInner::run_query(&run_inner, values, true).await;
            run_inner.is_refetching.set(false);
            *run_inner.refetch_shared.borrow_mut() = None;
            if !matches!(result, Err(ClientError::Superseded)) {
                run_inner.commit(result.clone());
            }
            result
        }
        .boxed_local()
        .shared();
        *inner.refetch_shared.borrow_mut() = Some(future.clone());
        Box::pin(future)
    }

    fn fetch_next_page(inner: &Rc<Self>) -> LocalBoxFuture<'static, Result<Value, ClientError>> {
        if inner.def.kind == QueryKind::Stream {
            return ready_err(ClientError::Misuse("fetchNextPage is not available on streams"));
        }
        if inner.def.pagination.is_none() {
            return ready_err(ClientError::Misuse("query has no pagination"));
        }
        if inner.is_refetching.get_untracked() {
            return ready_err(ClientError::Misuse("fetchNextPage while refetching"));
        }
        let next_values = match inner.ensure_next_page() {
            NextPage::Ready(values) => values,
            NextPage::Exhausted => return ready_err(ClientError::NoNextPage),
            NextPage::NotComputed => return ready_err(ClientError::NoNextPage),
        };
        inner.is_fetching_more.set(true);

        let run_inner = inner.clone();
        async move {
            let result = ResultInner::run_query(&run_inner, next_values.clone(), false).await;
            run_inner.is_fetching_more.set(false);
            if !matches!(result, Err(ClientError::Superseded)) {
                if result.is_ok() {
                    // The page cursor advances with the successful fetch.
                    *run_inner.current_values.borrow_mut() = next_values;
                }
                run_inner.commit(result.clone());
            }
            result
        }
        .boxed_local()
    }

    /// One fetch with retry. On success the payload is normalized into the
    /// entity store, assembled (append vs reset for infinite queries),
    /// persisted, and returned parsed.
    async fn run_query(
        inner: &Rc<Self>,
        values: ParamValues,
        reset: bool,
    ) -> Result<Value, ClientError> {
        let Some(client) = inner.client.upgrade() else {
            return Err(ClientError::Fetch("client dropped".into()));
        };
        if untracked(|| inner.compute_paused(&client)) {
            return Err(ClientError::Paused);
        }
        let Some(fetch_fn) = inner.def.fetch_fn.clone() else {
            return Err(ClientError::Misuse("query has no fetch function"));
        };

        inner.fetch_gen.set(inner.fetch_gen.get() + 1);
        let generation = inner.fetch_gen.get();

        let (retries, delay) = inner.def.cache.retry.resolve(client.is_server);
        let mut attempt: u32 = 0;
        let raw_json = loop {
            match fetch_fn(client.context.clone(), values.clone()).await {
                Ok(raw) => break raw,
                Err(e) => {
                    if attempt >= retries {
                        warn!(error = %e, attempts = attempt + 1, "fetch failed, retries exhausted");
                        return Err(e);
                    }
                    warn!(error = %e, attempt, "fetch attempt failed; backing off");
                    tokio::time::sleep(delay(attempt)).await;
                    // Pause aborts at the attempt boundary.
                    if untracked(|| inner.compute_paused(&client)) {
                        return Err(ClientError::Paused);
                    }
                    attempt += 1;
                }
            }
        };

        // A newer fetch started while this one was in flight: drop it.
        if inner.fetch_gen.get() != generation {
            return Err(ClientError::Superseded);
        }

        let raw = Value::from(raw_json);
        let mut refs: HashSet<EntityKey> = if reset {
            HashSet::new()
        } else {
            // Pagination retains earlier pages' refs so their entities stay
            // pinned.
            inner.ref_ids.borrow().clone()
        };
        let normalized = normalize(&raw, &inner.def.shape, &client.entities, &mut refs)
            .map_err(ClientError::Schema)?;

        let (raw_snapshot, parsed) = match inner.def.kind {
            QueryKind::InfiniteQuery => {
                {
                    let mut pages = inner.pages.borrow_mut();
                    if reset {
                        pages.clear();
                    }
                    pages.push(normalized);
                }
                let pages = inner.pages.borrow().clone();
                let mut parsed_pages = Vec::with_capacity(pages.len());
                for page in &pages {
                    parsed_pages
                        .push(parse(page, &inner.def.shape).map_err(ClientError::Validation)?);
                }
                (Value::Array(pages), Value::Array(parsed_pages))
            }
            _ => {
                *inner.pages.borrow_mut() = vec![normalized.clone()];
                let parsed = parse(&normalized, &inner.def.shape).map_err(ClientError::Validation)?;
                (normalized, parsed)
            }
        };

        *inner.ref_ids.borrow_mut() = refs.clone();
        let now = client.now();
        inner.updated_at.set(Some(now));
        *inner.next_page.borrow_mut() = NextPage::NotComputed;

        inner
            .persist_snapshot(&client, raw_snapshot.to_json(), &refs, now)
            .await;
        Ok(parsed)
    }

    // -- persistence --------------------------------------------------------

    async fn persist_snapshot(
        &self,
        client: &Rc<ClientInner>,
        value: serde_json::Value,
        refs: &HashSet<EntityKey>,
        updated_at: i64,
    ) {
        // Entities first, so a load never sees dangling stubs.
        let mut visited: HashSet<EntityKey> = HashSet::new();
        let mut stack: Vec<EntityKey> = refs
            .iter()
            .chain(self.orphan_refs.borrow().iter())
            .copied()
            .collect();
        while let Some(key) = stack.pop() {
            if !visited.insert(key) {
                continue;
            }
            let Some(snapshot) = client.entities.snapshot(key) else {
                continue;
            };
            let child_refs: Vec<u32> = client
                .entities
                .ref_ids(key)
                .iter()
                .map(|k| k.0)
                .collect();
            stack.extend(client.entities.ref_ids(key));
            let ref_arg = if child_refs.is_empty() {
                None
            } else {
                Some(child_refs)
            };
            if let Err(e) = client.persist.save_entity(key.0, snapshot, ref_arg).await {
                warn!(entity_key = key.0, error = %e, "entity save failed");
            }
        }

        let mut ref_ids: Vec<u32> = refs.iter().map(|k| k.0).collect();
        ref_ids.sort_unstable();
        let mut orphans: Vec<u32> = self.orphan_refs.borrow().iter().map(|k| k.0).collect();
        orphans.sort_unstable();
        let request = SaveQueryRequest {
            def_id: self.def.id.clone(),
            storage_key: self.storage_key.get(),
            max_count: self.def.cache.max_count,
            value,
            updated_at,
            ref_ids: if ref_ids.is_empty() {
                None
            } else {
                Some(ref_ids)
            },
            extra: tessera_persist::QueryExtras {
                stream_orphan_refs: if orphans.is_empty() {
                    None
                } else {
                    Some(orphans)
                },
                optimistic_insert_refs: None,
            },
        };
        if let Err(e) = client.persist.save_query(request).await {
            warn!(error = %e, "query save failed");
        }
    }

    async fn preload_entities(client: &Rc<ClientInner>, refs: Option<&[u32]>) {
        let Some(refs) = refs else {
            return;
        };
        let mut visited: HashSet<u32> = HashSet::new();
        let mut stack: Vec<u32> = refs.to_vec();
        while let Some(key) = stack.pop() {
            if !visited.insert(key) {
                continue;
            }
            match client.persist.load_entity(key).await {
                Ok(Some(snapshot)) => {
                    stack.extend(snapshot.ref_ids.iter().copied());
                    if client.entities.hydrate(&snapshot.value).is_none() {
                        warn!(entity_key = key, "entity snapshot could not be hydrated");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(entity_key = key, error = %e, "entity preload failed"),
            }
        }
    }

    /// Publishes a cached snapshot through the relay.
    fn publish_snapshot(
        &self,
        client: &Rc<ClientInner>,
        value: serde_json::Value,
        updated_at: i64,
        ref_ids: Option<Vec<u32>>,
    ) {
        let raw = Value::from(value);
        let mut refs = HashSet::new();
        let publish = (|| -> Result<Value, ClientError> {
            match self.def.kind {
                QueryKind::InfiniteQuery => {
                    let Value::Array(raw_pages) = raw else {
                        return Err(ClientError::Fetch("cached infinite value not an array".into()));
                    };
                    let mut pages = Vec::with_capacity(raw_pages.len());
                    let mut parsed_pages = Vec::with_capacity(raw_pages.len());
                    for page in &raw_pages {
                        let normalized =
                            normalize(page, &self.def.shape, &client.entities, &mut refs)
                                .map_err(ClientError::Schema)?;
                        parsed_pages.push(
                            parse(&normalized, &self.def.shape).map_err(ClientError::Validation)?,
                        );
                        pages.push(normalized);
                    }
                    *self.pages.borrow_mut() = pages;
                    Ok(Value::Array(parsed_pages))
                }
                _ => {
                    let normalized = normalize(&raw, &self.def.shape, &client.entities, &mut refs)
                        .map_err(ClientError::Schema)?;
                    *self.pages.borrow_mut() = vec![normalized.clone()];
                    parse(&normalized, &self.def.shape).map_err(ClientError::Validation)
                }
            }
        })();
        match publish {
            Ok(parsed) => {
                self.updated_at.set(Some(updated_at));
                *self.ref_ids.borrow_mut() = match ref_ids {
                    Some(ids) => ids.into_iter().map(EntityKey).collect(),
                    None => refs,
                };
                self.commit(Ok(parsed));
            }
            Err(e) => {
                warn!(error = %e, "cached snapshot failed to hydrate; ignoring");
            }
        }
    }

    // -- streams ------------------------------------------------------------

    fn subscribe_stream(inner: &Rc<Self>, client: &Rc<ClientInner>) {
        let Some(subscribe_fn) = inner.def.subscribe_fn.clone() else {
            return;
        };
        if let Some(previous) = inner.unsubscribe.borrow_mut().take() {
            previous();
        }
        let handler_inner = Rc::downgrade(inner);
        let handler: StreamHandler = Rc::new(move |json| {
            if let Some(inner) = handler_inner.upgrade() {
                ResultInner::on_stream_delivery(&inner, json);
            }
        });
        let values = inner.current_values.borrow().clone();
        let unsubscribe = subscribe_fn(client.context.clone(), values, handler);
        *inner.unsubscribe.borrow_mut() = Some(unsubscribe);
        debug!(query_key = inner.query_key, "stream subscribed");
    }

    fn on_stream_delivery(inner: &Rc<Self>, json: serde_json::Value) {
        let Some(client) = inner.client.upgrade() else {
            return;
        };
        let raw = Value::from(json);
        let mut refs = HashSet::new();
        let normalized = match normalize(&raw, &inner.def.shape, &client.entities, &mut refs) {
            Ok(normalized) => normalized,
            Err(e) => {
                warn!(error = %e, "stream update failed to normalize; dropped");
                return;
            }
        };

        if inner.def.kind == QueryKind::Stream {
            let parsed = match parse(&normalized, &inner.def.shape) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "stream update failed validation; dropped");
                    return;
                }
            };
            let now = client.now();
            let previous: HashSet<EntityKey> = inner.ref_ids.borrow().clone();
            // Entities referenced by earlier deliveries but not this one stay
            // pinned through the orphan set.
            inner
                .orphan_refs
                .borrow_mut()
                .extend(previous.difference(&refs).copied());
            *inner.ref_ids.borrow_mut() = refs.clone();
            inner.updated_at.set(Some(now));
            inner.commit(Ok(parsed));

            let persist_inner = inner.clone();
            let snapshot = normalized.to_json();
            spawn(&client, async move {
                let Some(client) = persist_inner.client.upgrade() else {
                    return;
                };
                persist_inner
                    .persist_snapshot(&client, snapshot, &refs, now)
                    .await;
            });
        } else {
            // Secondary stream: entity propagation only; the relay belongs
            // to the fetch path. New entities are pinned as orphans.
            let known: HashSet<EntityKey> = inner.ref_ids.borrow().clone();
            inner
                .orphan_refs
                .borrow_mut()
                .extend(refs.difference(&known).copied());
            let persist_inner = inner.clone();
            spawn(&client, async move {
                let Some(client) = persist_inner.client.upgrade() else {
                    return;
                };
                for key in refs {
                    let Some(snapshot) = client.entities.snapshot(key) else {
                        continue;
                    };
                    let child_refs: Vec<u32> =
                        client.entities.ref_ids(key).iter().map(|k| k.0).collect();
                    let ref_arg = if child_refs.is_empty() {
                        None
                    } else {
                        Some(child_refs)
                    };
                    if let Err(e) = client.persist.save_entity(key.0, snapshot, ref_arg).await {
                        warn!(entity_key = key.0, error = %e, "stream entity save failed");
                    }
                }
            });
        }
    }

    // -- timers -------------------------------------------------------------

    fn schedule_debounced_refetch(inner: &Rc<Self>) {
        let Some(client) = inner.client.upgrade() else {
            return;
        };
        inner.debounce_gen.set(inner.debounce_gen.get() + 1);
        let generation = inner.debounce_gen.get();
        let delay = inner.def.debounce_ms.unwrap_or(0);
        let timer_inner = inner.clone();
        spawn(&client, async move {
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if timer_inner.debounce_gen.get() != generation {
                return;
            }
            let _ = ResultInner::refetch(&timer_inner, false).await;
        });
    }

    fn spawn_refetch_interval(inner: &Rc<Self>, interval_ms: u64) {
        let Some(client) = inner.client.upgrade() else {
            return;
        };
        inner.interval_gen.set(inner.interval_gen.get() + 1);
        let generation = inner.interval_gen.get();
        let timer_inner = inner.clone();
        spawn(&client, async move {
            loop {
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                if timer_inner.interval_gen.get() != generation {
                    return;
                }
                let _ = ResultInner::refetch(&timer_inner, false).await;
            }
        });
    }

    // -- small helpers ------------------------------------------------------

    fn commit(&self, result: Result<Value, ClientError>) {
        let Some(relay) = self.relay.borrow().clone() else {
            return;
        };
        match result {
            Ok(value) => relay.handle().set_value(value),
            Err(ClientError::Superseded) => {}
            Err(e) => relay.handle().set_error(ReactiveError::new(e)),
        }
    }

    fn is_stale(&self) -> bool {
        if self.def.kind == QueryKind::Stream {
            return false;
        }
        let Some(client) = self.client.upgrade() else {
            return false;
        };
        match self.updated_at.get() {
            Some(updated_at) => client.now() - updated_at >= self.def.cache.stale_time_ms,
            None => true,
        }
    }

    fn compute_paused(&self, client: &Rc<ClientInner>) -> bool {
        if self.def.kind == QueryKind::Stream {
            return false;
        }
        match self.def.cache.network_mode {
            NetworkMode::Always => false,
            NetworkMode::Online => !client.network.is_online(),
            NetworkMode::OfflineFirst => {
                !client.network.is_online() && self.updated_at.get().is_none()
            }
        }
    }

    fn ensure_next_page(&self) -> NextPage {
        let needs_compute = matches!(*self.next_page.borrow(), NextPage::NotComputed);
        if needs_compute {
            let last_page = self.pages.borrow().last().cloned();
            let computed = match (&self.def.pagination, last_page) {
                (Some(pagination), Some(last_page)) => {
                    match (pagination.get_next_page_params)(&last_page) {
                        Some(partial) => {
                            let mut merged = self.current_values.borrow().clone();
                            merged.extend(partial);
                            NextPage::Ready(merged)
                        }
                        None => NextPage::Exhausted,
                    }
                }
                _ => NextPage::Exhausted,
            };
            *self.next_page.borrow_mut() = computed;
        }
        self.next_page.borrow().clone()
    }
}

fn spawn(client: &Rc<ClientInner>, future: impl std::future::Future<Output = ()> + 'static) {
    if !client.scope.spawn(Box::pin(future)) {
        warn!("no spawner installed on the client scope; async query work dropped");
    }
}

fn ready_err(e: ClientError) -> LocalBoxFuture<'static, Result<Value, ClientError>> {
    async move { Err(e) }.boxed_local()
}
