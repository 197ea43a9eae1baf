use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use tessera_schema::{Schema, Value};

use crate::error::ClientError;
use crate::network::NetworkMode;

/// The injected fetch surface. The core never performs transport itself;
/// embedders provide a `fetch`-shaped callable at client construction.
pub type HttpFetch =
    Rc<dyn Fn(serde_json::Value) -> LocalBoxFuture<'static, Result<serde_json::Value, ClientError>>>;

/// Context handed to `fetch_fn` / `subscribe_fn` invocations.
pub struct QueryContext {
    pub fetch: HttpFetch,
}

/// Extracted, plain parameter values for one fetch.
pub type ParamValues = BTreeMap<String, Value>;

pub type FetchFn = Rc<
    dyn Fn(
        Rc<QueryContext>,
        ParamValues,
    ) -> LocalBoxFuture<'static, Result<serde_json::Value, ClientError>>,
>;

/// Delivery callback handed to subscriptions.
pub type StreamHandler = Rc<dyn Fn(serde_json::Value)>;

/// Teardown returned by a subscription.
pub type Unsubscribe = Box<dyn FnOnce()>;

pub type SubscribeFn = Rc<dyn Fn(Rc<QueryContext>, ParamValues, StreamHandler) -> Unsubscribe>;

/// What flavor of query a definition describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Query,
    InfiniteQuery,
    Stream,
}

/// Retry policy for failed fetches.
#[derive(Clone, Default)]
pub enum RetryPolicy {
    /// 3 retries on the client, 0 on the server.
    #[default]
    Default,
    /// No retries.
    None,
    /// A fixed number of retries with the default backoff.
    Count(u32),
    /// Fully custom: retry count and per-attempt delay.
    Custom {
        retries: u32,
        delay: Rc<dyn Fn(u32) -> Duration>,
    },
}

impl RetryPolicy {
    /// Resolves to `(retries, delay_fn)`. The default delay is
    /// `1000 * 2^attempt` milliseconds.
    pub fn resolve(&self, is_server: bool) -> (u32, Rc<dyn Fn(u32) -> Duration>) {
        let default_delay: Rc<dyn Fn(u32) -> Duration> =
            Rc::new(|attempt| Duration::from_millis(1000u64.saturating_mul(1 << attempt.min(20))));
        match self {
            Self::Default => {
                let retries = if is_server { 0 } else { 3 };
                (retries, default_delay)
            }
            Self::None => (0, default_delay),
            Self::Count(retries) => (*retries, default_delay),
            Self::Custom { retries, delay } => (*retries, delay.clone()),
        }
    }
}

/// Cache behavior knobs for one query definition.
#[derive(Clone)]
pub struct CacheConfig {
    /// Age at which a cached result is considered stale. Default 0.
    pub stale_time_ms: i64,
    /// Age past which persisted results miss, and the delay before memory
    /// eviction after last-unwatch. Default 24h.
    pub gc_time_ms: i64,
    /// Capacity of the per-definition LRU queue.
    pub max_count: usize,
    pub retry: RetryPolicy,
    pub refetch_interval_ms: Option<u64>,
    pub refresh_stale_on_reconnect: bool,
    pub network_mode: NetworkMode,
}

pub const DEFAULT_GC_TIME_MS: i64 = 24 * 60 * 60 * 1000;

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: 0,
            gc_time_ms: DEFAULT_GC_TIME_MS,
            max_count: 10,
            retry: RetryPolicy::default(),
            refetch_interval_ms: None,
            refresh_stale_on_reconnect: true,
            network_mode: NetworkMode::default(),
        }
    }
}

/// Derives the parameters of the next page from the last one. `None` means
/// pagination is exhausted; a partial map merges over current params.
pub type NextPageParams = Rc<dyn Fn(&Value) -> Option<ParamValues>>;

#[derive(Clone)]
pub struct Pagination {
    pub get_next_page_params: NextPageParams,
}

/// A query definition: stable id, response shape, fetch or subscribe
/// callable, and cache configuration.
#[derive(Clone)]
pub struct QueryDef {
    pub id: String,
    pub kind: QueryKind,
    pub shape: Schema,
    pub fetch_fn: Option<FetchFn>,
    pub subscribe_fn: Option<SubscribeFn>,
    pub cache: CacheConfig,
    pub debounce_ms: Option<u64>,
    pub pagination: Option<Pagination>,
}

impl QueryDef {
    /// A plain fetch-once query.
    pub fn query(id: impl Into<String>, shape: Schema, fetch_fn: FetchFn) -> Self {
        Self {
            id: id.into(),
            kind: QueryKind::Query,
            shape,
            fetch_fn: Some(fetch_fn),
            subscribe_fn: None,
            cache: CacheConfig::default(),
            debounce_ms: None,
            pagination: None,
        }
    }

    /// A paginated query. `pagination` derives each next page's params.
    pub fn infinite(
        id: impl Into<String>,
        shape: Schema,
        fetch_fn: FetchFn,
        pagination: Pagination,
    ) -> Self {
        Self {
            id: id.into(),
            kind: QueryKind::InfiniteQuery,
            shape,
            fetch_fn: Some(fetch_fn),
            subscribe_fn: None,
            cache: CacheConfig::default(),
            debounce_ms: None,
            pagination: Some(pagination),
        }
    }

    /// A pure stream: the subscription delivers every update. The response
    /// shape must be an entity.
    pub fn stream(
        id: impl Into<String>,
        shape: Schema,
        subscribe_fn: SubscribeFn,
    ) -> Result<Self, ClientError> {
        if !shape.is_entity() {
            return Err(ClientError::Misuse(
                "stream query response schema must be an entity",
            ));
        }
        Ok(Self {
            id: id.into(),
            kind: QueryKind::Stream,
            shape,
            fetch_fn: None,
            subscribe_fn: Some(subscribe_fn),
            cache: CacheConfig::default(),
            debounce_ms: None,
            pagination: None,
        })
    }

    /// Attaches a secondary stream to a fetch query: deliveries intern
    /// entities but never touch the query's own relay.
    pub fn with_stream(mut self, subscribe_fn: SubscribeFn) -> Self {
        self.subscribe_fn = Some(subscribe_fn);
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_debounce(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = Some(debounce_ms);
        self
    }

    pub fn is_stream(&self) -> bool {
        self.kind == QueryKind::Stream
    }
}
