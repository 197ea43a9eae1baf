//! # tessera-client
//!
//! The query lifecycle: definitions, the client registry, and per-query
//! result state machines.
//!
//! A consumer materializes a [`QueryResult`] through
//! [`QueryClient::query`]; the first watcher activates it, loading the
//! persisted snapshot (preloading transitively referenced entities),
//! fetching with retry and exponential backoff, normalizing responses into
//! the entity store, and persisting results back out. Pagination appends
//! pages while pinning earlier pages' entities; streams deep-merge entity
//! state; network state pauses fetches per [`NetworkMode`]; last-unwatch
//! schedules memory eviction while the disk cache survives.

pub mod client;
pub mod definition;
pub mod error;
pub mod keys;
pub mod network;
pub mod result;

pub use client::{ClientOptions, QueryClient};
pub use definition::{
    CacheConfig, FetchFn, HttpFetch, Pagination, ParamValues, QueryContext, QueryDef, QueryKind,
    RetryPolicy, StreamHandler, SubscribeFn, Unsubscribe, DEFAULT_GC_TIME_MS,
};
pub use error::ClientError;
pub use keys::{extract_params, query_key, storage_key, ParamValue, Params};
pub use network::{NetworkManager, NetworkMode};
pub use result::{QueryResult, QueryWatch};
