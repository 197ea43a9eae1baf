use futures::future::LocalBoxFuture;
use futures::FutureExt;

use crate::kv::KvStore;
use crate::store::{CachedQuery, EntitySnapshot, QueryExtras, QueryStore, StoreError};

/// A full query save, as handed to the persistence façade.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveQueryRequest {
    pub def_id: String,
    pub storage_key: u32,
    pub max_count: usize,
    pub value: serde_json::Value,
    pub updated_at: i64,
    pub ref_ids: Option<Vec<u32>>,
    pub extra: QueryExtras,
}

/// Object-safe persistence surface consumed by the query client. The sync
/// store applies operations directly; the async variant enqueues writes
/// into its writer mailbox.
pub trait QueryPersistence {
    fn load_query<'a>(
        &'a self,
        def_id: &'a str,
        storage_key: u32,
        max_count: usize,
        gc_time_ms: i64,
        now_ms: i64,
    ) -> LocalBoxFuture<'a, Result<Option<CachedQuery>, StoreError>>;

    fn load_entity(&self, entity_key: u32)
        -> LocalBoxFuture<'_, Result<Option<EntitySnapshot>, StoreError>>;

    fn save_query(&self, request: SaveQueryRequest)
        -> LocalBoxFuture<'_, Result<(), StoreError>>;

    fn save_entity(
        &self,
        entity_key: u32,
        value: serde_json::Value,
        ref_ids: Option<Vec<u32>>,
    ) -> LocalBoxFuture<'_, Result<(), StoreError>>;

    fn activate_query<'a>(
        &'a self,
        def_id: &'a str,
        storage_key: u32,
        max_count: usize,
    ) -> LocalBoxFuture<'a, Result<(), StoreError>>;

    fn delete_query(&self, storage_key: u32) -> LocalBoxFuture<'_, Result<(), StoreError>>;
}

impl<K: KvStore> QueryPersistence for QueryStore<K> {
    fn load_query<'a>(
        &'a self,
        def_id: &'a str,
        storage_key: u32,
        max_count: usize,
        gc_time_ms: i64,
        now_ms: i64,
    ) -> LocalBoxFuture<'a, Result<Option<CachedQuery>, StoreError>> {
        QueryStore::load_query(self, def_id, storage_key, max_count, gc_time_ms, now_ms).boxed_local()
    }

    fn load_entity(
        &self,
        entity_key: u32,
    ) -> LocalBoxFuture<'_, Result<Option<EntitySnapshot>, StoreError>> {
        QueryStore::load_entity(self, entity_key).boxed_local()
    }

    fn save_query(
        &self,
        request: SaveQueryRequest,
    ) -> LocalBoxFuture<'_, Result<(), StoreError>> {
        async move {
            QueryStore::save_query(
                self,
                &request.def_id,
                request.storage_key,
                request.max_count,
                &request.value,
                request.updated_at,
                request.ref_ids.as_deref(),
                &request.extra,
            )
            .await
        }
        .boxed_local()
    }

    fn save_entity(
        &self,
        entity_key: u32,
        value: serde_json::Value,
        ref_ids: Option<Vec<u32>>,
    ) -> LocalBoxFuture<'_, Result<(), StoreError>> {
        async move { QueryStore::save_entity(self, entity_key, &value, ref_ids.as_deref()).await }
            .boxed_local()
    }

    fn activate_query<'a>(
        &'a self,
        def_id: &'a str,
        storage_key: u32,
        max_count: usize,
    ) -> LocalBoxFuture<'a, Result<(), StoreError>> {
        QueryStore::activate_query(self, def_id, storage_key, max_count).boxed_local()
    }

    fn delete_query(&self, storage_key: u32) -> LocalBoxFuture<'_, Result<(), StoreError>> {
        QueryStore::delete_query(self, storage_key).boxed_local()
    }
}
