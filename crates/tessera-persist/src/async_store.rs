use std::rc::Rc;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::facade::{QueryPersistence, SaveQueryRequest};
use crate::kv::KvStore;
use crate::message::{MessageSender, WriterMessage};
use crate::store::{CachedQuery, EntitySnapshot, QueryStore, StoreError};

/// Resolves a query definition id to its LRU queue capacity. The writer
/// needs this because mailbox messages carry no capacity of their own.
pub type QueueCapacity = Rc<dyn Fn(&str) -> usize>;

/// Async store variant: every write is enqueued into a single-writer
/// mailbox and applied strictly in order; loads read the backend directly
/// (on the async path the writer is the source of truth for reads).
pub struct AsyncQueryStore<K: KvStore> {
    store: Rc<QueryStore<K>>,
    tx: mpsc::UnboundedSender<WriterMessage>,
}

impl<K: KvStore + 'static> AsyncQueryStore<K> {
    /// Builds the store and its writer loop. The caller spawns the loop on
    /// its local executor; dropping every store handle ends the loop.
    pub fn new(kv: K, capacity: QueueCapacity) -> (Self, LocalBoxFuture<'static, ()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriterMessage>();
        let store = Rc::new(QueryStore::new(kv));
        let writer_store = store.clone();
        let writer = async move {
            while let Some(message) = rx.recv().await {
                apply(&writer_store, &capacity, message).await;
            }
            debug!("writer mailbox closed");
        }
        .boxed_local();
        (Self { store, tx }, writer)
    }

    /// Enqueues a message exactly as a remote reader would.
    pub fn enqueue(&self, message: WriterMessage) {
        if self.tx.send(message).is_err() {
            warn!("writer mailbox is gone; dropping message");
        }
    }
}

async fn apply<K: KvStore>(
    store: &QueryStore<K>,
    capacity: &QueueCapacity,
    message: WriterMessage,
) {
    let result = match message {
        WriterMessage::SaveQuery {
            query_def_id,
            query_key,
            value,
            updated_at,
            ref_ids,
            extra,
        } => {
            store
                .save_query(
                    &query_def_id,
                    query_key,
                    capacity(&query_def_id),
                    &value,
                    updated_at,
                    ref_ids.as_deref(),
                    &extra.unwrap_or_default(),
                )
                .await
        }
        WriterMessage::SaveEntity {
            entity_key,
            value,
            ref_ids,
        } => store.save_entity(entity_key, &value, ref_ids.as_deref()).await,
        WriterMessage::ActivateQuery {
            query_def_id,
            query_key,
        } => {
            store
                .activate_query(&query_def_id, query_key, capacity(&query_def_id))
                .await
        }
        WriterMessage::DeleteQuery { query_key } => store.delete_query(query_key).await,
    };
    if let Err(e) = result {
        warn!(error = %e, "writer failed to apply message");
    }
}

impl<K: KvStore + 'static> QueryPersistence for AsyncQueryStore<K> {
    fn load_query<'a>(
        &'a self,
        def_id: &'a str,
        storage_key: u32,
        max_count: usize,
        gc_time_ms: i64,
        now_ms: i64,
    ) -> LocalBoxFuture<'a, Result<Option<CachedQuery>, StoreError>> {
        self.store
            .load_query(def_id, storage_key, max_count, gc_time_ms, now_ms)
            .boxed_local()
    }

    fn load_entity(
        &self,
        entity_key: u32,
    ) -> LocalBoxFuture<'_, Result<Option<EntitySnapshot>, StoreError>> {
        self.store.load_entity(entity_key).boxed_local()
    }

    fn save_query(
        &self,
        request: SaveQueryRequest,
    ) -> LocalBoxFuture<'_, Result<(), StoreError>> {
        self.enqueue(WriterMessage::SaveQuery {
            query_def_id: request.def_id,
            query_key: request.storage_key,
            value: request.value,
            updated_at: request.updated_at,
            ref_ids: request.ref_ids,
            extra: if request.extra.is_empty() {
                None
            } else {
                Some(request.extra)
            },
        });
        async { Ok(()) }.boxed_local()
    }

    fn save_entity(
        &self,
        entity_key: u32,
        value: serde_json::Value,
        ref_ids: Option<Vec<u32>>,
    ) -> LocalBoxFuture<'_, Result<(), StoreError>> {
        self.enqueue(WriterMessage::SaveEntity {
            entity_key,
            value,
            ref_ids,
        });
        async { Ok(()) }.boxed_local()
    }

    fn activate_query<'a>(
        &'a self,
        def_id: &'a str,
        storage_key: u32,
        _max_count: usize,
    ) -> LocalBoxFuture<'a, Result<(), StoreError>> {
        self.enqueue(WriterMessage::ActivateQuery {
            query_def_id: def_id.to_string(),
            query_key: storage_key,
        });
        async { Ok(()) }.boxed_local()
    }

    fn delete_query(&self, storage_key: u32) -> LocalBoxFuture<'_, Result<(), StoreError>> {
        self.enqueue(WriterMessage::DeleteQuery {
            query_key: storage_key,
        });
        async { Ok(()) }.boxed_local()
    }
}

/// Non-writer instance of the async store: writes are forwarded over the
/// transport, loads are not supported.
pub struct ReaderQueryStore<S: MessageSender> {
    sender: S,
}

impl<S: MessageSender> ReaderQueryStore<S> {
    pub fn new(sender: S) -> Self {
        Self { sender }
    }
}

impl<S: MessageSender> QueryPersistence for ReaderQueryStore<S> {
    fn load_query<'a>(
        &'a self,
        _def_id: &'a str,
        _storage_key: u32,
        _max_count: usize,
        _gc_time_ms: i64,
        _now_ms: i64,
    ) -> LocalBoxFuture<'a, Result<Option<CachedQuery>, StoreError>> {
        async { Err(StoreError::Unsupported("loads are writer-only")) }.boxed_local()
    }

    fn load_entity(
        &self,
        _entity_key: u32,
    ) -> LocalBoxFuture<'_, Result<Option<EntitySnapshot>, StoreError>> {
        async { Err(StoreError::Unsupported("loads are writer-only")) }.boxed_local()
    }

    fn save_query(
        &self,
        request: SaveQueryRequest,
    ) -> LocalBoxFuture<'_, Result<(), StoreError>> {
        self.sender.send_message(WriterMessage::SaveQuery {
            query_def_id: request.def_id,
            query_key: request.storage_key,
            value: request.value,
            updated_at: request.updated_at,
            ref_ids: request.ref_ids,
            extra: if request.extra.is_empty() {
                None
            } else {
                Some(request.extra)
            },
        });
        async { Ok(()) }.boxed_local()
    }

    fn save_entity(
        &self,
        entity_key: u32,
        value: serde_json::Value,
        ref_ids: Option<Vec<u32>>,
    ) -> LocalBoxFuture<'_, Result<(), StoreError>> {
        self.sender.send_message(WriterMessage::SaveEntity {
            entity_key,
            value,
            ref_ids,
        });
        async { Ok(()) }.boxed_local()
    }

    fn activate_query<'a>(
        &'a self,
        def_id: &'a str,
        storage_key: u32,
        _max_count: usize,
    ) -> LocalBoxFuture<'a, Result<(), StoreError>> {
        self.sender.send_message(WriterMessage::ActivateQuery {
            query_def_id: def_id.to_string(),
            query_key: storage_key,
        });
        async { Ok(()) }.boxed_local()
    }

    fn delete_query(&self, storage_key: u32) -> LocalBoxFuture<'_, Result<(), StoreError>> {
        self.sender
            .send_message(WriterMessage::DeleteQuery {
                query_key: storage_key,
            });
        async { Ok(()) }.boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::value_key;
    use crate::kv::{KvValue, MemoryKv};
    use serde_json::json;

    #[tokio::test]
    async fn writer_applies_messages_in_order() {
        let kv = MemoryKv::new();
        let (store, writer) = AsyncQueryStore::new(kv.clone(), Rc::new(|_| 3));
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                store.enqueue(WriterMessage::SaveEntity {
                    entity_key: 11,
                    value: json!({"name": "A"}),
                    ref_ids: None,
                });
                store.enqueue(WriterMessage::SaveQuery {
                    query_def_id: "q".into(),
                    query_key: 1,
                    value: json!({"user": {"__entityRef": 11}}),
                    updated_at: 1000,
                    ref_ids: Some(vec![11]),
                    extra: None,
                });
                store.enqueue(WriterMessage::DeleteQuery { query_key: 1 });
                drop(store);
                writer.await;

                // The delete arrived last, so the query and the orphaned
                // entity are both gone.
                assert_eq!(kv.get(&value_key(1)).await.unwrap(), None);
                assert_eq!(kv.get(&value_key(11)).await.unwrap(), None);
            })
            .await;
    }

    #[tokio::test]
    async fn loads_read_through_directly() {
        let kv = MemoryKv::new();
        kv.set(&value_key(11), KvValue::Text("{\"a\":1}".into()))
            .await
            .unwrap();
        let (store, _writer) = AsyncQueryStore::new(kv, Rc::new(|_| 3));
        let snapshot = store.load_entity(11).await.unwrap().unwrap();
        assert_eq!(snapshot.value, json!({"a": 1}));
    }

    struct RecordingSender(Rc<std::cell::RefCell<Vec<WriterMessage>>>);

    impl MessageSender for RecordingSender {
        fn send_message(&self, message: WriterMessage) {
            self.0.borrow_mut().push(message);
        }
    }

    #[tokio::test]
    async fn readers_forward_writes_and_reject_loads() {
        let sent = Rc::new(std::cell::RefCell::new(Vec::new()));
        let reader = ReaderQueryStore::new(RecordingSender(sent.clone()));
        reader
            .save_entity(7, json!({"x": 1}), None)
            .await
            .unwrap();
        reader.delete_query(9).await.unwrap();
        assert_eq!(sent.borrow().len(), 2);
        assert!(matches!(
            reader.load_entity(7).await,
            Err(StoreError::Unsupported(_))
        ));
    }
}
