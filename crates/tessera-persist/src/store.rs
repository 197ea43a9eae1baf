use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::keys::{
    optimistic_insert_refs_key, queue_key, ref_count_key, ref_ids_key, stream_orphan_refs_key,
    updated_at_key, value_key,
};
use crate::kv::{KvError, KvStore, KvValue};

/// Optional reference sets stored alongside a cached query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryExtras {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_orphan_refs: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic_insert_refs: Option<Vec<u32>>,
}

impl QueryExtras {
    pub fn is_empty(&self) -> bool {
        self.stream_orphan_refs.is_none() && self.optimistic_insert_refs.is_none()
    }
}

/// A cached query snapshot as read back from the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedQuery {
    pub value: serde_json::Value,
    pub ref_ids: Option<Vec<u32>>,
    pub updated_at: i64,
    pub extra: QueryExtras,
}

/// A persisted entity record.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub value: serde_json::Value,
    pub ref_ids: Vec<u32>,
}

/// Errors surfaced by the query store.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum StoreError {
    Kv(KvError),
    /// A cache entry failed to decode; the entry has been purged.
    Corrupt { key: String, message: String },
    /// The operation is not available on this store variant.
    Unsupported(&'static str),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kv(e) => write!(f, "{e}"),
            Self::Corrupt { key, message } => {
                write!(f, "corrupt cache entry at '{key}': {message}")
            }
            Self::Unsupported(what) => write!(f, "unsupported store operation: {what}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<KvError> for StoreError {
    fn from(e: KvError) -> Self {
        Self::Kv(e)
    }
}

/// Persistence façade over a key-value backend.
///
/// Per query definition a fixed-capacity `u32` queue holds storage keys in
/// MRU-first order; pushing a key out of the tail deletes its record.
/// Entities are reference-counted: a count reaching zero cascade-deletes
/// the entity and decrements everything it referenced.
pub struct QueryStore<K: KvStore> {
    kv: K,
}

impl<K: KvStore> QueryStore<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    /// Persists a query snapshot: value, ref diff, timestamp, extras, and an
    /// LRU touch.
    #[allow(clippy::too_many_arguments)]
    pub async fn save_query(
        &self,
        def_id: &str,
        storage_key: u32,
        max_count: usize,
        value: &serde_json::Value,
        updated_at: i64,
        ref_ids: Option<&[u32]>,
        extra: &QueryExtras,
    ) -> Result<(), StoreError> {
        let text = value.to_string();
        self.kv.set(&value_key(storage_key), KvValue::Text(text)).await?;
        self.write_refs(storage_key, ref_ids).await?;
        self.kv
            .set(&updated_at_key(storage_key), KvValue::Int(updated_at))
            .await?;
        self.write_extra(storage_key, extra).await?;
        self.activate_query(def_id, storage_key, max_count).await?;
        debug!(def_id, storage_key, "saved query snapshot");
        Ok(())
    }

    /// Persists an entity record: value plus ref diff. Ref counts of the
    /// entity itself are managed by its referrers.
    pub async fn save_entity(
        &self,
        entity_key: u32,
        value: &serde_json::Value,
        ref_ids: Option<&[u32]>,
    ) -> Result<(), StoreError> {
        self.kv
            .set(&value_key(entity_key), KvValue::Text(value.to_string()))
            .await?;
        self.write_refs(entity_key, ref_ids).await?;
        Ok(())
    }

    /// Moves `storage_key` to the front of its definition's LRU queue. The
    /// entry pushed out of the tail, if any, is deleted with cascading
    /// reference decrements.
    pub async fn activate_query(
        &self,
        def_id: &str,
        storage_key: u32,
        max_count: usize,
    ) -> Result<(), StoreError> {
        if max_count == 0 {
            return Ok(());
        }
        let key = queue_key(def_id);
        let mut queue = self
            .kv
            .get(&key)
            .await?
            .and_then(|v| v.as_u32_buf().map(<[u32]>::to_vec))
            .unwrap_or_default();
        // A max_count change reallocates the buffer, keeping the MRU prefix.
        if queue.len() != max_count {
            queue.resize(max_count, 0);
        }

        if let Some(pos) = queue.iter().position(|&k| k == storage_key) {
            queue[..=pos].rotate_right(1);
        } else {
            let evicted = queue[max_count - 1];
            for i in (1..max_count).rev() {
                queue[i] = queue[i - 1];
            }
            queue[0] = storage_key;
            if evicted != 0 {
                debug!(def_id, evicted, "LRU queue overflow, deleting query");
                self.delete_query(evicted).await?;
            }
        }
        self.kv.set(&key, KvValue::U32Buf(queue)).await?;
        Ok(())
    }

    /// Deletes a query record and decrements everything it referenced.
    pub async fn delete_query(&self, storage_key: u32) -> Result<(), StoreError> {
        self.kv.delete(&value_key(storage_key)).await?;
        self.kv.delete(&updated_at_key(storage_key)).await?;
        self.kv.delete(&stream_orphan_refs_key(storage_key)).await?;
        self.kv
            .delete(&optimistic_insert_refs_key(storage_key))
            .await?;
        let refs = self.read_refs(storage_key).await?;
        self.kv.delete(&ref_ids_key(storage_key)).await?;
        self.dec_ref_counts(refs).await?;
        Ok(())
    }

    /// Loads a cached snapshot, missing on absence or staleness beyond
    /// `gc_time_ms`. Corrupt entries are purged and demoted to a miss.
    pub async fn load_query(
        &self,
        def_id: &str,
        storage_key: u32,
        max_count: usize,
        gc_time_ms: i64,
        now_ms: i64,
    ) -> Result<Option<CachedQuery>, StoreError> {
        let Some(updated_at) = self
            .kv
            .get(&updated_at_key(storage_key))
            .await?
            .and_then(|v| v.as_int())
        else {
            return Ok(None);
        };
        if now_ms - updated_at >= gc_time_ms {
            return Ok(None);
        }
        let Some(text) = self
            .kv
            .get(&value_key(storage_key))
            .await?
            .and_then(|v| v.as_text().map(str::to_string))
        else {
            return Ok(None);
        };
        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!(storage_key, error = %e, "corrupt cached query, purging");
                self.delete_query(storage_key).await?;
                return Ok(None);
            }
        };
        let ref_ids = self
            .kv
            .get(&ref_ids_key(storage_key))
            .await?
            .and_then(|v| v.as_u32_buf().map(<[u32]>::to_vec));
        let extra = QueryExtras {
            stream_orphan_refs: self
                .kv
                .get(&stream_orphan_refs_key(storage_key))
                .await?
                .and_then(|v| v.as_u32_buf().map(<[u32]>::to_vec)),
            optimistic_insert_refs: self
                .kv
                .get(&optimistic_insert_refs_key(storage_key))
                .await?
                .and_then(|v| v.as_u32_buf().map(<[u32]>::to_vec)),
        };
        self.activate_query(def_id, storage_key, max_count).await?;
        Ok(Some(CachedQuery {
            value,
            ref_ids,
            updated_at,
            extra,
        }))
    }

    /// Loads a persisted entity record.
    pub async fn load_entity(&self, entity_key: u32) -> Result<Option<EntitySnapshot>, StoreError> {
        let Some(text) = self
            .kv
            .get(&value_key(entity_key))
            .await?
            .and_then(|v| v.as_text().map(str::to_string))
        else {
            return Ok(None);
        };
        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!(entity_key, error = %e, "corrupt cached entity, purging");
                self.kv.delete(&value_key(entity_key)).await?;
                return Ok(None);
            }
        };
        let ref_ids = self.read_refs(entity_key).await?;
        Ok(Some(EntitySnapshot { value, ref_ids }))
    }

    /// Current reference count of an entity (tests and diagnostics).
    pub async fn ref_count(&self, entity_key: u32) -> Result<i64, StoreError> {
        Ok(self
            .kv
            .get(&ref_count_key(entity_key))
            .await?
            .and_then(|v| v.as_int())
            .unwrap_or(0))
    }

    // -- internals ----------------------------------------------------------

    async fn read_refs(&self, k: u32) -> Result<Vec<u32>, StoreError> {
        Ok(self
            .kv
            .get(&ref_ids_key(k))
            .await?
            .and_then(|v| v.as_u32_buf().map(<[u32]>::to_vec))
            .unwrap_or_default())
    }

    /// Diffs the stored ref set against `new`: unchanged keys are untouched,
    /// removed keys decrement (cascading at zero), added keys increment.
    async fn write_refs(&self, k: u32, new: Option<&[u32]>) -> Result<(), StoreError> {
        let old = self.read_refs(k).await?;
        let old_set: HashSet<u32> = old.iter().copied().collect();
        let new_set: HashSet<u32> = new.unwrap_or_default().iter().copied().collect();

        for added in new_set.difference(&old_set) {
            let count = self.ref_count(*added).await? + 1;
            self.kv
                .set(&ref_count_key(*added), KvValue::Int(count))
                .await?;
        }
        let removed: Vec<u32> = old_set.difference(&new_set).copied().collect();
        self.dec_ref_counts(removed).await?;

        match new {
            Some(refs) if !refs.is_empty() => {
                self.kv
                    .set(&ref_ids_key(k), KvValue::U32Buf(refs.to_vec()))
                    .await?;
            }
            _ => {
                self.kv.delete(&ref_ids_key(k)).await?;
            }
        }
        Ok(())
    }

    /// Decrements each key once; a count reaching zero deletes the entity
    /// record and pushes its own references for decrementing in turn.
    async fn dec_ref_counts(&self, keys: Vec<u32>) -> Result<(), StoreError> {
        let mut stack = keys;
        while let Some(k) = stack.pop() {
            let count = self.ref_count(k).await? - 1;
            if count > 0 {
                self.kv.set(&ref_count_key(k), KvValue::Int(count)).await?;
            } else {
                debug!(entity_key = k, "reference count exhausted, cascading delete");
                self.kv.delete(&value_key(k)).await?;
                self.kv.delete(&ref_count_key(k)).await?;
                let children = self.read_refs(k).await?;
                self.kv.delete(&ref_ids_key(k)).await?;
                stack.extend(children);
            }
        }
        Ok(())
    }

    async fn write_extra(&self, k: u32, extra: &QueryExtras) -> Result<(), StoreError> {
        match &extra.stream_orphan_refs {
            Some(refs) => {
                self.kv
                    .set(&stream_orphan_refs_key(k), KvValue::U32Buf(refs.clone()))
                    .await?;
            }
            None => self.kv.delete(&stream_orphan_refs_key(k)).await?,
        }
        match &extra.optimistic_insert_refs {
            Some(refs) => {
                self.kv
                    .set(
                        &optimistic_insert_refs_key(k),
                        KvValue::U32Buf(refs.clone()),
                    )
                    .await?;
            }
            None => self.kv.delete(&optimistic_insert_refs_key(k)).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use serde_json::json;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn store() -> QueryStore<MemoryKv> {
        QueryStore::new(MemoryKv::new())
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = store();
        let value = json!({"user": {"__entityRef": 11}});
        store
            .save_query("users", 1, 5, &value, 1000, Some(&[11]), &QueryExtras::default())
            .await
            .unwrap();
        let loaded = store
            .load_query("users", 1, 5, DAY_MS, 2000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.value, value);
        assert_eq!(loaded.ref_ids, Some(vec![11]));
        assert_eq!(loaded.updated_at, 1000);
    }

    #[tokio::test]
    async fn stale_entries_miss() {
        let store = store();
        store
            .save_query("users", 1, 5, &json!(1), 1000, None, &QueryExtras::default())
            .await
            .unwrap();
        let hit = store.load_query("users", 1, 5, DAY_MS, 1000 + DAY_MS - 1).await.unwrap();
        assert!(hit.is_some());
        let miss = store.load_query("users", 1, 5, DAY_MS, 1000 + DAY_MS).await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn corrupt_entries_are_purged() {
        let store = store();
        store
            .save_query("users", 1, 5, &json!(1), 1000, None, &QueryExtras::default())
            .await
            .unwrap();
        store
            .kv()
            .set(&value_key(1), KvValue::Text("{not json".into()))
            .await
            .unwrap();
        let miss = store.load_query("users", 1, 5, DAY_MS, 2000).await.unwrap();
        assert!(miss.is_none());
        assert_eq!(store.kv().get(&value_key(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn ref_diff_adjusts_counts() {
        let store = store();
        store
            .save_entity(11, &json!({"id": 1}), Some(&[100]))
            .await
            .unwrap();
        store
            .save_query("q", 1, 5, &json!(1), 0, Some(&[11, 12]), &QueryExtras::default())
            .await
            .unwrap();
        assert_eq!(store.ref_count(11).await.unwrap(), 1);
        assert_eq!(store.ref_count(12).await.unwrap(), 1);
        assert_eq!(store.ref_count(100).await.unwrap(), 1);

        // Replace {11, 12} with {12, 13}: net delta +1 for 13, -1 for 11.
        store
            .save_query("q", 1, 5, &json!(2), 0, Some(&[12, 13]), &QueryExtras::default())
            .await
            .unwrap();
        assert_eq!(store.ref_count(12).await.unwrap(), 1);
        assert_eq!(store.ref_count(13).await.unwrap(), 1);
        // 11 hit zero and cascaded into 100.
        assert_eq!(store.ref_count(11).await.unwrap(), 0);
        assert_eq!(store.ref_count(100).await.unwrap(), 0);
        assert_eq!(store.kv().get(&value_key(11)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cascade_deletes_transitive_orphans() {
        let store = store();
        // Query → User(11) → Address(100).
        store
            .save_entity(100, &json!({"city": "Oslo"}), None)
            .await
            .unwrap();
        store
            .save_entity(11, &json!({"name": "A"}), Some(&[100]))
            .await
            .unwrap();
        store
            .save_query("q", 1, 1, &json!(1), 0, Some(&[11]), &QueryExtras::default())
            .await
            .unwrap();
        assert_eq!(store.ref_count(11).await.unwrap(), 1);
        assert_eq!(store.ref_count(100).await.unwrap(), 1);

        store.delete_query(1).await.unwrap();
        assert_eq!(store.kv().get(&value_key(11)).await.unwrap(), None);
        assert_eq!(store.kv().get(&value_key(100)).await.unwrap(), None);
        assert_eq!(store.kv().get(&ref_count_key(100)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn lru_touch_moves_to_front_and_dedupes() {
        let store = store();
        for k in [1u32, 2, 3] {
            store.activate_query("q", k, 3).await.unwrap();
        }
        let queue = store.kv().get(&queue_key("q")).await.unwrap().unwrap();
        assert_eq!(queue.as_u32_buf(), Some(&[3u32, 2, 1][..]));

        store.activate_query("q", 2, 3).await.unwrap();
        let queue = store.kv().get(&queue_key("q")).await.unwrap().unwrap();
        assert_eq!(queue.as_u32_buf(), Some(&[2u32, 3, 1][..]));
    }

    #[tokio::test]
    async fn lru_overflow_evicts_the_tail() {
        let store = store();
        store
            .save_query("q", 1, 2, &json!(1), 0, Some(&[11]), &QueryExtras::default())
            .await
            .unwrap();
        store
            .save_query("q", 2, 2, &json!(2), 0, None, &QueryExtras::default())
            .await
            .unwrap();
        store
            .save_query("q", 3, 2, &json!(3), 0, None, &QueryExtras::default())
            .await
            .unwrap();
        // Key 1 was pushed out; its value and its entity refs are gone.
        assert_eq!(store.kv().get(&value_key(1)).await.unwrap(), None);
        assert_eq!(store.ref_count(11).await.unwrap(), 0);
        let queue = store.kv().get(&queue_key("q")).await.unwrap().unwrap();
        assert_eq!(queue.as_u32_buf(), Some(&[3u32, 2][..]));
    }

    proptest::proptest! {
        #[test]
        fn lru_touch_invariants(touches in proptest::collection::vec(1u32..20, 1..60)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");
            runtime.block_on(async {
                let store = store();
                let last = *touches.last().expect("non-empty");
                for k in &touches {
                    store.activate_query("q", *k, 8).await.expect("activate");
                }
                let queue = store
                    .kv()
                    .get(&queue_key("q"))
                    .await
                    .expect("get")
                    .expect("queue");
                let buf = queue.as_u32_buf().expect("u32 buf").to_vec();
                // The touched key sits at the head.
                proptest::prop_assert_eq!(buf[0], last);
                // Every key appears at most once.
                let mut seen = std::collections::HashSet::new();
                for k in buf.iter().filter(|&&k| k != 0) {
                    proptest::prop_assert!(seen.insert(*k), "duplicate {} in queue", k);
                }
                Ok(())
            })?;
        }
    }

    #[tokio::test]
    async fn queue_reallocates_on_max_count_change() {
        let store = store();
        for k in [1u32, 2, 3] {
            store.activate_query("q", k, 3).await.unwrap();
        }
        store.activate_query("q", 4, 5).await.unwrap();
        let queue = store.kv().get(&queue_key("q")).await.unwrap().unwrap();
        assert_eq!(queue.as_u32_buf(), Some(&[4u32, 3, 2, 1, 0][..]));
    }

    #[tokio::test]
    async fn saving_identical_snapshot_only_touches_updated_at() {
        let store = store();
        let value = json!({"a": 1});
        store
            .save_query("q", 1, 3, &value, 1000, Some(&[7]), &QueryExtras::default())
            .await
            .unwrap();
        let before: Vec<(String, Option<KvValue>)> = {
            let mut snapshot = Vec::new();
            for key in store.kv().key_names() {
                snapshot.push((key.clone(), store.kv().get(&key).await.unwrap()));
            }
            snapshot
        };
        store
            .save_query("q", 1, 3, &value, 2000, Some(&[7]), &QueryExtras::default())
            .await
            .unwrap();
        for (key, old_value) in before {
            let new_value = store.kv().get(&key).await.unwrap();
            if key == updated_at_key(1) {
                assert_eq!(new_value, Some(KvValue::Int(2000)));
            } else {
                assert_eq!(new_value, old_value, "key {key} changed");
            }
        }
    }
}
