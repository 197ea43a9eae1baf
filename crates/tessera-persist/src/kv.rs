use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

/// A value in the key-value backend: strings, numbers, or little-endian
/// `u32` buffers.
#[derive(Debug, Clone, PartialEq)]
pub enum KvValue {
    Text(String),
    Int(i64),
    U32Buf(Vec<u32>),
}

impl KvValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_u32_buf(&self) -> Option<&[u32]> {
        match self {
            Self::U32Buf(buf) => Some(buf),
            _ => None,
        }
    }
}

/// Errors surfaced by key-value backends.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum KvError {
    /// The backend rejected or failed the operation.
    Backend(String),
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(message) => write!(f, "kv backend error: {message}"),
        }
    }
}

impl std::error::Error for KvError {}

/// Storage-agnostic key-value contract for cache persistence.
///
/// Keys live in a flat namespace under the reserved `tessera:` prefix.
/// Uses RPITIT for async methods, avoiding the `async-trait` crate; no
/// `Send` bounds, as the cache is single-threaded cooperative.
pub trait KvStore {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<KvValue>, KvError>>;

    fn set(&self, key: &str, value: KvValue) -> impl Future<Output = Result<(), KvError>>;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), KvError>>;
}

/// In-memory reference backend. Doubles as the semantics fixture for the
/// KV contract in tests.
#[derive(Clone, Default)]
pub struct MemoryKv {
    entries: Rc<RefCell<BTreeMap<String, KvValue>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys (diagnostics and tests).
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Snapshot of all keys (tests).
    pub fn key_names(&self) -> Vec<String> {
        self.entries.borrow().keys().cloned().collect()
    }
}

impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvValue>, KvError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    async fn set(&self, key: &str, value: KvValue) -> Result<(), KvError> {
        self.entries.borrow_mut().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_kv_round_trips() {
        let kv = MemoryKv::new();
        kv.set("tessera:value:1", KvValue::Text("x".into()))
            .await
            .unwrap();
        kv.set("tessera:refIds:1", KvValue::U32Buf(vec![2, 3]))
            .await
            .unwrap();
        assert_eq!(
            kv.get("tessera:value:1").await.unwrap(),
            Some(KvValue::Text("x".into()))
        );
        assert_eq!(
            kv.get("tessera:refIds:1")
                .await
                .unwrap()
                .unwrap()
                .as_u32_buf(),
            Some(&[2u32, 3][..])
        );
        kv.delete("tessera:value:1").await.unwrap();
        assert_eq!(kv.get("tessera:value:1").await.unwrap(), None);
        assert_eq!(kv.len(), 1);
    }
}
