//! # tessera-persist
//!
//! Cache persistence over a pluggable key-value backend.
//!
//! This crate provides:
//! - The [`KvStore`] contract (strings, numbers, `u32` buffers in a flat
//!   namespace under the `tessera:` prefix) and an in-memory reference
//!   backend
//! - The sync [`QueryStore`]: snapshot save/load, reference-count diffing
//!   with cascade deletion, and a fixed-capacity MRU queue per query
//!   definition
//! - The async variant: a strictly-FIFO single-writer mailbox fed by
//!   [`WriterMessage`]s, plus the reader-side store that forwards writes
//!   over a [`MessageTransport`]
//! - The object-safe [`QueryPersistence`] façade the query client consumes

pub mod async_store;
pub mod facade;
pub mod keys;
pub mod kv;
pub mod message;
pub mod store;

pub use async_store::{AsyncQueryStore, QueueCapacity, ReaderQueryStore};
pub use facade::{QueryPersistence, SaveQueryRequest};
pub use kv::{KvError, KvStore, KvValue, MemoryKv};
pub use message::{MessageSender, MessageTransport, WriterMessage};
pub use store::{CachedQuery, EntitySnapshot, QueryExtras, QueryStore, StoreError};
