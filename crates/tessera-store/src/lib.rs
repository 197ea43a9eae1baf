//! # tessera-store
//!
//! The interned entity store and the normalization engine.
//!
//! Entities are keyed by `hash32("Typename:id")`. Each record holds its
//! unparsed field map in a data signal, a per-field parse cache, a notifier
//! bumped on every write, and the set of entity keys it references. Writes
//! deep-merge (objects recurse, arrays replace, proxies replace), so a
//! fetch completion arriving after a stream update never reverts fields the
//! stream already advanced.
//!
//! [`normalize`] walks a payload under its schema, interns every reachable
//! entity, and substitutes proxies; consumers read fields through
//! [`EntityRef`], which lazily parses and memoizes per field.

pub mod merge;
pub mod normalize;
pub mod proxy;
pub mod store;

pub use merge::{collect_entity_refs, deep_merge};
pub use normalize::normalize;
pub use proxy::EntityRef;
pub use store::EntityStore;
