//! # tessera-reactive
//!
//! The single-threaded cooperative reactive substrate: signals with
//! versioned subscriber sets, memoized reactive functions, reactive
//! promises with fine-grained status flags, relays driven by activation
//! hooks, runnable tasks, and scopes that own flush scheduling, a memo
//! registry, and owner→scope resolution for cached methods.
//!
//! Mutations mark reachable subscribers dirty synchronously and schedule a
//! flush; the flush sweeps idle memo entries first, then runs each external
//! listener at most once. Recomputation is pull-based: a dirty computed
//! verifies that a dependency version actually changed before re-running
//! its body.
//!
//! Nothing here is `Send`: all futures are spawned on a local spawner
//! (e.g. a tokio `LocalSet`).

pub mod computed;
pub mod effect;
pub mod method;
pub mod promise;
pub mod relay;
pub mod scope;
pub mod signal;
pub mod task;

mod tracking;

pub use computed::{Computed, ReactiveFn};
pub use effect::Effect;
pub use method::CachedMethod;
pub use promise::{PromiseWait, ReactiveError, ReactivePromise};
pub use relay::{Relay, RelayHandle, RelayHooks, RelayWatch};
pub use scope::{OwnerId, Scope};
pub use signal::Signal;
pub use task::Task;
pub use tracking::{is_tracking, untracked};
