use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use futures::future::LocalBoxFuture;

use crate::promise::{ReactiveError, ReactivePromise};
use crate::scope::Scope;

/// Callbacks returned by a relay's activate hook.
#[derive(Default)]
pub struct RelayHooks {
    /// Invoked by the owner when reactive inputs change while watched.
    pub on_update: Option<Box<dyn FnMut()>>,
    /// Invoked on last-unwatch.
    pub on_deactivate: Option<Box<dyn FnOnce()>>,
}

struct RelayState<T> {
    scope: Scope,
    promise: ReactivePromise<T>,
    activate: Box<dyn Fn(RelayHandle<T>) -> RelayHooks>,
    hooks: RefCell<Option<RelayHooks>>,
    watchers: Cell<usize>,
    /// Bumped on deactivate and on every `set_promise`, dropping stale async
    /// completions.
    generation: Cell<u64>,
}

/// A reactive promise driven by an external activate hook.
///
/// The hook runs on first watch and receives a [`RelayHandle`] for pushing
/// state. On last-unwatch the deactivate callback fires and in-flight
/// `set_promise` completions are dropped; observers keep the final settled
/// state until the next activation.
pub struct Relay<T> {
    state: Rc<RelayState<T>>,
}

impl<T> Clone for Relay<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + PartialEq + 'static> Relay<T> {
    pub fn new(scope: &Scope, activate: impl Fn(RelayHandle<T>) -> RelayHooks + 'static) -> Self {
        Self {
            state: Rc::new(RelayState {
                scope: scope.clone(),
                promise: ReactivePromise::new(scope),
                activate: Box::new(activate),
                hooks: RefCell::new(None),
                watchers: Cell::new(0),
                generation: Cell::new(0),
            }),
        }
    }

    /// The underlying promise for flag and value reads.
    pub fn promise(&self) -> ReactivePromise<T> {
        self.state.promise.clone()
    }

    /// Registers a watcher, activating on the 0→1 transition. Dropping the
    /// guard unwatches.
    pub fn watch(&self) -> RelayWatch<T> {
        let watchers = self.state.watchers.get() + 1;
        self.state.watchers.set(watchers);
        if watchers == 1 {
            let handle = self.handle();
            let hooks = (self.state.activate)(handle);
            *self.state.hooks.borrow_mut() = Some(hooks);
        }
        RelayWatch {
            state: Rc::downgrade(&self.state),
        }
    }

    /// Invokes the activation's update callback, if watched.
    pub fn notify_update(&self) {
        let mut hooks = self.state.hooks.borrow_mut();
        if let Some(hooks) = hooks.as_mut() {
            if let Some(on_update) = hooks.on_update.as_mut() {
                on_update();
            }
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.state.watchers.get()
    }

    /// The owner-side write surface. The same handle the activate hook
    /// receives; exposed so owners can push state between activations.
    pub fn handle(&self) -> RelayHandle<T> {
        RelayHandle {
            state: Rc::downgrade(&self.state),
        }
    }
}

/// Write surface handed to a relay's activate hook.
pub struct RelayHandle<T> {
    state: Weak<RelayState<T>>,
}

impl<T> Clone for RelayHandle<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + PartialEq + 'static> RelayHandle<T> {
    pub fn set_value(&self, value: T) {
        if let Some(state) = self.state.upgrade() {
            state.promise.set_value(value);
        }
    }

    pub fn set_error(&self, error: ReactiveError) {
        if let Some(state) = self.state.upgrade() {
            state.promise.set_error(error);
        }
    }

    pub fn set_pending(&self) {
        if let Some(state) = self.state.upgrade() {
            state.promise.set_pending();
        }
    }

    /// Adopts a future as the relay's current resolution. A later
    /// `set_promise` or a deactivation supersedes it: the superseded
    /// completion is dropped without touching the promise.
    pub fn set_promise(&self, future: LocalBoxFuture<'static, Result<T, ReactiveError>>) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        state.generation.set(state.generation.get() + 1);
        let generation = state.generation.get();
        state.promise.set_pending();
        let weak = self.state.clone();
        state.scope.spawn(Box::pin(async move {
            let result = future.await;
            let Some(state) = weak.upgrade() else {
                return;
            };
            if state.generation.get() != generation {
                return;
            }
            match result {
                Ok(value) => state.promise.set_value(value),
                Err(error) => state.promise.set_error(error),
            }
        }));
    }

    /// True while the activation that produced this handle is current.
    pub fn is_live(&self) -> bool {
        self.state
            .upgrade()
            .map(|state| state.watchers.get() > 0)
            .unwrap_or(false)
    }
}

/// Watch guard returned by [`Relay::watch`].
pub struct RelayWatch<T> {
    state: Weak<RelayState<T>>,
}

impl<T> Drop for RelayWatch<T> {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let watchers = state.watchers.get().saturating_sub(1);
        state.watchers.set(watchers);
        if watchers == 0 {
            state.generation.set(state.generation.get() + 1);
            let hooks = state.hooks.borrow_mut().take();
            if let Some(hooks) = hooks {
                if let Some(on_deactivate) = hooks.on_deactivate {
                    on_deactivate();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activates_on_first_watch_only() {
        let scope = Scope::new();
        let activations = Rc::new(Cell::new(0));
        let relay: Relay<i32> = Relay::new(&scope, {
            let activations = activations.clone();
            move |handle| {
                activations.set(activations.get() + 1);
                handle.set_value(1);
                RelayHooks::default()
            }
        });
        let w1 = relay.watch();
        let w2 = relay.watch();
        assert_eq!(activations.get(), 1);
        assert_eq!(relay.promise().value(), Some(1));
        drop(w1);
        drop(w2);
        // Final state survives deactivation.
        assert_eq!(relay.promise().value(), Some(1));
        let _w3 = relay.watch();
        assert_eq!(activations.get(), 2);
    }

    #[test]
    fn deactivate_fires_on_last_unwatch() {
        let scope = Scope::new();
        let deactivations = Rc::new(Cell::new(0));
        let relay: Relay<i32> = Relay::new(&scope, {
            let deactivations = deactivations.clone();
            move |_handle| {
                let deactivations = deactivations.clone();
                RelayHooks {
                    on_update: None,
                    on_deactivate: Some(Box::new(move || {
                        deactivations.set(deactivations.get() + 1);
                    })),
                }
            }
        });
        let w1 = relay.watch();
        let w2 = relay.watch();
        drop(w1);
        assert_eq!(deactivations.get(), 0);
        drop(w2);
        assert_eq!(deactivations.get(), 1);
    }

    #[tokio::test]
    async fn set_promise_adopts_resolution() {
        let scope = Scope::new();
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let scope_for_spawn = scope.clone();
                scope_for_spawn.set_spawner(|fut| {
                    tokio::task::spawn_local(fut);
                });
                let relay: Relay<i32> = Relay::new(&scope, |handle| {
                    handle.set_promise(Box::pin(async { Ok(7) }));
                    RelayHooks::default()
                });
                let _watch = relay.watch();
                let value = relay.promise().wait().await.unwrap();
                assert_eq!(value, 7);
            })
            .await;
    }

    #[tokio::test]
    async fn superseded_promise_is_dropped() {
        let scope = Scope::new();
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                scope.set_spawner(|fut| {
                    tokio::task::spawn_local(fut);
                });
                let relay: Relay<i32> = Relay::new(&scope, |_| RelayHooks::default());
                let watch = relay.watch();
                let handle = RelayHandle {
                    state: Rc::downgrade(&relay.state),
                };
                let (tx, rx) = futures::channel::oneshot::channel::<()>();
                handle.set_promise(Box::pin(async move {
                    let _ = rx.await;
                    Ok(1)
                }));
                handle.set_promise(Box::pin(async { Ok(2) }));
                let value = relay.promise().wait().await.unwrap();
                assert_eq!(value, 2);
                // Late completion of the first future must not clobber.
                let _ = tx.send(());
                tokio::task::yield_now().await;
                assert_eq!(relay.promise().value(), Some(2));
                drop(watch);
            })
            .await;
    }
}
