use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::scope::{next_node_id, Scope, WeakScope};
use crate::tracking::{track_read, Source, SubscriberRef};

pub(crate) type EqualityFn<T> = Rc<dyn Fn(&T, &T) -> bool>;

pub(crate) struct SignalState<T> {
    id: u64,
    scope: WeakScope,
    value: RefCell<T>,
    version: Cell<u64>,
    equality: EqualityFn<T>,
    subs: RefCell<Vec<SubscriberRef>>,
}

/// A reactive value holder with a versioned subscriber set.
///
/// Reads inside a reactive computation register the reader; writes that are
/// unequal under the configured equality bump the version, mark subscribers
/// dirty, and schedule their external listeners.
pub struct Signal<T> {
    pub(crate) state: Rc<SignalState<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + PartialEq + 'static> Signal<T> {
    pub fn new(scope: &Scope, value: T) -> Self {
        Self::with_equality(scope, value, |a, b| a == b)
    }
}

impl<T: Clone + 'static> Signal<T> {
    /// A signal with custom change detection.
    pub fn with_equality(
        scope: &Scope,
        value: T,
        equality: impl Fn(&T, &T) -> bool + 'static,
    ) -> Self {
        Self {
            state: Rc::new(SignalState {
                id: next_node_id(),
                scope: scope.downgrade(),
                value: RefCell::new(value),
                version: Cell::new(1),
                equality: Rc::new(equality),
                subs: RefCell::new(Vec::new()),
            }),
        }
    }

    /// A signal that notifies on every write, even equal ones.
    pub fn always_notify(scope: &Scope, value: T) -> Self {
        Self::with_equality(scope, value, |_, _| false)
    }

    /// Stable identity of this signal (used by query-key derivation).
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Reads the value, registering a dependency when tracked.
    pub fn get(&self) -> T {
        self.track();
        self.state.value.borrow().clone()
    }

    /// Reads through a closure without cloning the value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.track();
        f(&self.state.value.borrow())
    }

    /// Reads without registering a dependency.
    pub fn get_untracked(&self) -> T {
        self.state.value.borrow().clone()
    }

    /// Writes the value. No-op when the equality deems it unchanged.
    pub fn set(&self, value: T) {
        let changed = {
            let current = self.state.value.borrow();
            !(self.state.equality)(&current, &value)
        };
        if !changed {
            return;
        }
        *self.state.value.borrow_mut() = value;
        self.state.version.set(self.state.version.get() + 1);
        self.notify();
    }

    /// Mutates in place and notifies unconditionally.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.state.value.borrow_mut());
        self.state.version.set(self.state.version.get() + 1);
        self.notify();
    }

    fn track(&self) {
        let source: Rc<dyn Source> = self.state.clone();
        track_read(&source);
    }

    fn notify(&self) {
        let subs = {
            let mut subs = self.state.subs.borrow_mut();
            subs.retain(|s| s.target.strong_count() > 0);
            subs.clone()
        };
        for sub in subs {
            if let Some(target) = sub.target.upgrade() {
                target.mark_dirty();
            }
        }
        if let Some(scope) = self.state.scope.upgrade() {
            scope.request_flush();
        }
    }

    /// Current version counter (diagnostics and tests).
    pub fn version(&self) -> u64 {
        self.state.version.get()
    }
}

impl<T: 'static> Source for SignalState<T> {
    fn source_id(&self) -> u64 {
        self.id
    }

    fn version(&self) -> u64 {
        self.version.get()
    }

    fn sync(&self) {}

    fn subscribe(&self, subscriber: SubscriberRef) {
        let mut subs = self.subs.borrow_mut();
        if subs.iter().any(|s| s.id == subscriber.id) {
            return;
        }
        subs.push(subscriber);
    }

    fn unsubscribe(&self, subscriber_id: u64) {
        self.subs.borrow_mut().retain(|s| s.id != subscriber_id);
    }
}
