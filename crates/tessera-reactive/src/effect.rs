use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::scope::{next_node_id, Scheduled, Scope, WeakScope};
use crate::tracking::{tracked, DepEdge, Subscriber, SubscriberRef};

pub(crate) struct EffectState {
    id: u64,
    scope: WeakScope,
    this: RefCell<Weak<EffectState>>,
    f: RefCell<Box<dyn FnMut()>>,
    deps: RefCell<Vec<DepEdge>>,
    scheduled: Cell<bool>,
    alive: Cell<bool>,
}

/// An external listener: runs once on creation, tracking its reads, then
/// re-runs on the scope flush after any dependency changes. Fires at most
/// once per flush regardless of how many dependencies changed.
///
/// The effect stops when this handle is dropped or [`Effect::dispose`] is
/// called.
pub struct Effect {
    state: Rc<EffectState>,
}

impl Effect {
    pub fn new(scope: &Scope, f: impl FnMut() + 'static) -> Self {
        let state = Rc::new(EffectState {
            id: next_node_id(),
            scope: scope.downgrade(),
            this: RefCell::new(Weak::new()),
            f: RefCell::new(Box::new(f)),
            deps: RefCell::new(Vec::new()),
            scheduled: Cell::new(false),
            alive: Cell::new(true),
        });
        *state.this.borrow_mut() = Rc::downgrade(&state);
        state.run();
        Self { state }
    }

    /// Permanently stops the effect and drops its subscriptions.
    pub fn dispose(&self) {
        self.state.alive.set(false);
        for edge in self.state.deps.borrow().iter() {
            edge.source.unsubscribe(self.state.id);
        }
        self.state.deps.borrow_mut().clear();
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl EffectState {
    fn run(&self) {
        if !self.alive.get() {
            return;
        }
        let old_sources: Vec<_> = self
            .deps
            .borrow()
            .iter()
            .map(|e| e.source.clone())
            .collect();
        let weak: Weak<dyn Subscriber> = self.this.borrow().clone();
        let subscriber = SubscriberRef {
            id: self.id,
            target: weak,
        };
        let (_, new_deps) = tracked(subscriber, || (self.f.borrow_mut())());
        for old in old_sources {
            if !new_deps
                .iter()
                .any(|e| e.source.source_id() == old.source_id())
            {
                old.unsubscribe(self.id);
            }
        }
        *self.deps.borrow_mut() = new_deps;
    }
}

impl Subscriber for EffectState {
    fn subscriber_id(&self) -> u64 {
        self.id
    }

    fn mark_dirty(&self) {
        if !self.alive.get() || self.scheduled.get() {
            return;
        }
        self.scheduled.set(true);
        if let Some(scope) = self.scope.upgrade() {
            let weak: Weak<dyn Scheduled> = self.this.borrow().clone();
            scope.enqueue(weak);
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.get()
    }
}

impl Scheduled for EffectState {
    fn flush_run(&self) {
        self.scheduled.set(false);
        // Dependencies are verified by version before re-running: a dirty
        // mark from an equal write is a no-op.
        let mut changed = self.deps.borrow().is_empty();
        for edge in self.deps.borrow().iter() {
            edge.source.sync();
            if edge.source.version() != edge.seen_version {
                changed = true;
                break;
            }
        }
        if changed {
            self.run();
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.get()
    }
}
