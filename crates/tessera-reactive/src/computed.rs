use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use crate::scope::{next_node_id, MemoEntry, Scope, WeakScope};
use crate::signal::EqualityFn;
use crate::tracking::{tracked, track_read, DepEdge, Source, Subscriber, SubscriberRef};

pub(crate) struct ComputedState<T> {
    id: u64,
    #[allow(dead_code)]
    scope: WeakScope,
    this: RefCell<Weak<ComputedState<T>>>,
    f: Box<dyn Fn() -> T>,
    value: RefCell<Option<T>>,
    version: Cell<u64>,
    dirty: Cell<bool>,
    computing: Cell<bool>,
    deps: RefCell<Vec<DepEdge>>,
    subs: RefCell<Vec<SubscriberRef>>,
    equality: EqualityFn<T>,
}

/// A cached reactive function instance: its body runs at most once per clean
/// state, re-running lazily when a recorded dependency has changed.
pub struct Computed<T> {
    pub(crate) state: Rc<ComputedState<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + PartialEq + 'static> Computed<T> {
    pub fn new(scope: &Scope, f: impl Fn() -> T + 'static) -> Self {
        Self::with_equality(scope, f, |a, b| a == b)
    }
}

impl<T: Clone + 'static> Computed<T> {
    pub fn with_equality(
        scope: &Scope,
        f: impl Fn() -> T + 'static,
        equality: impl Fn(&T, &T) -> bool + 'static,
    ) -> Self {
        let state = Rc::new(ComputedState {
            id: next_node_id(),
            scope: scope.downgrade(),
            this: RefCell::new(Weak::new()),
            f: Box::new(f),
            value: RefCell::new(None),
            version: Cell::new(0),
            dirty: Cell::new(true),
            computing: Cell::new(false),
            deps: RefCell::new(Vec::new()),
            subs: RefCell::new(Vec::new()),
            equality: Rc::new(equality),
        });
        *state.this.borrow_mut() = Rc::downgrade(&state);
        Self { state }
    }

    /// Reads the memoized value, recomputing first if a dependency changed.
    /// Registers this computed as a dependency of the tracking computation.
    pub fn get(&self) -> T {
        let source: Rc<dyn Source> = self.state.clone();
        source.sync();
        track_read(&source);
        match self.state.value.borrow().as_ref() {
            Some(value) => value.clone(),
            // Reachable only from a self-referential computation; re-enter.
            None => (self.state.f)(),
        }
    }

    /// Current version counter (diagnostics and tests).
    pub fn version(&self) -> u64 {
        self.state.version.get()
    }
}

impl<T: Clone + 'static> ComputedState<T> {
    fn ensure_clean(self: &Rc<Self>) {
        if self.computing.get() {
            return;
        }
        let has_value = self.value.borrow().is_some();
        if has_value && !self.dirty.get() {
            return;
        }
        if has_value {
            // Dirty marks are conservative; verify a dependency actually
            // changed before re-running the body.
            let deps: Vec<(Rc<dyn Source>, u64)> = self
                .deps
                .borrow()
                .iter()
                .map(|e| (e.source.clone(), e.seen_version))
                .collect();
            let mut changed = false;
            for (source, seen) in deps {
                source.sync();
                if source.version() != seen {
                    changed = true;
                    break;
                }
            }
            if !changed {
                self.dirty.set(false);
                return;
            }
        }
        self.recompute();
    }

    fn recompute(self: &Rc<Self>) {
        self.computing.set(true);
        let old_sources: Vec<Rc<dyn Source>> = self
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
        let (result, new_deps) = tracked(subscriber, || (self.f)());

        // Unsubscribe dependencies that this run no longer consumed.
        for old in old_sources {
            if !new_deps
                .iter()
                .any(|e| e.source.source_id() == old.source_id())
            {
                old.unsubscribe(self.id);
            }
        }
        *self.deps.borrow_mut() = new_deps;

        let changed = match self.value.borrow().as_ref() {
            Some(previous) => !(self.equality)(previous, &result),
            None => true,
        };
        *self.value.borrow_mut() = Some(result);
        if changed {
            self.version.set(self.version.get() + 1);
        }
        self.dirty.set(false);
        self.computing.set(false);
    }
}

impl<T: Clone + 'static> Source for ComputedState<T> {
    fn source_id(&self) -> u64 {
        self.id
    }

    fn version(&self) -> u64 {
        self.version.get()
    }

    fn sync(&self) {
        if let Some(this) = self.this.borrow().upgrade() {
            this.ensure_clean();
        }
    }

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

impl<T: Clone + 'static> Subscriber for ComputedState<T> {
    fn subscriber_id(&self) -> u64 {
        self.id
    }

    fn mark_dirty(&self) {
        if self.dirty.get() {
            return;
        }
        self.dirty.set(true);
        // Propagate the mark through chained computeds; recomputation itself
        // stays lazy.
        let subs = {
            let mut subs = self.subs.borrow_mut();
            subs.retain(|s| s.target.strong_count() > 0);
            subs.clone()
        };
        for sub in subs {
            if let Some(target) = sub.target.upgrade() {
                target.mark_dirty();
            }
        }
    }

    fn is_alive(&self) -> bool {
        true
    }
}

impl<T: Clone + 'static> MemoEntry for ComputedState<T> {
    fn is_idle(&self) -> bool {
        let mut subs = self.subs.borrow_mut();
        subs.retain(|s| s.target.strong_count() > 0);
        subs.is_empty()
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

// ---------------------------------------------------------------------------
// ReactiveFn
// ---------------------------------------------------------------------------

/// A reactive function definition: calls are memoized per `(identity,
/// parameter hash)` within a scope, so every call site shares one
/// [`Computed`] per distinct argument value.
pub struct ReactiveFn<Args, T> {
    id: u64,
    f: Rc<dyn Fn(&Args) -> T>,
    equality: EqualityFn<T>,
}

impl<Args, T> Clone for ReactiveFn<Args, T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            f: self.f.clone(),
            equality: self.equality.clone(),
        }
    }
}

impl<Args, T> ReactiveFn<Args, T>
where
    Args: Hash + Clone + 'static,
    T: Clone + 'static,
{
    pub fn new(f: impl Fn(&Args) -> T + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::with_equality(f, |a, b| a == b)
    }

    pub fn with_equality(
        f: impl Fn(&Args) -> T + 'static,
        equality: impl Fn(&T, &T) -> bool + 'static,
    ) -> Self {
        Self {
            id: next_node_id(),
            f: Rc::new(f),
            equality: Rc::new(equality),
        }
    }

    /// Stable identity of this function definition.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Invokes through the scope's memo registry.
    pub fn call(&self, scope: &Scope, args: Args) -> T {
        self.computed(scope, args).get()
    }

    /// The memoized computed for `args`, creating it on first use.
    pub fn computed(&self, scope: &Scope, args: Args) -> Computed<T> {
        let mut hasher = DefaultHasher::new();
        args.hash(&mut hasher);
        let param_hash = hasher.finish();

        let f = self.f.clone();
        let equality = self.equality.clone();
        let scope_for_build = scope.clone();
        let state = scope.memo_entry((self.id, param_hash), move || {
            Computed::with_equality(
                &scope_for_build,
                move || f(&args),
                move |a, b| equality(a, b),
            )
            .state
        });
        Computed { state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;

    #[test]
    fn computed_runs_lazily_and_memoizes() {
        let scope = Scope::new();
        let count = Rc::new(Cell::new(0));
        let source = Signal::new(&scope, 2);
        let computed = Computed::new(&scope, {
            let count = count.clone();
            let source = source.clone();
            move || {
                count.set(count.get() + 1);
                source.get() * 10
            }
        });
        assert_eq!(count.get(), 0);
        assert_eq!(computed.get(), 20);
        assert_eq!(computed.get(), 20);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn computed_recomputes_after_dependency_change() {
        let scope = Scope::new();
        let source = Signal::new(&scope, 1);
        let computed = Computed::new(&scope, {
            let source = source.clone();
            move || source.get() + 1
        });
        assert_eq!(computed.get(), 2);
        source.set(5);
        assert_eq!(computed.get(), 6);
    }

    #[test]
    fn equal_recomputation_keeps_version() {
        let scope = Scope::new();
        let source = Signal::new(&scope, 1);
        let computed = Computed::new(&scope, {
            let source = source.clone();
            move || source.get() > 0
        });
        assert!(computed.get());
        let v = computed.version();
        source.set(2);
        assert!(computed.get());
        assert_eq!(computed.version(), v);
    }

    #[test]
    fn chained_computeds_propagate() {
        let scope = Scope::new();
        let source = Signal::new(&scope, 1);
        let doubled = Computed::new(&scope, {
            let source = source.clone();
            move || source.get() * 2
        });
        let plus_one = Computed::new(&scope, {
            let doubled = doubled.clone();
            move || doubled.get() + 1
        });
        assert_eq!(plus_one.get(), 3);
        source.set(10);
        assert_eq!(plus_one.get(), 21);
    }

    #[test]
    fn reactive_fn_memoizes_per_args() {
        let scope = Scope::new();
        let runs = Rc::new(Cell::new(0));
        let f = ReactiveFn::new({
            let runs = runs.clone();
            move |n: &i32| {
                runs.set(runs.get() + 1);
                n * 2
            }
        });
        assert_eq!(f.call(&scope, 3), 6);
        assert_eq!(f.call(&scope, 3), 6);
        assert_eq!(runs.get(), 1);
        assert_eq!(f.call(&scope, 4), 8);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn stale_dependencies_unsubscribe() {
        let scope = Scope::new();
        let flag = Signal::new(&scope, true);
        let a = Signal::new(&scope, 1);
        let b = Signal::new(&scope, 100);
        let computed = Computed::new(&scope, {
            let (flag, a, b) = (flag.clone(), a.clone(), b.clone());
            move || if flag.get() { a.get() } else { b.get() }
        });
        assert_eq!(computed.get(), 1);
        flag.set(false);
        assert_eq!(computed.get(), 100);
        let v = computed.version();
        // `a` is no longer a dependency; writing it must not re-run.
        a.set(42);
        assert_eq!(computed.get(), 100);
        assert_eq!(computed.version(), v);
    }
}
