use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use futures::future::LocalBoxFuture;
use tracing::trace;

thread_local! {
    static NEXT_NODE_ID: Cell<u64> = const { Cell::new(1) };
}

/// Process-unique id for reactive nodes and owners.
pub(crate) fn next_node_id() -> u64 {
    NEXT_NODE_ID.with(|n| {
        let id = n.get();
        n.set(id + 1);
        id
    })
}

/// A unit of work parked on the scope's flush queue.
pub(crate) trait Scheduled {
    fn flush_run(&self);
    fn is_alive(&self) -> bool;
}

/// A memoized computation owned by a scope registry.
pub(crate) trait MemoEntry {
    fn is_idle(&self) -> bool;
    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any>;
}

/// Identity of an owner object for method/scope binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub(crate) u64);

type Spawner = Rc<dyn Fn(LocalBoxFuture<'static, ()>)>;

pub(crate) struct ScopeInner {
    pending: RefCell<VecDeque<Weak<dyn Scheduled>>>,
    flushing: Cell<bool>,
    flush_scheduled: Cell<bool>,
    batch_depth: Cell<u32>,
    spawner: RefCell<Option<Spawner>>,
    memos: RefCell<HashMap<(u64, u64), Rc<dyn MemoEntry>>>,
    owner_scopes: RefCell<HashMap<OwnerId, Scope>>,
    owner_parents: RefCell<HashMap<OwnerId, OwnerId>>,
}

/// A single-threaded reactive scope: owns the flush queue, the memoized
/// reactive-function registry, and the owner→scope map.
#[derive(Clone)]
pub struct Scope {
    pub(crate) inner: Rc<ScopeInner>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                pending: RefCell::new(VecDeque::new()),
                flushing: Cell::new(false),
                flush_scheduled: Cell::new(false),
                batch_depth: Cell::new(0),
                spawner: RefCell::new(None),
                memos: RefCell::new(HashMap::new()),
                owner_scopes: RefCell::new(HashMap::new()),
                owner_parents: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakScope {
        WeakScope {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Installs an async spawner (e.g. `tokio::task::spawn_local`). With a
    /// spawner present, flushes run as queued local tasks; without one they
    /// run synchronously at the end of the outermost write.
    pub fn set_spawner(&self, spawner: impl Fn(LocalBoxFuture<'static, ()>) + 'static) {
        *self.inner.spawner.borrow_mut() = Some(Rc::new(spawner));
    }

    /// Spawns a future on the installed spawner. Returns false (and drops
    /// the future) when no spawner is installed.
    pub fn spawn(&self, future: LocalBoxFuture<'static, ()>) -> bool {
        let spawner = self.inner.spawner.borrow().clone();
        match spawner {
            Some(spawner) => {
                spawner(future);
                true
            }
            None => false,
        }
    }

    /// Groups several writes into one flush.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.batch_depth.set(self.inner.batch_depth.get() + 1);
        let result = f();
        self.inner.batch_depth.set(self.inner.batch_depth.get() - 1);
        if self.inner.batch_depth.get() == 0 {
            self.request_flush();
        }
        result
    }

    pub(crate) fn enqueue(&self, item: Weak<dyn Scheduled>) {
        self.inner.pending.borrow_mut().push_back(item);
    }

    pub(crate) fn request_flush(&self) {
        if self.inner.flushing.get() || self.inner.batch_depth.get() > 0 {
            return;
        }
        let has_spawner = self.inner.spawner.borrow().is_some();
        if has_spawner {
            if self.inner.flush_scheduled.get() {
                return;
            }
            self.inner.flush_scheduled.set(true);
            let scope = self.clone();
            self.spawn(Box::pin(async move {
                scope.inner.flush_scheduled.set(false);
                scope.flush();
            }));
        } else {
            self.flush();
        }
    }

    /// Runs the flush now: sweeps dead graph edges, then runs each pending
    /// listener at most once. Listeners scheduled during the flush are
    /// drained in the same pass.
    pub fn flush(&self) {
        if self.inner.flushing.get() {
            return;
        }
        self.inner.flushing.set(true);
        self.sweep();
        loop {
            let next = self.inner.pending.borrow_mut().pop_front();
            match next {
                Some(item) => {
                    if let Some(item) = item.upgrade() {
                        if item.is_alive() {
                            item.flush_run();
                        }
                    }
                }
                None => break,
            }
        }
        self.inner.flushing.set(false);
    }

    /// Drops memoized computations nothing subscribes to. They are rebuilt
    /// on the next call with the same identity and parameters.
    pub fn sweep(&self) {
        let mut memos = self.inner.memos.borrow_mut();
        let before = memos.len();
        memos.retain(|_, entry| !entry.is_idle());
        let dropped = before - memos.len();
        if dropped > 0 {
            trace!(dropped, "swept idle memoized computations");
        }
    }

    pub(crate) fn memo_entry<E: MemoEntry + 'static>(
        &self,
        key: (u64, u64),
        build: impl FnOnce() -> Rc<E>,
    ) -> Rc<E> {
        let existing = self.inner.memos.borrow().get(&key).cloned();
        if let Some(entry) = existing {
            if let Ok(typed) = entry.as_any_rc().downcast::<E>() {
                return typed;
            }
        }
        let entry = build();
        let erased: Rc<dyn MemoEntry> = entry.clone();
        self.inner.memos.borrow_mut().insert(key, erased);
        entry
    }

    /// Number of live memoized computations (diagnostics and tests).
    pub fn memo_count(&self) -> usize {
        self.inner.memos.borrow().len()
    }

    // -- owner → scope resolution ------------------------------------------

    /// Mints a fresh owner identity.
    pub fn new_owner(&self) -> OwnerId {
        OwnerId(next_node_id())
    }

    /// Records that `owner` (and owners linked beneath it) resolve to
    /// `scope`. The registry lives on the scope this is called on, which is
    /// conventionally the root.
    pub fn adopt_owner(&self, owner: OwnerId, scope: &Scope) {
        self.inner
            .owner_scopes
            .borrow_mut()
            .insert(owner, scope.clone());
    }

    /// Links `child` under `parent` for scope resolution.
    pub fn link_owner(&self, child: OwnerId, parent: OwnerId) {
        self.inner.owner_parents.borrow_mut().insert(child, parent);
    }

    /// Resolves the scope for `owner`, walking the owner→parent chain.
    pub fn owner_scope(&self, owner: OwnerId) -> Option<Scope> {
        let mut current = owner;
        let mut hops = 0;
        loop {
            if let Some(scope) = self.inner.owner_scopes.borrow().get(&current) {
                return Some(scope.clone());
            }
            let parent = self.inner.owner_parents.borrow().get(&current).copied()?;
            current = parent;
            hops += 1;
            if hops > 64 {
                // Cyclic owner links are a programming error; stop walking.
                return None;
            }
        }
    }
}

#[derive(Clone)]
pub(crate) struct WeakScope {
    inner: Weak<ScopeInner>,
}

impl WeakScope {
    pub fn upgrade(&self) -> Option<Scope> {
        self.inner.upgrade().map(|inner| Scope { inner })
    }
}
