use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// A node that can be depended on: signals, computeds, and promise cells.
pub(crate) trait Source {
    fn source_id(&self) -> u64;
    /// Monotonic per-source change counter.
    fn version(&self) -> u64;
    /// Brings the source up to date (recomputes stale computeds).
    fn sync(&self);
    fn subscribe(&self, subscriber: SubscriberRef);
    fn unsubscribe(&self, subscriber_id: u64);
}

/// A node that reacts to source changes: computeds and effects.
pub(crate) trait Subscriber {
    fn subscriber_id(&self) -> u64;
    fn mark_dirty(&self);
    fn is_alive(&self) -> bool;
}

#[derive(Clone)]
pub(crate) struct SubscriberRef {
    pub id: u64,
    pub target: Weak<dyn Subscriber>,
}

/// One dependency edge recorded during a tracked run.
pub(crate) struct DepEdge {
    pub source: Rc<dyn Source>,
    pub seen_version: u64,
}

/// Dependency collector for the computation currently running.
pub(crate) struct TrackContext {
    pub subscriber: SubscriberRef,
    pub deps: RefCell<Vec<DepEdge>>,
}

thread_local! {
    static OBSERVER: RefCell<Vec<Rc<TrackContext>>> = const { RefCell::new(Vec::new()) };
}

/// Runs `f` while collecting its source reads as dependency edges.
pub(crate) fn tracked<R>(subscriber: SubscriberRef, f: impl FnOnce() -> R) -> (R, Vec<DepEdge>) {
    let ctx = Rc::new(TrackContext {
        subscriber,
        deps: RefCell::new(Vec::new()),
    });
    OBSERVER.with(|stack| stack.borrow_mut().push(ctx.clone()));
    let result = f();
    OBSERVER.with(|stack| {
        stack.borrow_mut().pop();
    });
    let deps = ctx.deps.take();
    (result, deps)
}

/// Runs `f` with dependency tracking suspended.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    OBSERVER.with(|stack| {
        let saved = std::mem::take(&mut *stack.borrow_mut());
        let result = f();
        *stack.borrow_mut() = saved;
        result
    })
}

/// Registers a read of `source` with the computation currently running, if
/// any. The source must already be synced.
pub(crate) fn track_read(source: &Rc<dyn Source>) {
    OBSERVER.with(|stack| {
        let stack = stack.borrow();
        let Some(ctx) = stack.last() else {
            return;
        };
        let mut deps = ctx.deps.borrow_mut();
        if deps
            .iter()
            .any(|edge| edge.source.source_id() == source.source_id())
        {
            return;
        }
        source.subscribe(ctx.subscriber.clone());
        deps.push(DepEdge {
            source: source.clone(),
            seen_version: source.version(),
        });
    });
}

/// True if some computation is currently tracking reads.
pub fn is_tracking() -> bool {
    OBSERVER.with(|stack| !stack.borrow().is_empty())
}
