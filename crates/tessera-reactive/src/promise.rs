use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::scope::Scope;
use crate::signal::Signal;
use crate::tracking::untracked;

/// Cloneable error payload carried by rejected reactive promises.
///
/// Compares by identity: two errors are equal only if they are the same
/// allocation, which keeps error signals from re-notifying on re-set.
#[derive(Clone)]
pub struct ReactiveError(Rc<dyn std::error::Error>);

impl ReactiveError {
    pub fn new(error: impl std::error::Error + 'static) -> Self {
        Self(Rc::new(error))
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self(Rc::new(MessageError(message.into())))
    }

    pub fn inner(&self) -> &dyn std::error::Error {
        self.0.as_ref()
    }
}

impl PartialEq for ReactiveError {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for ReactiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ReactiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReactiveError({})", self.0)
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MessageError {}

struct PromiseState<T> {
    pending: Signal<bool>,
    /// Sticky: stays true once any value has resolved, even across a later
    /// rejection. `rejected` reflects only the latest settlement.
    resolved: Signal<bool>,
    rejected: Signal<bool>,
    ready: Signal<bool>,
    value: Signal<Option<T>>,
    error: Signal<Option<ReactiveError>>,
    version: Signal<u64>,
    wakers: RefCell<Vec<Waker>>,
    scope: Scope,
}

/// A first-class async value with reactive status flags.
///
/// Each flag group lives in its own signal, so a pending→resolved transition
/// that produces an unchanged value re-notifies status readers without
/// touching value readers. The promise is also a [`Future`].
pub struct ReactivePromise<T> {
    state: Rc<PromiseState<T>>,
}

impl<T> Clone for ReactivePromise<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + PartialEq + 'static> ReactivePromise<T> {
    /// A promise in the pending state.
    pub fn new(scope: &Scope) -> Self {
        Self {
            state: Rc::new(PromiseState {
                pending: Signal::new(scope, true),
                resolved: Signal::new(scope, false),
                rejected: Signal::new(scope, false),
                ready: Signal::new(scope, false),
                value: Signal::new(scope, None),
                error: Signal::new(scope, None),
                version: Signal::new(scope, 0),
                wakers: RefCell::new(Vec::new()),
                scope: scope.clone(),
            }),
        }
    }

    /// A promise born resolved.
    pub fn resolved_with(scope: &Scope, value: T) -> Self {
        let promise = Self::new(scope);
        promise.set_value(value);
        promise
    }

    /// Resolves with `value`. Value readers are only re-notified if the
    /// value actually changed.
    pub fn set_value(&self, value: T) {
        self.state.scope.batch(|| {
            self.state.value.set(Some(value));
            self.state.pending.set(false);
            self.state.resolved.set(true);
            self.state.rejected.set(false);
            self.state.ready.set(true);
            self.bump();
        });
        self.wake();
    }

    /// Rejects with `error`. A previously resolved value is retained.
    pub fn set_error(&self, error: ReactiveError) {
        self.state.scope.batch(|| {
            self.state.error.set(Some(error));
            self.state.pending.set(false);
            self.state.rejected.set(true);
            self.bump();
        });
        self.wake();
    }

    /// Returns to the pending state, keeping the last settlement visible.
    pub fn set_pending(&self) {
        if self.state.pending.get_untracked() {
            return;
        }
        self.state.scope.batch(|| {
            self.state.pending.set(true);
            self.bump();
        });
    }

    fn bump(&self) {
        self.state
            .version
            .set(self.state.version.get_untracked() + 1);
    }

    fn wake(&self) {
        for waker in self.state.wakers.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    // -- reactive reads -----------------------------------------------------

    pub fn is_pending(&self) -> bool {
        self.state.pending.get()
    }

    /// True once a value has ever resolved (sticky).
    pub fn is_resolved(&self) -> bool {
        self.state.resolved.get()
    }

    /// True if the latest settlement was a rejection.
    pub fn is_rejected(&self) -> bool {
        self.state.rejected.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state.ready.get()
    }

    pub fn is_settled(&self) -> bool {
        !self.state.pending.get() && (self.state.resolved.get() || self.state.rejected.get())
    }

    pub fn value(&self) -> Option<T> {
        self.state.value.get()
    }

    pub fn error(&self) -> Option<ReactiveError> {
        self.state.error.get()
    }

    /// Coarse version signal for integrations that cannot subscribe at
    /// field granularity; bumped on any status, value, or error change.
    pub fn version_signal(&self) -> Signal<u64> {
        self.state.version.clone()
    }

    /// Resolves when the promise settles; `Err` on rejection.
    pub fn wait(&self) -> PromiseWait<T> {
        PromiseWait {
            promise: self.clone(),
        }
    }
}

impl<T: Clone + PartialEq + 'static> Future for ReactivePromise<T> {
    type Output = Result<T, ReactiveError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_settled(&self.state, cx)
    }
}

/// Future returned by [`ReactivePromise::wait`].
pub struct PromiseWait<T> {
    promise: ReactivePromise<T>,
}

impl<T: Clone + PartialEq + 'static> Future for PromiseWait<T> {
    type Output = Result<T, ReactiveError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_settled(&self.promise.state, cx)
    }
}

fn poll_settled<T: Clone + PartialEq + 'static>(
    state: &Rc<PromiseState<T>>,
    cx: &mut Context<'_>,
) -> Poll<Result<T, ReactiveError>> {
    untracked(|| {
        if !state.pending.get_untracked() {
            if state.rejected.get_untracked() {
                if let Some(error) = state.error.get_untracked() {
                    return Poll::Ready(Err(error));
                }
            }
            if let Some(value) = state.value.get_untracked() {
                return Poll::Ready(Ok(value));
            }
        }
        state.wakers.borrow_mut().push(cx.waker().clone());
        Poll::Pending
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computed::Computed;
    use std::cell::Cell as StdCell;

    #[test]
    fn lifecycle_flags() {
        let scope = Scope::new();
        let promise: ReactivePromise<i32> = ReactivePromise::new(&scope);
        assert!(promise.is_pending());
        assert!(!promise.is_resolved());

        promise.set_value(5);
        assert!(!promise.is_pending());
        assert!(promise.is_resolved());
        assert!(promise.is_ready());
        assert_eq!(promise.value(), Some(5));

        promise.set_error(ReactiveError::msg("boom"));
        assert!(promise.is_rejected());
        // Prior success stays visible.
        assert!(promise.is_resolved());
        assert_eq!(promise.value(), Some(5));
        assert_eq!(promise.error().map(|e| e.to_string()), Some("boom".into()));

        promise.set_value(6);
        assert!(!promise.is_rejected());
    }

    #[test]
    fn value_readers_skip_same_value_resettles() {
        let scope = Scope::new();
        let promise: ReactivePromise<i32> = ReactivePromise::new(&scope);
        promise.set_value(5);

        let value_reads = Rc::new(StdCell::new(0));
        let value_computed = Computed::new(&scope, {
            let (promise, value_reads) = (promise.clone(), value_reads.clone());
            move || {
                value_reads.set(value_reads.get() + 1);
                promise.value()
            }
        });
        assert_eq!(value_computed.get(), Some(5));
        assert_eq!(value_reads.get(), 1);

        // pending → resolved with the same value: status churn only.
        promise.set_pending();
        promise.set_value(5);
        assert_eq!(value_computed.get(), Some(5));
        assert_eq!(value_reads.get(), 1);
    }

    #[test]
    fn version_bumps_on_every_transition() {
        let scope = Scope::new();
        let promise: ReactivePromise<i32> = ReactivePromise::new(&scope);
        let v0 = promise.version_signal().get_untracked();
        promise.set_value(1);
        let v1 = promise.version_signal().get_untracked();
        assert!(v1 > v0);
        promise.set_pending();
        promise.set_value(1);
        assert!(promise.version_signal().get_untracked() > v1);
    }

    #[tokio::test]
    async fn wait_resolves() {
        let scope = Scope::new();
        let promise: ReactivePromise<i32> = ReactivePromise::new(&scope);
        let waiter = promise.wait();
        promise.set_value(9);
        assert_eq!(waiter.await.unwrap(), 9);
    }

    #[tokio::test]
    async fn wait_rejects() {
        let scope = Scope::new();
        let promise: ReactivePromise<i32> = ReactivePromise::new(&scope);
        promise.set_error(ReactiveError::msg("nope"));
        let result = promise.wait().await;
        assert_eq!(result.unwrap_err().to_string(), "nope");
    }
}
