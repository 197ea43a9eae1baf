use std::cell::Cell;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::promise::{ReactiveError, ReactivePromise};
use crate::scope::Scope;

type Runner<Args, T> = Rc<dyn Fn(Args) -> LocalBoxFuture<'static, Result<T, ReactiveError>>>;

struct TaskState<Args, T> {
    scope: Scope,
    promise: ReactivePromise<T>,
    runner: Runner<Args, T>,
    generation: Cell<u64>,
}

/// A runnable reactive promise: each `run` invokes the callback inside the
/// owning scope and adopts the returned future as the current resolution.
/// A newer run supersedes an older in-flight one.
pub struct Task<Args, T> {
    state: Rc<TaskState<Args, T>>,
}

impl<Args, T> Clone for Task<Args, T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<Args: 'static, T: Clone + PartialEq + 'static> Task<Args, T> {
    pub fn new(
        scope: &Scope,
        runner: impl Fn(Args) -> LocalBoxFuture<'static, Result<T, ReactiveError>> + 'static,
    ) -> Self {
        Self {
            state: Rc::new(TaskState {
                scope: scope.clone(),
                promise: ReactivePromise::new(scope),
                runner: Rc::new(runner),
                generation: Cell::new(0),
            }),
        }
    }

    /// The task's promise, for flag and value reads.
    pub fn promise(&self) -> ReactivePromise<T> {
        self.state.promise.clone()
    }

    /// Starts (or restarts) the task with `args`.
    pub fn run(&self, args: Args) -> ReactivePromise<T> {
        self.state.generation.set(self.state.generation.get() + 1);
        let generation = self.state.generation.get();
        self.state.promise.set_pending();
        let future = (self.state.runner)(args);
        let state = self.state.clone();
        self.state.scope.spawn(Box::pin(async move {
            let result = future.await;
            if state.generation.get() != generation {
                return;
            }
            match result {
                Ok(value) => state.promise.set_value(value),
                Err(error) => state.promise.set_error(error),
            }
        }));
        self.state.promise.clone()
    }
}
