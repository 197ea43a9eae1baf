use std::hash::Hash;

use crate::computed::ReactiveFn;
use crate::scope::{OwnerId, Scope};

/// A reactive function bound to an owner object.
///
/// The owner's scope is resolved through the root scope's owner→parent map
/// at first call and cached; all methods bound to one owner subtree share
/// that scope's memo registry.
pub struct CachedMethod<Args, T> {
    root: Scope,
    owner: OwnerId,
    func: ReactiveFn<Args, T>,
    resolved: std::cell::RefCell<Option<Scope>>,
}

impl<Args, T> CachedMethod<Args, T>
where
    Args: Hash + Clone + 'static,
    T: Clone + 'static,
{
    pub fn bind(root: &Scope, owner: OwnerId, func: ReactiveFn<Args, T>) -> Self {
        Self {
            root: root.clone(),
            owner,
            func,
            resolved: std::cell::RefCell::new(None),
        }
    }

    /// Invokes the method; memoized per argument value in the owner's scope.
    pub fn call(&self, args: Args) -> T {
        let scope = self.scope();
        self.func.call(&scope, args)
    }

    fn scope(&self) -> Scope {
        if let Some(scope) = self.resolved.borrow().clone() {
            return scope;
        }
        let scope = self
            .root
            .owner_scope(self.owner)
            .unwrap_or_else(|| self.root.clone());
        *self.resolved.borrow_mut() = Some(scope.clone());
        scope
    }
}
