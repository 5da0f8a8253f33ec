#![forbid(unsafe_code)]

//! Deferred values.
//!
//! [`Lazy`] is a shared thunk used wherever the engine needs a value that
//! must not be demanded yet: lazily-held cells, `sample_lazy`, loop initial
//! values. Evaluation is *not* memoized — `get` re-runs the thunk, exactly
//! as the call sites require (a lazy sample resolves against state frozen
//! at the sampling transaction's last phase).

use std::sync::{Arc, Mutex};

use crate::sync::lock;

/// A shared deferred value.
pub struct Lazy<A> {
    thunk: Arc<Mutex<Box<dyn FnMut() -> A + Send>>>,
}

impl<A> Clone for Lazy<A> {
    fn clone(&self) -> Self {
        Self {
            thunk: Arc::clone(&self.thunk),
        }
    }
}

impl<A: Clone + Send + 'static> Lazy<A> {
    /// Defer to `f`, evaluated on every [`get`](Lazy::get).
    pub fn new(f: impl FnMut() -> A + Send + 'static) -> Self {
        Self {
            thunk: Arc::new(Mutex::new(Box::new(f))),
        }
    }

    /// An already-known value.
    pub fn of_value(value: A) -> Self {
        Self::new(move || value.clone())
    }

    /// Demand the value.
    #[must_use]
    pub fn get(&self) -> A {
        let mut thunk = lock(&self.thunk);
        (*thunk)()
    }

    /// A lazy value that applies `f` to this one when demanded.
    pub fn map<B: Clone + Send + 'static>(
        &self,
        mut f: impl FnMut(A) -> B + Send + 'static,
    ) -> Lazy<B> {
        let this = self.clone();
        Lazy::new(move || f(this.get()))
    }
}
