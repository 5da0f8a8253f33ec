#![forbid(unsafe_code)]

//! Poison-tolerant lock acquisition.
//!
//! A panicking user callback must not brick the propagation engine: the
//! transaction close path still has to drain, commit cell values, and run
//! post-phase actions after an unwind. Every internal mutex is therefore
//! acquired through [`lock`], which recovers the guard from a poisoned
//! mutex instead of propagating the poison.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
