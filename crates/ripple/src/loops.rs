#![forbid(unsafe_code)]

//! Forward declarations for feedback cycles.
//!
//! A [`StreamLoop`] (or [`CellLoop`]) stands in for a stream that has not
//! been defined yet, so a network can refer to its own output while being
//! built. Binding the real source with `loop_` must happen inside the same
//! transaction that created the loop — the closure is atomic, so no
//! propagation can observe the half-built cycle.
//!
//! Binding links the actual stream's node to the loop's node; rank
//! maintenance treats the edge like any other, with the visited set
//! terminating the traversal around the cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cell::Cell;
use crate::stream::{HandlerCell, Stream};
use crate::transaction::Transaction;

/// A forward-declared stream.
pub struct StreamLoop<A> {
    stream: Stream<A>,
    bound: Arc<AtomicBool>,
}

impl<A: Clone + Send + 'static> StreamLoop<A> {
    /// # Panics
    ///
    /// Panics when called outside a transaction: the declaration and its
    /// binding must share one instant.
    #[must_use]
    pub fn new() -> Self {
        assert!(
            Transaction::is_active(),
            "StreamLoop/CellLoop must be created inside a transaction"
        );
        Self {
            stream: Stream::never(),
            bound: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The loop's stream, usable before the loop is bound.
    #[must_use]
    pub fn stream(&self) -> Stream<A> {
        self.stream.clone()
    }

    /// Bind the loop to the stream it stands for, closing the cycle.
    ///
    /// # Panics
    ///
    /// Panics on a second binding.
    pub fn loop_(&self, actual: &Stream<A>) {
        Transaction::apply(|trans| {
            assert!(
                !self.bound.swap(true, Ordering::SeqCst),
                "StreamLoop bound more than once"
            );
            let forward = self.stream.downgrade();
            let handler = HandlerCell::new(move |trans2: &Transaction, a: &A| {
                if let Some(stream) = forward.upgrade() {
                    stream.send(trans2, a.clone());
                }
            });
            // The subscription holds only the handler: a strong reference
            // to `actual` here would close a reference cycle through the
            // loop and pin the whole subgraph. Whoever consumes the loop's
            // output keeps `actual` alive instead.
            let l = actual.listen_raw(self.stream.node(), trans, handler, false, false);
            self.stream.clone().add_cleanup_internal(l);
        });
    }
}

/// A forward-declared cell.
pub struct CellLoop<A> {
    stream_loop: StreamLoop<A>,
    cell: Cell<A>,
}

impl<A: Clone + Send + 'static> CellLoop<A> {
    /// # Panics
    ///
    /// Panics when called outside a transaction: the declaration and its
    /// binding must share one instant.
    #[must_use]
    pub fn new() -> Self {
        assert!(
            Transaction::is_active(),
            "StreamLoop/CellLoop must be created inside a transaction"
        );
        Transaction::apply(|trans| {
            let stream_loop = StreamLoop::new();
            let cell = Cell::hold_internal(stream_loop.stream(), trans, None, None);
            Self { stream_loop, cell }
        })
    }

    /// The loop's cell. Sampling it before `loop_` is a misuse and
    /// panics.
    #[must_use]
    pub fn cell(&self) -> Cell<A> {
        self.cell.clone()
    }

    /// Bind the loop to the cell it stands for. The loop cell adopts the
    /// actual cell's update stream and its (lazily sampled) initial value.
    ///
    /// # Panics
    ///
    /// Panics on a second binding.
    pub fn loop_(&self, actual: &Cell<A>) {
        Transaction::apply(|trans| {
            self.stream_loop.loop_(&actual.updates());
            self.cell.set_lazy_init(actual.sample_lazy_internal(trans));
        });
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::StreamSink;
    use crate::sync::lock;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Mutex;

    #[test]
    fn stream_loop_forwards_once_bound() {
        let s: StreamSink<i32> = StreamSink::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let (_out, _l) = Transaction::run(|| {
            let lp: StreamLoop<i32> = StreamLoop::new();
            let doubled = lp.stream().map(|x| x * 2);
            let l = doubled.listen(move |a| lock(&seen2).push(*a));
            lp.loop_(&s.stream());
            (doubled, l)
        });
        s.send(3);
        s.send(4);
        assert_eq!(*lock(&seen), vec![6, 8]);
    }

    #[test]
    fn cell_loop_closes_a_feedback_cycle() {
        // Running total built by referring to the total before it exists.
        let s: StreamSink<i32> = StreamSink::new();
        let total = Transaction::run(|| {
            let lp: CellLoop<i32> = CellLoop::new();
            let updated = s.stream().snapshot(&lp.cell(), |a, t| a + t);
            let total = updated.hold(0);
            lp.loop_(&total);
            total
        });
        s.send(5);
        s.send(6);
        assert_eq!(total.sample(), 11);
    }

    #[test]
    fn loop_outside_transaction_panics() {
        let result = catch_unwind(|| {
            let _lp: StreamLoop<i32> = StreamLoop::new();
        });
        assert!(result.is_err());
    }

    #[test]
    fn second_binding_panics() {
        let s: StreamSink<i32> = StreamSink::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            Transaction::run(|| {
                let lp: StreamLoop<i32> = StreamLoop::new();
                lp.loop_(&s.stream());
                lp.loop_(&s.stream());
            });
        }));
        assert!(result.is_err());
    }

    #[test]
    fn unbound_cell_loop_sample_panics() {
        let result = catch_unwind(|| {
            Transaction::run(|| {
                let lp: CellLoop<i32> = CellLoop::new();
                lp.cell().sample()
            })
        });
        assert!(result.is_err());
    }
}
