#![forbid(unsafe_code)]

//! Sinks: the I/O edge of the network.
//!
//! A sink is the only way external code pushes events in. `send` opens (or
//! joins) a transaction, so consecutive sends are separate instants unless
//! wrapped in [`Transaction::run`]. Sends are refused inside listener
//! callbacks — listeners are for getting data *out*; building new
//! primitives on top of them is not supported.

use crate::cell::Cell;
use crate::stream::Stream;
use crate::transaction::Transaction;

/// An externally writable stream.
pub struct StreamSink<A> {
    stream: Stream<A>,
}

impl<A: Clone + Send + 'static> StreamSink<A> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stream: Stream::never(),
        }
    }

    /// The stream of values pushed into this sink.
    #[must_use]
    pub fn stream(&self) -> Stream<A> {
        self.stream.clone()
    }

    /// Push a value. Within one [`Transaction::run`] multiple sends are
    /// simultaneous; each recorded firing reaches every listener.
    ///
    /// # Panics
    ///
    /// Panics when called from inside a listener callback.
    pub fn send(&self, a: A) {
        Transaction::apply(|trans| {
            assert!(
                !Transaction::in_callback(),
                "StreamSink::send may not be called from inside a listener callback"
            );
            self.stream.send(trans, a);
        });
    }
}

impl<A: Clone + Send + 'static> Default for StreamSink<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for StreamSink<A> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

/// An externally writable cell.
pub struct CellSink<A> {
    sink: StreamSink<A>,
    cell: Cell<A>,
}

impl<A: Clone + Send + 'static> CellSink<A> {
    #[must_use]
    pub fn new(init: A) -> Self {
        let sink = StreamSink::new();
        let cell = sink.stream().hold(init);
        Self { sink, cell }
    }

    /// The cell view of the pushed values.
    #[must_use]
    pub fn cell(&self) -> Cell<A> {
        self.cell.clone()
    }

    /// Push a new value; it becomes the cell's value when the transaction
    /// closes.
    ///
    /// # Panics
    ///
    /// Panics when called from inside a listener callback.
    pub fn send(&self, a: A) {
        self.sink.send(a);
    }
}

impl<A> Clone for CellSink<A> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            cell: self.cell.clone(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::lock;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::{Arc, Mutex};

    #[test]
    fn separate_sends_are_separate_transactions() {
        let s: StreamSink<i32> = StreamSink::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let _l = s.stream().listen(move |a| lock(&seen2).push(*a));
        s.send(1);
        s.send(2);
        assert_eq!(*lock(&seen), vec![1, 2]);
    }

    #[test]
    fn send_inside_listener_panics() {
        let a: StreamSink<i32> = StreamSink::new();
        let b: StreamSink<i32> = StreamSink::new();
        let _l = a.stream().listen(move |v| b.send(*v));
        let result = catch_unwind(AssertUnwindSafe(|| a.send(1)));
        let panic = result.expect_err("send inside a callback must fail");
        let message = panic
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| panic.downcast_ref::<&'static str>().copied())
            .unwrap_or_default();
        assert!(message.contains("inside a listener callback"), "got: {message}");
    }

    #[test]
    fn cell_sink_updates_its_cell() {
        let c: CellSink<i32> = CellSink::new(0);
        assert_eq!(c.cell().sample(), 0);
        c.send(4);
        assert_eq!(c.cell().sample(), 4);
    }
}
