#![forbid(unsafe_code)]

//! Transactional functional reactive programming.
//!
//! ripple models a program as a dataflow network of two primitives:
//!
//! - [`Stream`]: discrete events, fired by sinks and reshaped by
//!   combinators (`map`, `merge`, `filter`, `snapshot`, ...).
//! - [`Cell`]: a continuously-valued view, built by holding a stream's
//!   firings and read coherently with `sample`.
//!
//! Everything that happens in response to one external push happens in a
//! single logical instant — a [`Transaction`]. The engine drains work in
//! dependency-rank order, so no listener ever observes a half-propagated
//! state, and cell updates become visible only at the transaction
//! boundary. Feedback cycles are closed with [`StreamLoop`]/[`CellLoop`]
//! forward declarations inside the transaction that creates them.
//!
//! # Example
//!
//! ```
//! use ripple::StreamSink;
//!
//! let sink: StreamSink<i64> = StreamSink::new();
//! let total = sink.stream().accum(0, |a, state| a + state);
//!
//! sink.send(3);
//! sink.send(4);
//! sink.send(5);
//! assert_eq!(total.sample(), 12);
//! ```

pub mod cell;
pub mod lazy;
pub mod listener;
pub mod loops;
pub mod sink;
pub mod stream;
pub mod transaction;

mod node;
mod sync;

pub use cell::Cell;
pub use lazy::Lazy;
pub use listener::Listener;
pub use loops::{CellLoop, StreamLoop};
pub use sink::{CellSink, StreamSink};
pub use stream::Stream;
pub use transaction::Transaction;
