#![forbid(unsafe_code)]

//! Event streams: the discrete half of the dataflow network.
//!
//! A [`Stream`] fires zero or more values per transaction. Firings recorded
//! earlier in the current transaction replay to newly attached listeners,
//! so within one instant there is no order dependency between `send` and
//! `listen`. Combinators allocate an output stream with its own node,
//! listen to their input(s), and keep the subscription alive through the
//! output's cleanup list.
//!
//! # Invariants
//!
//! 1. The firings buffer is cleared by a last-phase action registered on
//!    the first firing of each transaction.
//! 2. A handler reaches the graph only as a weak reference; the returned
//!    [`Listener`] owns the strong one.
//! 3. Streams produced by `coalesce` (and everything built on it: merges
//!    with a combiner, `hold`'s internal stream) emit at most once per
//!    transaction.
//! 4. Combinator handlers capture their output weakly: dropping every
//!    handle to a derived stream detaches it from the graph.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use crate::cell::Cell;
use crate::lazy::Lazy;
use crate::listener::Listener;
use crate::loops::StreamLoop;
use crate::node::Node;
use crate::sync::lock;
use crate::transaction::{CallbackGuard, Transaction};

// ─── Handlers ────────────────────────────────────────────────────────────────

/// A typed callback slot, erased to `dyn Any` at the graph layer and
/// downcast back on dispatch.
pub(crate) struct HandlerCell<A> {
    f: Mutex<Box<dyn FnMut(&Transaction, &A) + Send>>,
}

impl<A: 'static> HandlerCell<A> {
    pub(crate) fn new(f: impl FnMut(&Transaction, &A) + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            f: Mutex::new(Box::new(f)),
        })
    }

    pub(crate) fn run(&self, trans: &Transaction, a: &A) {
        let mut f = lock(&self.f);
        (*f)(trans, a);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

// ─── Stream ──────────────────────────────────────────────────────────────────

pub(crate) struct StreamData<A> {
    firings: Vec<A>,
    finalizers: Vec<Listener>,
    /// Extra state the stream must keep alive (e.g. `once`'s listener
    /// slot, a switch's current inner subscription).
    keep_alive: Vec<Arc<dyn Any + Send + Sync>>,
}

/// A stream of discrete events. Cheap to clone: clones share the same
/// node and firing state.
pub struct Stream<A> {
    node: Node,
    data: Arc<Mutex<StreamData<A>>>,
}

impl<A> Clone for Stream<A> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            data: Arc::clone(&self.data),
        }
    }
}

impl<A> std::fmt::Debug for Stream<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("node", &self.node.id())
            .field("rank", &self.node.rank())
            .finish()
    }
}

pub(crate) struct WeakStream<A> {
    node: Node,
    data: Weak<Mutex<StreamData<A>>>,
}

impl<A> Clone for WeakStream<A> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            data: Weak::clone(&self.data),
        }
    }
}

impl<A> WeakStream<A> {
    pub(crate) fn upgrade(&self) -> Option<Stream<A>> {
        self.data.upgrade().map(|data| Stream {
            node: self.node.clone(),
            data,
        })
    }
}

impl<A: Clone + Send + 'static> Stream<A> {
    pub(crate) fn new() -> Self {
        Self {
            node: Node::new(0),
            data: Arc::new(Mutex::new(StreamData {
                firings: Vec::new(),
                finalizers: Vec::new(),
                keep_alive: Vec::new(),
            })),
        }
    }

    /// A stream that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self::new()
    }

    pub(crate) fn node(&self) -> &Node {
        &self.node
    }

    pub(crate) fn downgrade(&self) -> WeakStream<A> {
        WeakStream {
            node: self.node.clone(),
            data: Arc::downgrade(&self.data),
        }
    }

    // ─── Primitive send/listen ───────────────────────────────────────────

    /// Record a firing and dispatch it to every live listener at its
    /// node's rank. Dead (lapsed-weak) targets are skipped silently.
    pub(crate) fn send(&self, trans: &Transaction, a: A) {
        let first_firing = {
            let mut data = lock(&self.data);
            let first = data.firings.is_empty();
            data.firings.push(a.clone());
            first
        };
        if first_firing {
            let weak_data = Arc::downgrade(&self.data);
            trans.last(move || {
                if let Some(data) = weak_data.upgrade() {
                    lock(&data).firings.clear();
                }
            });
        }
        for target in self.node.targets() {
            let Some(weak_action) = target.action else { continue };
            let Some(erased) = weak_action.upgrade() else { continue };
            let Ok(handler) = erased.downcast::<HandlerCell<A>>() else { continue };
            let a = a.clone();
            trans.prioritized(&target.node, move |trans2| {
                let _guard = CallbackGuard::new();
                handler.run(trans2, &a);
            });
        }
    }

    /// Attach `handler` listening at `target`'s rank.
    ///
    /// Unless suppressed, values already sent in this transaction replay
    /// to the handler at the target's rank; a panic in a replayed call is
    /// caught and logged so replay of the remaining values continues.
    pub(crate) fn listen_raw(
        &self,
        target: &Node,
        trans: &Transaction,
        handler: Arc<HandlerCell<A>>,
        suppress_earlier_firings: bool,
        hold_stream: bool,
    ) -> Listener {
        let erased: Arc<dyn Any + Send + Sync> = handler.clone();
        let (rank_changed, edge) = self.node.link_to(Some(Arc::downgrade(&erased)), target);
        if rank_changed {
            trans.set_needs_regenerating();
        }
        let firings: Vec<A> = lock(&self.data).firings.clone();
        if !suppress_earlier_firings && !firings.is_empty() {
            let replay = Arc::clone(&handler);
            let node_id = self.node.id();
            trans.prioritized(target, move |trans2| {
                for a in &firings {
                    let _guard = CallbackGuard::new();
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| replay.run(trans2, a))) {
                        tracing::error!(
                            node_id,
                            panic = panic_message(panic.as_ref()),
                            "listener panicked while replaying earlier firings; \
                             continuing propagation"
                        );
                    }
                }
            });
        }
        let mut strongs: Vec<Arc<dyn Any + Send + Sync>> = vec![erased];
        if hold_stream {
            let data: Arc<dyn Any + Send + Sync> = self.data.clone();
            strongs.push(data);
        }
        Listener::new(self.node.clone(), edge, strongs)
    }

    /// Combinator-side listen: wraps `f` and runs inside the current (or a
    /// fresh) transaction.
    pub(crate) fn listen_internal(
        &self,
        target: Node,
        f: impl FnMut(&Transaction, &A) + Send + 'static,
    ) -> Listener {
        Transaction::apply(|trans| self.listen_raw(&target, trans, HandlerCell::new(f), false, true))
    }

    /// Listen for firings on this stream. The returned [`Listener`] keeps
    /// the subscription (and this stream) alive; drop or
    /// [`unlisten`](Listener::unlisten) it to detach.
    ///
    /// The handler runs after all internal propagation for the instant and
    /// must not call a sink's `send`.
    pub fn listen(&self, mut action: impl FnMut(&A) + Send + 'static) -> Listener {
        Transaction::apply(|trans| {
            self.listen_raw(
                &Node::null(),
                trans,
                HandlerCell::new(move |_trans, a| action(a)),
                false,
                true,
            )
        })
    }

    /// [`listen`](Stream::listen) without keeping this stream alive: the
    /// subscription lapses when the stream's last other handle drops.
    pub fn listen_weak(&self, mut action: impl FnMut(&A) + Send + 'static) -> Listener {
        Transaction::apply(|trans| {
            self.listen_raw(
                &Node::null(),
                trans,
                HandlerCell::new(move |_trans, a| action(a)),
                false,
                false,
            )
        })
    }

    /// Attach an extra cleanup to run when this stream is dropped.
    pub fn add_cleanup(&self, cleanup: Listener) -> Stream<A> {
        Transaction::run(|| {
            lock(&self.data).finalizers.push(cleanup);
            self.clone()
        })
    }

    pub(crate) fn add_cleanup_internal(self, cleanup: Listener) -> Stream<A> {
        lock(&self.data).finalizers.push(cleanup);
        self
    }

    pub(crate) fn keep_alive_internal(self, item: Arc<dyn Any + Send + Sync>) -> Stream<A> {
        lock(&self.data).keep_alive.push(item);
        self
    }

    // ─── Combinators ─────────────────────────────────────────────────────

    /// Transform every firing with `f`.
    pub fn map<B, F>(&self, f: F) -> Stream<B>
    where
        B: Clone + Send + 'static,
        F: Fn(&A) -> B + Send + 'static,
    {
        let out: Stream<B> = Stream::new();
        let weak_out = out.downgrade();
        let l = self.listen_internal(out.node.clone(), move |trans, a| {
            if let Some(out) = weak_out.upgrade() {
                out.send(trans, f(a));
            }
        });
        out.add_cleanup_internal(l)
    }

    /// Two listens into a common output node. Simultaneous events appear
    /// as two separate firings (left input first, in rank order); the
    /// intermediate left node keeps ranks correct for downstreams fed from
    /// either input.
    pub(crate) fn merge_raw(&self, other: &Stream<A>) -> Stream<A> {
        let out: Stream<A> = Stream::new();
        let left = Node::new(0);
        let (_changed, left_edge) = left.link_to(None, out.node());
        let weak_out = out.downgrade();
        let handler = move |trans: &Transaction, a: &A| {
            if let Some(out) = weak_out.upgrade() {
                out.send(trans, a.clone());
            }
        };
        let l1 = self.listen_internal(left.clone(), handler.clone());
        let l2 = other.listen_internal(out.node.clone(), handler);
        out.add_cleanup_internal(l1)
            .add_cleanup_internal(l2)
            .add_cleanup_internal(Listener::new(left, left_edge, Vec::new()))
    }

    /// Merge with `other`; simultaneous events coalesce through `f`, this
    /// stream's value on the left.
    pub fn merge_with(&self, other: &Stream<A>, f: impl Fn(&A, &A) -> A + Send + 'static) -> Stream<A> {
        Transaction::apply(|trans| self.merge_raw(other).coalesce(trans, f))
    }

    /// Merge with `other`. For simultaneous events `other` takes
    /// precedence: `a.merge(&b)` is `a.merge_with(&b, |_l, r| r.clone())`.
    pub fn merge(&self, other: &Stream<A>) -> Stream<A> {
        self.merge_with(other, |_l, r| r.clone())
    }

    /// Merge a collection of streams as a balanced binary tree, coalescing
    /// simultaneous events through `f`.
    pub fn merge_all(streams: &[Stream<A>], f: impl Fn(&A, &A) -> A + Clone + Send + 'static) -> Stream<A> {
        fn balanced<A, F>(streams: &[Stream<A>], f: &F) -> Stream<A>
        where
            A: Clone + Send + 'static,
            F: Fn(&A, &A) -> A + Clone + Send + 'static,
        {
            match streams {
                [] => Stream::never(),
                [only] => only.clone(),
                [l, r] => l.merge_with(r, f.clone()),
                _ => {
                    let mid = streams.len() / 2;
                    balanced(&streams[..mid], f)
                        .merge_with(&balanced(&streams[mid..], f), f.clone())
                }
            }
        }
        balanced(streams, &f)
    }

    /// Fold multiple firings within one transaction into a single emission
    /// using `f(first, second)`, left to right.
    pub(crate) fn coalesce(&self, trans: &Transaction, f: impl Fn(&A, &A) -> A + Send + 'static) -> Stream<A> {
        let out: Stream<A> = Stream::new();
        let out_node = out.node.clone();
        let weak_out = out.downgrade();
        let pending: Arc<Mutex<Option<A>>> = Arc::new(Mutex::new(None));
        let handler = HandlerCell::new(move |trans1: &Transaction, a: &A| {
            let mut acc = lock(&pending);
            if let Some(prev) = acc.take() {
                *acc = Some(f(&prev, a));
            } else {
                *acc = Some(a.clone());
                drop(acc);
                // First firing this transaction: schedule the single
                // emission. Accumulating entries at the same rank precede
                // it in sequence order.
                let pending = Arc::clone(&pending);
                let weak_out = weak_out.clone();
                trans1.prioritized(&out_node, move |trans2| {
                    let value = lock(&pending).take();
                    if let (Some(out), Some(value)) = (weak_out.upgrade(), value) {
                        out.send(trans2, value);
                    }
                });
            }
        });
        let l = self.listen_raw(&out.node, trans, handler, false, true);
        out.add_cleanup_internal(l)
    }

    /// Discard all but the last firing in each transaction.
    pub(crate) fn last_firing_only(&self, trans: &Transaction) -> Stream<A> {
        self.coalesce(trans, |_first, second| second.clone())
    }

    /// Only let through firings for which `predicate` returns true.
    pub fn filter(&self, predicate: impl Fn(&A) -> bool + Send + 'static) -> Stream<A> {
        let out: Stream<A> = Stream::new();
        let weak_out = out.downgrade();
        let l = self.listen_internal(out.node.clone(), move |trans, a| {
            if predicate(a) {
                if let Some(out) = weak_out.upgrade() {
                    out.send(trans, a.clone());
                }
            }
        });
        out.add_cleanup_internal(l)
    }

    /// Only let firings through while `c` is true, sampling `c` at its
    /// pre-update value like any snapshot.
    pub fn gate(&self, c: &Cell<bool>) -> Stream<A> {
        self.snapshot(c, |a, pass| if *pass { Some(a.clone()) } else { None })
            .filter_option()
    }

    /// On every firing, combine the event with the cell's value through
    /// `f` and emit the result.
    ///
    /// The cell is observed at its value from *before* any update in the
    /// current transaction: updates held this instant become visible to
    /// snapshots only from the next instant on.
    pub fn snapshot<B, C, F>(&self, c: &Cell<B>, f: F) -> Stream<C>
    where
        B: Clone + Send + 'static,
        C: Clone + Send + 'static,
        F: Fn(&A, &B) -> C + Send + 'static,
    {
        let out: Stream<C> = Stream::new();
        let weak_out = out.downgrade();
        let cell = c.clone();
        let l = self.listen_internal(out.node.clone(), move |trans, a| {
            if let Some(out) = weak_out.upgrade() {
                out.send(trans, f(a, &cell.sample_no_trans()));
            }
        });
        out.add_cleanup_internal(l)
    }

    /// [`snapshot`](Stream::snapshot) that captures the cell's value alone,
    /// discarding the event's own value.
    pub fn snapshot_cell<B>(&self, c: &Cell<B>) -> Stream<B>
    where
        B: Clone + Send + 'static,
    {
        self.snapshot(c, |_a, b| b.clone())
    }

    /// Hold the last firing of each transaction as the value of a new
    /// cell, starting from `init`. The cell's observable value changes at
    /// the transaction boundary.
    pub fn hold(&self, init: A) -> Cell<A> {
        Transaction::apply(|trans| Cell::hold_internal(self.last_firing_only(trans), trans, Some(init), None))
    }

    /// [`hold`](Stream::hold) with an initial value that is not demanded
    /// until the cell is first observed.
    pub fn hold_lazy(&self, init: Lazy<A>) -> Cell<A> {
        Transaction::apply(|trans| self.hold_lazy_internal(trans, init))
    }

    pub(crate) fn hold_lazy_internal(&self, trans: &Transaction, init: Lazy<A>) -> Cell<A> {
        Cell::hold_internal(self.last_firing_only(trans), trans, None, Some(init))
    }

    /// Re-emit every firing in its own fresh transaction, guaranteed to
    /// run after the current drain and before the next externally
    /// initiated transaction. Simultaneous firings stay distinct: each
    /// gets its own instant, in firing order.
    pub fn defer(&self) -> Stream<A> {
        let out: Stream<A> = Stream::new();
        let weak_out = out.downgrade();
        let l = self.listen_internal(out.node.clone(), move |trans, a| {
            let weak_out = weak_out.clone();
            let a = a.clone();
            trans.post_first(move || {
                Transaction::apply(|child| {
                    if let Some(out) = weak_out.upgrade() {
                        out.send(child, a);
                    }
                });
            });
        });
        out.add_cleanup_internal(l)
    }

    /// Pass through only the first firing, then detach from the input.
    pub fn once(&self) -> Stream<A> {
        let out: Stream<A> = Stream::new();
        let weak_out = out.downgrade();
        let slot: Arc<Mutex<Option<Listener>>> = Arc::new(Mutex::new(None));
        let weak_slot = Arc::downgrade(&slot);
        let l = self.listen_internal(out.node.clone(), move |trans, a| {
            let Some(slot) = weak_slot.upgrade() else { return };
            let taken = lock(&slot).take();
            if let Some(listener) = taken {
                if let Some(out) = weak_out.upgrade() {
                    out.send(trans, a.clone());
                }
                listener.unlisten();
            }
        });
        *lock(&slot) = Some(l);
        out.keep_alive_internal(slot)
    }

    /// Accumulate state over this stream's events, outputting the new
    /// state each time. The state cell updates at transaction boundaries.
    pub fn accum<S>(&self, init_state: S, f: impl Fn(&A, &S) -> S + Send + 'static) -> Cell<S>
    where
        S: Clone + Send + 'static,
    {
        self.accum_lazy(Lazy::of_value(init_state), f)
    }

    /// [`accum`](Stream::accum) with a lazily supplied initial state.
    pub fn accum_lazy<S>(&self, init_state: Lazy<S>, f: impl Fn(&A, &S) -> S + Send + 'static) -> Cell<S>
    where
        S: Clone + Send + 'static,
    {
        // The whole loop closure must be atomic in one transaction.
        Transaction::run(|| {
            let state_loop: StreamLoop<S> = StreamLoop::new();
            let state = state_loop.stream().hold_lazy(init_state.clone());
            let new_state = self.snapshot(&state, f);
            state_loop.loop_(&new_state);
            new_state.hold_lazy(init_state)
        })
    }

    /// Transform events through a state machine: `f` maps (event, state)
    /// to (output, new state).
    pub fn collect<B, S>(&self, init_state: S, f: impl Fn(&A, &S) -> (B, S) + Send + 'static) -> Stream<B>
    where
        B: Clone + Send + 'static,
        S: Clone + Send + 'static,
    {
        self.collect_lazy(Lazy::of_value(init_state), f)
    }

    /// [`collect`](Stream::collect) with a lazily supplied initial state.
    pub fn collect_lazy<B, S>(
        &self,
        init_state: Lazy<S>,
        f: impl Fn(&A, &S) -> (B, S) + Send + 'static,
    ) -> Stream<B>
    where
        B: Clone + Send + 'static,
        S: Clone + Send + 'static,
    {
        Transaction::run(|| {
            let state_loop: StreamLoop<S> = StreamLoop::new();
            let state = state_loop.stream().hold_lazy(init_state);
            let both = self.snapshot(&state, f);
            let output = both.map(|pair| pair.0.clone());
            let new_state = both.map(|pair| pair.1.clone());
            state_loop.loop_(&new_state);
            // The loop end holds new_state only weakly; the output carries
            // it so the state keeps flowing as long as anyone listens.
            output.keep_alive_internal(Arc::new(new_state))
        })
    }
}

impl<A: Clone + Send + 'static> Stream<Option<A>> {
    /// Unwrap present values and discard `None` firings.
    pub fn filter_option(&self) -> Stream<A> {
        let out: Stream<A> = Stream::new();
        let weak_out = out.downgrade();
        let l = self.listen_internal(out.node.clone(), move |trans, a: &Option<A>| {
            if let Some(value) = a {
                if let Some(out) = weak_out.upgrade() {
                    out.send(trans, value.clone());
                }
            }
        });
        out.add_cleanup_internal(l)
    }
}

impl<A: Clone + Send + 'static> Stream<Vec<A>> {
    /// Re-emit each element of every firing in its own fresh transaction,
    /// in element order, all before the next externally initiated
    /// transaction. One closure is posted per collection firing, so
    /// elements of unrelated simultaneous firings never share an instant.
    pub fn split(&self) -> Stream<A> {
        let out: Stream<A> = Stream::new();
        let weak_out = out.downgrade();
        let l = self.listen_internal(out.node.clone(), move |trans, items: &Vec<A>| {
            let weak_out = weak_out.clone();
            let items = items.clone();
            trans.post_first(move || {
                for a in items {
                    let weak_out = weak_out.clone();
                    Transaction::apply(move |child| {
                        if let Some(out) = weak_out.upgrade() {
                            out.send(child, a);
                        }
                    });
                }
            });
        });
        out.add_cleanup_internal(l)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
