#![forbid(unsafe_code)]

//! Cells: time-varying values read coherently within a transaction.
//!
//! A [`Cell`] pairs a stream of updates with current/next value slots.
//! Within a transaction, `sample` observes the *current* value; the first
//! update of the instant registers a last-phase commit that moves the
//! pending value into place as the transaction closes. This is the delay
//! that makes `snapshot` glitch-free: a snapshot never sees state changed
//! by the very instant it fires in.
//!
//! # Invariants
//!
//! 1. `sample` is constant across one transaction, no matter how many
//!    updates the transaction carries.
//! 2. The commit runs in the last phase, after the drain: every listener
//!    of the instant saw the pre-update value.
//! 3. A lazily-held cell defers its initial-value thunk until first
//!    observation, then pins the result.

use std::sync::{Arc, Mutex, Weak};

use crate::lazy::Lazy;
use crate::listener::Listener;
use crate::node::Node;
use crate::stream::{HandlerCell, Stream};
use crate::sync::lock;
use crate::transaction::Transaction;

pub(crate) struct CellData<A> {
    stream: Stream<A>,
    current: Option<A>,
    update: Option<A>,
    lazy_init: Option<Lazy<A>>,
    /// The internal subscription feeding `update`. Held for the cell's
    /// lifetime; dropping the cell unlistens it.
    cleanup: Option<Listener>,
}

/// A continuously-valued view of the network. Cheap to clone: clones share
/// the same value state.
pub struct Cell<A> {
    data: Arc<Mutex<CellData<A>>>,
}

impl<A> Clone for Cell<A> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl<A: std::fmt::Debug> std::fmt::Debug for Cell<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = lock(&self.data);
        f.debug_struct("Cell")
            .field("current", &data.current)
            .field("pending", &data.update)
            .finish()
    }
}

impl<A: Clone + Send + 'static> Cell<A> {
    /// A cell that never changes.
    #[must_use]
    pub fn new(value: A) -> Self {
        Self {
            data: Arc::new(Mutex::new(CellData {
                stream: Stream::never(),
                current: Some(value),
                update: None,
                lazy_init: None,
                cleanup: None,
            })),
        }
    }

    /// Build a cell over an update stream. `stream` is expected to emit at
    /// most once per transaction (callers pass it through
    /// `last_firing_only`); exactly one of `current`/`lazy_init` is set,
    /// except for an unbound cell loop which starts with neither.
    pub(crate) fn hold_internal(
        stream: Stream<A>,
        trans: &Transaction,
        current: Option<A>,
        lazy_init: Option<Lazy<A>>,
    ) -> Self {
        let data = Arc::new(Mutex::new(CellData {
            stream: stream.clone(),
            current,
            update: None,
            lazy_init,
            cleanup: None,
        }));
        let weak = Arc::downgrade(&data);
        let handler = HandlerCell::new(move |trans2: &Transaction, a: &A| {
            let Some(data) = weak.upgrade() else { return };
            let mut d = lock(&data);
            if d.update.is_none() {
                // First update this instant: commit at the last phase.
                let weak_commit = Weak::clone(&weak);
                trans2.last(move || {
                    if let Some(data) = weak_commit.upgrade() {
                        let mut d = lock(&data);
                        d.current = d.update.take();
                        d.lazy_init = None;
                    }
                });
            }
            d.update = Some(a.clone());
        });
        let cleanup = stream.listen_raw(&Node::null(), trans, handler, false, true);
        lock(&data).cleanup = Some(cleanup);
        Cell { data }
    }

    /// Read the value as of the start of the current transaction, opening
    /// a transient transaction when none is active.
    #[must_use]
    pub fn sample(&self) -> A {
        Transaction::apply(|_trans| self.sample_no_trans())
    }

    /// # Panics
    ///
    /// Panics if this is an unbound [`CellLoop`](crate::CellLoop)'s cell.
    pub(crate) fn sample_no_trans(&self) -> A {
        let lazy = {
            let data = lock(&self.data);
            if let Some(value) = &data.current {
                return value.clone();
            }
            data.lazy_init.clone()
        };
        // Thunk runs without the cell lock held: it may sample other cells.
        let Some(lazy) = lazy else {
            panic!("cell loop sampled before it was looped");
        };
        let value = lazy.get();
        let mut data = lock(&self.data);
        if data.current.is_none() {
            data.current = Some(value);
        }
        data.current
            .clone()
            .expect("current value present after lazy initialization")
    }

    /// A lazy handle on this cell's value, resolved against the state the
    /// sampling transaction settles on.
    pub fn sample_lazy(&self) -> Lazy<A> {
        Transaction::apply(|trans| self.sample_lazy_internal(trans))
    }

    pub(crate) fn sample_lazy_internal(&self, trans: &Transaction) -> Lazy<A> {
        struct LazySample<A> {
            value: Option<A>,
            cell: Option<Cell<A>>,
        }
        let slot = Arc::new(Mutex::new(LazySample {
            value: None,
            cell: Some(self.clone()),
        }));
        let slot_commit = Arc::clone(&slot);
        trans.last(move || {
            let mut s = lock(&slot_commit);
            if let Some(cell) = s.cell.take() {
                let pending = lock(&cell.data).update.clone();
                s.value = Some(match pending {
                    Some(value) => value,
                    None => cell.sample_no_trans(),
                });
            }
        });
        Lazy::new(move || {
            let s = lock(&slot);
            if let Some(value) = &s.value {
                return value.clone();
            }
            s.cell
                .as_ref()
                .expect("lazy sample holds the cell until resolved")
                .sample()
        })
    }

    /// The raw update stream: one firing per transaction in which the cell
    /// changes, carrying the new value.
    #[must_use]
    pub fn updates(&self) -> Stream<A> {
        lock(&self.data).stream.clone()
    }

    /// The cell's value as a stream: fires the current value in the
    /// transaction `value` is called in, then every update.
    #[must_use]
    pub fn value(&self) -> Stream<A> {
        Transaction::apply(|trans| self.value_internal(trans))
    }

    pub(crate) fn value_internal(&self, trans: &Transaction) -> Stream<A> {
        // A spark fired at the start of the instant carries the current
        // value through a snapshot; updates override it via
        // last-firing-only.
        let spark: Stream<()> = Stream::never();
        let spark_send = spark.clone();
        trans.prioritized(spark.node(), move |trans2| spark_send.send(trans2, ()));
        let initial = spark.snapshot_cell(self);
        initial.merge_raw(&self.updates()).last_firing_only(trans)
    }

    /// Listen to this cell's value: the handler fires once with the
    /// current value, then on every change.
    pub fn listen(&self, mut action: impl FnMut(&A) + Send + 'static) -> Listener {
        Transaction::apply(|trans| {
            self.value_internal(trans).listen_raw(
                &Node::null(),
                trans,
                HandlerCell::new(move |_trans, a| action(a)),
                false,
                true,
            )
        })
    }

    /// Transform the cell's value with `f`.
    pub fn map<B, F>(&self, f: F) -> Cell<B>
    where
        B: Clone + Send + 'static,
        F: Fn(&A) -> B + Send + Sync + 'static,
    {
        Transaction::apply(|trans| {
            let f = Arc::new(f);
            let f_init = Arc::clone(&f);
            let init = self.sample_lazy_internal(trans).map(move |a| f_init(&a));
            self.updates()
                .map(move |a| f(a))
                .hold_lazy_internal(trans, init)
        })
    }

    /// Apply a cell of functions to a cell of arguments. The output
    /// updates in any transaction where either side does, using each
    /// side's latest value.
    pub fn apply<B, F>(cf: &Cell<F>, ca: &Cell<A>) -> Cell<B>
    where
        B: Clone + Send + 'static,
        F: Fn(&A) -> B + Clone + Send + 'static,
    {
        Transaction::apply(|trans0| {
            let out: Stream<B> = Stream::never();
            let out_node = out.node().clone();
            // Intermediate node so downstreams of the output outrank both
            // inputs even as they link later.
            let in_node = Node::new(0);
            let (_changed, in_edge) = in_node.link_to(None, &out_node);

            struct ApplyState<F, A> {
                f: Option<F>,
                a: Option<A>,
                fired: bool,
            }
            let state = Arc::new(Mutex::new(ApplyState::<F, A> {
                f: None,
                a: None,
                fired: false,
            }));
            let weak_out = out.downgrade();

            let fire = {
                let state = Arc::clone(&state);
                let weak_out = weak_out.clone();
                let out_node = out_node.clone();
                move |trans1: &Transaction| {
                    {
                        let mut st = lock(&state);
                        if st.fired {
                            return;
                        }
                        st.fired = true;
                    }
                    let state = Arc::clone(&state);
                    let weak_out = weak_out.clone();
                    trans1.prioritized(&out_node, move |trans2| {
                        let value = {
                            let mut st = lock(&state);
                            st.fired = false;
                            let f = st.f.as_ref().expect("function side present before firing");
                            let a = st.a.as_ref().expect("argument side present before firing");
                            f(a)
                        };
                        if let Some(out) = weak_out.upgrade() {
                            out.send(trans2, value);
                        }
                    });
                }
            };

            let l1 = {
                let state = Arc::clone(&state);
                let fire = fire.clone();
                cf.value_internal(trans0).listen_raw(
                    &in_node,
                    trans0,
                    HandlerCell::new(move |trans1: &Transaction, f: &F| {
                        let ready = {
                            let mut st = lock(&state);
                            st.f = Some(f.clone());
                            st.a.is_some()
                        };
                        if ready {
                            fire(trans1);
                        }
                    }),
                    false,
                    true,
                )
            };
            let l2 = {
                let state = Arc::clone(&state);
                let fire = fire.clone();
                ca.value_internal(trans0).listen_raw(
                    &in_node,
                    trans0,
                    HandlerCell::new(move |trans1: &Transaction, a: &A| {
                        let ready = {
                            let mut st = lock(&state);
                            st.a = Some(a.clone());
                            st.f.is_some()
                        };
                        if ready {
                            fire(trans1);
                        }
                    }),
                    false,
                    true,
                )
            };

            let cf_init = cf.clone();
            let ca_init = ca.clone();
            let init = Lazy::new(move || {
                let f = cf_init.sample_no_trans();
                f(&ca_init.sample_no_trans())
            });
            out.add_cleanup_internal(l1)
                .add_cleanup_internal(l2)
                .add_cleanup_internal(Listener::new(in_node, in_edge, Vec::new()))
                .hold_lazy_internal(trans0, init)
        })
    }

    /// Combine two cells through `f`; the result updates whenever either
    /// input does.
    pub fn lift2<B, C, F>(&self, cb: &Cell<B>, f: F) -> Cell<C>
    where
        B: Clone + Send + 'static,
        C: Clone + Send + 'static,
        F: Fn(&A, &B) -> C + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let curried = self.map(move |a: &A| {
            let a = a.clone();
            let f = Arc::clone(&f);
            move |b: &B| f(&a, b)
        });
        Cell::apply(&curried, cb)
    }

    /// Combine three cells through `f`.
    pub fn lift3<B, C, D, F>(&self, cb: &Cell<B>, cc: &Cell<C>, f: F) -> Cell<D>
    where
        B: Clone + Send + 'static,
        C: Clone + Send + 'static,
        D: Clone + Send + 'static,
        F: Fn(&A, &B, &C) -> D + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let curried = self.map(move |a: &A| {
            let a = a.clone();
            let f = Arc::clone(&f);
            move |b: &B| {
                let a = a.clone();
                let b = b.clone();
                let f = Arc::clone(&f);
                move |c: &C| f(&a, &b, c)
            }
        });
        Cell::apply(&Cell::apply(&curried, cb), cc)
    }

    /// Flatten a cell of cells: the result tracks whichever inner cell is
    /// current. When a switch happens mid-transaction the freshly adopted
    /// cell wins the instant.
    pub fn switch_c(cca: &Cell<Cell<A>>) -> Cell<A> {
        Transaction::apply(|trans0| {
            let init = {
                let sample = cca.sample_lazy_internal(trans0);
                Lazy::new(move || sample.get().sample())
            };
            let out: Stream<A> = Stream::never();
            let target_node = out.node().clone();
            let weak_out = out.downgrade();
            let current: Arc<Mutex<Option<Listener>>> = Arc::new(Mutex::new(None));
            let switcher = {
                let current = Arc::clone(&current);
                let target_node = target_node.clone();
                HandlerCell::new(move |trans2: &Transaction, inner: &Cell<A>| {
                    if let Some(old) = lock(&current).take() {
                        old.unlisten();
                    }
                    let weak_out = weak_out.clone();
                    let emit = HandlerCell::new(move |trans3: &Transaction, a: &A| {
                        if let Some(out) = weak_out.upgrade() {
                            out.send(trans3, a.clone());
                        }
                    });
                    let l = inner
                        .value_internal(trans2)
                        .listen_raw(&target_node, trans2, emit, false, true);
                    *lock(&current) = Some(l);
                })
            };
            let l1 = cca
                .value_internal(trans0)
                .listen_raw(&target_node, trans0, switcher, false, true);
            out.add_cleanup_internal(l1)
                .keep_alive_internal(current)
                .hold_lazy_internal(trans0, init)
        })
    }

    /// Flatten a cell of streams: the result fires with whichever stream
    /// is current. The swap takes effect at the end of the switching
    /// transaction; firings the new stream produced earlier in that same
    /// instant are not replayed.
    pub fn switch_s(csa: &Cell<Stream<A>>) -> Stream<A> {
        Transaction::apply(|trans0| {
            let out: Stream<A> = Stream::never();
            let target_node = out.node().clone();
            let weak_out = out.downgrade();
            let emit = HandlerCell::new(move |trans2: &Transaction, a: &A| {
                if let Some(out) = weak_out.upgrade() {
                    out.send(trans2, a.clone());
                }
            });
            let current: Arc<Mutex<Option<Listener>>> = Arc::new(Mutex::new(None));
            *lock(&current) = Some(csa.sample_no_trans().listen_raw(
                &target_node,
                trans0,
                Arc::clone(&emit),
                false,
                true,
            ));
            let switcher = {
                let current = Arc::clone(&current);
                let target_node = target_node.clone();
                HandlerCell::new(move |trans2: &Transaction, ea: &Stream<A>| {
                    let trans_for_swap = trans2.clone();
                    let ea = ea.clone();
                    let current = Arc::clone(&current);
                    let emit = Arc::clone(&emit);
                    let target_node = target_node.clone();
                    trans2.last(move || {
                        if let Some(old) = lock(&current).take() {
                            old.unlisten();
                        }
                        let l = ea.listen_raw(&target_node, &trans_for_swap, emit, true, true);
                        *lock(&current) = Some(l);
                    });
                })
            };
            let l1 = csa
                .updates()
                .listen_raw(&target_node, trans0, switcher, false, true);
            out.add_cleanup_internal(l1).keep_alive_internal(current)
        })
    }

    /// Install the deferred initial value of a loop cell at bind time.
    pub(crate) fn set_lazy_init(&self, lazy: Lazy<A>) {
        let mut data = lock(&self.data);
        if data.current.is_none() {
            data.lazy_init = Some(lazy);
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
