#![forbid(unsafe_code)]

//! The propagation instant: a rank-ordered, re-entrant transaction engine.
//!
//! All graph activity happens inside a [`Transaction`]. External code opens
//! one with [`Transaction::run`]; sinks and combinators schedule work into
//! the *current* transaction, and everything the instant implies — firings,
//! coalescing, cell commits, deferred emissions — resolves when the
//! outermost `run` closes.
//!
//! # Phase model
//!
//! 1. **Drain**: prioritized entries execute in ascending (rank, sequence)
//!    order. Linking during the drain can change ranks; the queue is then
//!    regenerated before the next dequeue.
//! 2. **Last**: zero-argument actions in insertion order (cells commit
//!    their pending value here).
//! 3. **First-post**: zero-argument actions run with the current
//!    transaction cleared, in insertion order (`defer`/`split` post their
//!    re-emissions here, each opening its own fresh transaction).
//! 4. **Keyed post**: each key's action runs against a fresh child
//!    transaction, in ascending key order; writes to an occupied key
//!    compose.
//!
//! # Invariants
//!
//! 1. At most one transaction executes at a time, process-wide.
//! 2. A nested `run` on the owning thread reuses the active transaction.
//! 3. The close path runs in full on every exit, including user panics;
//!    the panic resumes to `run`'s caller afterwards.
//! 4. Entry sequence numbers are process-wide and never reused, so
//!    same-rank entries fire in FIFO order.

use std::any::Any;
use std::cell::{Cell as StdCell, RefCell};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::node::Node;
use crate::sync::lock;

// ─── Process-wide engine state ───────────────────────────────────────────────

/// Serializes transaction start and close across all threads. Held by the
/// outermost `run` for the transaction's whole extent.
static TRANSACTION_LOCK: Mutex<()> = Mutex::new(());

static ON_START_HOOKS: Mutex<Vec<Box<dyn FnMut() + Send>>> = Mutex::new(Vec::new());

/// Non-zero while a listener callback is being invoked. Sinks refuse
/// `send` while this is set.
static IN_CALLBACK: AtomicU32 = AtomicU32::new(0);

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Transaction>> = const { RefCell::new(None) };
    /// Whether this thread is the one holding `TRANSACTION_LOCK`.
    static HOLDS_LOCK: StdCell<bool> = const { StdCell::new(false) };
    static RUNNING_ON_START: StdCell<bool> = const { StdCell::new(false) };
}

/// RAII marker for "user callback in progress". Panic-safe.
pub(crate) struct CallbackGuard;

impl CallbackGuard {
    pub(crate) fn new() -> Self {
        IN_CALLBACK.fetch_add(1, Ordering::SeqCst);
        CallbackGuard
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        IN_CALLBACK.fetch_sub(1, Ordering::SeqCst);
    }
}

// ─── Entry ───────────────────────────────────────────────────────────────────

/// A scheduled (node, action) pair. Ordered by (rank snapshot, sequence);
/// the snapshot is refreshed when the queue regenerates.
struct Entry {
    rank: u64,
    seq: u64,
    node: Node,
    action: Box<dyn FnOnce(&Transaction) + Send>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.rank, self.seq).cmp(&(other.rank, other.seq))
    }
}

// ─── Transaction ─────────────────────────────────────────────────────────────

type PostAction = Box<dyn FnOnce(&Transaction) + Send>;

struct TransactionData {
    /// Min-heap of pending entries. Doubles as the entries set: on
    /// regeneration it is rebuilt in place with refreshed ranks.
    queue: BinaryHeap<Reverse<Entry>>,
    to_regen: bool,
    last_q: Vec<Box<dyn FnOnce() + Send>>,
    post_first_q: Vec<Box<dyn FnOnce() + Send>>,
    post_q: BTreeMap<u32, PostAction>,
}

impl TransactionData {
    fn regenerate(&mut self) {
        self.to_regen = false;
        let heap = std::mem::take(&mut self.queue);
        self.queue = heap
            .into_iter()
            .map(|Reverse(mut entry)| {
                entry.rank = entry.node.rank();
                Reverse(entry)
            })
            .collect();
    }
}

/// One logical propagation instant. Cheap to clone (shared interior);
/// handlers receive a reference to the transaction they fire in.
pub struct Transaction {
    data: Arc<Mutex<TransactionData>>,
}

impl Clone for Transaction {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl Transaction {
    fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(TransactionData {
                queue: BinaryHeap::new(),
                to_regen: false,
                last_q: Vec::new(),
                post_first_q: Vec::new(),
                post_q: BTreeMap::new(),
            })),
        }
    }

    // ─── Public façade ───────────────────────────────────────────────────

    /// Execute `f` inside a transaction and return its value.
    ///
    /// If a transaction is already active on this thread it is reused;
    /// otherwise a new one starts and closes when `f` returns. Everything
    /// sent within one `run` propagates as a single logical instant.
    pub fn run<R>(f: impl FnOnce() -> R) -> R {
        Self::apply(move |_| f())
    }

    /// [`run`](Transaction::run) for callers that produce no value.
    pub fn run_void(f: impl FnOnce()) {
        Self::run(f);
    }

    /// Schedule `action` to run after the current transaction's drain has
    /// completed (and after cell commits), outside of any transaction.
    pub fn post(action: impl FnOnce() + Send + 'static) {
        Self::apply(move |trans| trans.post_first(action));
    }

    /// Register a hook invoked at every transaction start, before its
    /// body. Hooks are not re-entered: transaction setup performed by a
    /// hook itself skips hook invocation.
    pub fn on_start(hook: impl FnMut() + Send + 'static) {
        lock(&ON_START_HOOKS).push(Box::new(hook));
    }

    // ─── Engine internals ────────────────────────────────────────────────

    /// Whether a transaction is active on this thread.
    pub(crate) fn is_active() -> bool {
        CURRENT.with(|c| c.borrow().is_some())
    }

    pub(crate) fn in_callback() -> bool {
        IN_CALLBACK.load(Ordering::SeqCst) > 0
    }

    fn current() -> Option<Transaction> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Run `f` against the current transaction, starting (and closing) one
    /// if none is active on this thread.
    pub(crate) fn apply<R>(f: impl FnOnce(&Transaction) -> R) -> R {
        if let Some(trans) = Self::current() {
            return f(&trans);
        }
        if HOLDS_LOCK.with(StdCell::get) {
            // Post-phase code on the owning thread: open a fresh
            // transaction without re-acquiring the lock.
            return Self::with_new_transaction(f);
        }
        let guard = lock(&TRANSACTION_LOCK);
        HOLDS_LOCK.with(|h| h.set(true));
        let result = catch_unwind(AssertUnwindSafe(|| Self::with_new_transaction(f)));
        HOLDS_LOCK.with(|h| h.set(false));
        drop(guard);
        match result {
            Ok(r) => r,
            Err(panic) => resume_unwind(panic),
        }
    }

    fn with_new_transaction<R>(f: impl FnOnce(&Transaction) -> R) -> R {
        Self::run_start_hooks();
        let trans = Transaction::new();
        let prev = CURRENT.with(|c| c.replace(Some(trans.clone())));
        let body = catch_unwind(AssertUnwindSafe(|| f(&trans)));
        let closed = catch_unwind(AssertUnwindSafe(|| trans.close()));
        CURRENT.with(|c| *c.borrow_mut() = prev);
        match (body, closed) {
            (Ok(r), Ok(())) => r,
            (Err(panic), _) | (Ok(_), Err(panic)) => resume_unwind(panic),
        }
    }

    fn run_start_hooks() {
        if RUNNING_ON_START.with(StdCell::get) {
            return;
        }
        RUNNING_ON_START.with(|r| r.set(true));
        let hooks = catch_unwind(AssertUnwindSafe(|| {
            for hook in lock(&ON_START_HOOKS).iter_mut() {
                hook();
            }
        }));
        RUNNING_ON_START.with(|r| r.set(false));
        if let Err(panic) = hooks {
            resume_unwind(panic);
        }
    }

    /// Schedule `action` at `node`'s rank in this transaction.
    pub(crate) fn prioritized(
        &self,
        node: &Node,
        action: impl FnOnce(&Transaction) + Send + 'static,
    ) {
        let entry = Entry {
            rank: node.rank(),
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            node: node.clone(),
            action: Box::new(action),
        };
        lock(&self.data).queue.push(Reverse(entry));
    }

    /// Schedule `action` for the last phase (after the drain).
    pub(crate) fn last(&self, action: impl FnOnce() + Send + 'static) {
        lock(&self.data).last_q.push(Box::new(action));
    }

    /// Schedule `action` for the first-post phase, which runs with the
    /// current transaction cleared.
    pub(crate) fn post_first(&self, action: impl FnOnce() + Send + 'static) {
        lock(&self.data).post_first_q.push(Box::new(action));
    }

    /// Schedule `action` to run against a fresh child transaction keyed by
    /// `key`. Writes to an occupied key compose, old action first.
    pub(crate) fn post_keyed(
        &self,
        key: u32,
        action: impl FnOnce(&Transaction) + Send + 'static,
    ) {
        let mut data = lock(&self.data);
        let composed: PostAction = match data.post_q.remove(&key) {
            Some(existing) => Box::new(move |trans: &Transaction| {
                existing(trans);
                action(trans);
            }),
            None => Box::new(action),
        };
        data.post_q.insert(key, composed);
    }

    /// Flag that a listened-to node's rank changed: the queue must be
    /// regenerated before the next dequeue.
    pub(crate) fn set_needs_regenerating(&self) {
        lock(&self.data).to_regen = true;
    }

    // ─── Close ───────────────────────────────────────────────────────────

    /// Drain and run every phase. A panicking action does not stop the
    /// close; the first panic is resumed once the close has completed.
    fn close(&self) {
        let mut first_panic: Option<Box<dyn Any + Send>> = None;
        let mut note = |result: Result<(), Box<dyn Any + Send>>| {
            if let Err(panic) = result {
                if first_panic.is_none() {
                    first_panic = Some(panic);
                }
            }
        };

        // Drain, regenerating whenever ranks moved under us.
        loop {
            let entry = {
                let mut data = lock(&self.data);
                if data.to_regen {
                    data.regenerate();
                }
                match data.queue.pop() {
                    Some(Reverse(entry)) => entry,
                    None => break,
                }
            };
            note(catch_unwind(AssertUnwindSafe(|| (entry.action)(self))));
        }

        // Last phase, in insertion order.
        loop {
            let actions = {
                let mut data = lock(&self.data);
                if data.last_q.is_empty() {
                    break;
                }
                std::mem::take(&mut data.last_q)
            };
            for action in actions {
                note(catch_unwind(AssertUnwindSafe(action)));
            }
        }

        // First-post phase: no current transaction.
        loop {
            let actions = {
                let mut data = lock(&self.data);
                if data.post_first_q.is_empty() {
                    break;
                }
                std::mem::take(&mut data.post_first_q)
            };
            let prev = CURRENT.with(|c| c.replace(None));
            for action in actions {
                note(catch_unwind(AssertUnwindSafe(action)));
            }
            CURRENT.with(|c| *c.borrow_mut() = prev);
        }

        // Keyed post phase: one fresh child transaction per key.
        loop {
            let posts = {
                let mut data = lock(&self.data);
                if data.post_q.is_empty() {
                    break;
                }
                std::mem::take(&mut data.post_q)
            };
            for (_key, action) in posts {
                let child = Transaction::new();
                let prev = CURRENT.with(|c| c.replace(Some(child.clone())));
                note(catch_unwind(AssertUnwindSafe(|| action(&child))));
                note(catch_unwind(AssertUnwindSafe(|| child.close())));
                CURRENT.with(|c| *c.borrow_mut() = prev);
            }
        }

        if let Some(panic) = first_panic {
            resume_unwind(panic);
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
