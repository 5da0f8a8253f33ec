#![forbid(unsafe_code)]

//! Subscription handles.
//!
//! A [`Listener`] is what keeps a subscription alive: it owns the strong
//! references to the handler (the graph itself only holds a weak one) and,
//! unless the subscription was registered weakly, to the source stream.
//! Dropping the handle unsubscribes — the RAII guard idiom.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::node::{Node, Target};
use crate::sync::lock;

struct ListenerInner {
    node: Node,
    target: Target,
    /// Keeps the handler (and usually the source stream) alive for as long
    /// as the subscription stands.
    _strongs: Vec<Arc<dyn Any + Send + Sync>>,
}

/// A handle representing one subscription.
///
/// Dropping the handle detaches the listener, so it must be held for as
/// long as events should be observed.
#[must_use = "dropping a Listener unsubscribes it immediately"]
pub struct Listener {
    inner: Arc<Mutex<Option<ListenerInner>>>,
}

impl Listener {
    pub(crate) fn new(node: Node, target: Target, strongs: Vec<Arc<dyn Any + Send + Sync>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(ListenerInner {
                node,
                target,
                _strongs: strongs,
            }))),
        }
    }

    /// Detach this subscription. Idempotent; later calls are no-ops.
    pub fn unlisten(&self) {
        // Take the state out first so the strong references drop outside
        // the graph locks (dropping them can cascade into nested
        // unlistens).
        let inner = lock(&self.inner).take();
        if let Some(inner) = inner {
            inner.node.unlink_to(&inner.target);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.unlisten();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let attached = lock(&self.inner).is_some();
        f.debug_struct("Listener").field("attached", &attached).finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlisten_detaches_and_is_idempotent() {
        let up = Node::new(0);
        let down = Node::new(0);
        let (_changed, target) = up.link_to(None, &down);
        let listener = Listener::new(up.clone(), target, Vec::new());
        assert_eq!(up.targets().len(), 1);

        listener.unlisten();
        assert!(up.targets().is_empty());
        listener.unlisten();
        assert!(up.targets().is_empty());
    }

    #[test]
    fn drop_unlistens() {
        let up = Node::new(0);
        let down = Node::new(0);
        let (_changed, target) = up.link_to(None, &down);
        {
            let _listener = Listener::new(up.clone(), target, Vec::new());
            assert_eq!(up.targets().len(), 1);
        }
        assert!(up.targets().is_empty());
    }
}
