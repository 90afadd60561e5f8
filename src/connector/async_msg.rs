//! Fan-out of unsolicited network messages

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::protocol::AsyncMessage;

/// Receives unsolicited messages from the network
pub trait AsyncMessageListener: Send + Sync {
    fn on_async_message(&self, message: &AsyncMessage);
}

impl<F> AsyncMessageListener for F
where
    F: Fn(&AsyncMessage) + Send + Sync,
{
    fn on_async_message(&self, message: &AsyncMessage) {
        self(message)
    }
}

/// Handle identifying one registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Runs a listener callback, containing a panic to that one callback
pub(crate) fn isolate(what: &str, callback: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!(listener = what, "listener panicked, ignored");
    }
}

/// Pushes each message to every registered listener in registration order
#[derive(Default)]
pub(crate) struct AsyncMsgGenerator {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn AsyncMessageListener>)>>,
    next_id: AtomicU64,
}

impl AsyncMsgGenerator {
    pub(crate) fn register(&self, listener: Arc<dyn AsyncMessageListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        debug!(%id, "async message listener registered");
        id
    }

    pub(crate) fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        before != listeners.len()
    }

    pub(crate) fn dispatch(&self, message: &AsyncMessage) {
        // listeners may (un)register from inside the callback
        let listeners: Vec<_> = self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        if listeners.is_empty() {
            debug!(source = %message.source_node, "async message without listeners dropped");
            return;
        }
        for listener in listeners {
            isolate("async message", || listener.on_async_message(message));
        }
    }
}
