//! Observer registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Handle returned by [`Signal::listen`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

type Listener = Arc<dyn Fn() + Send + Sync>;

/// Calls every registered listener on [`Signal::emit`].
///
/// Listeners run outside the registry lock, so a listener may add or remove
/// listeners, including itself.
#[derive(Default)]
pub struct Signal {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("listeners", &self.len())
            .finish()
    }
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = ListenerId::new();
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Call every listener registered at the time of the call.
    pub fn emit(&self) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener();
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
