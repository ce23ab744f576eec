//! Connection Counter
//!
//! Tracks how many forwarded connections are open and reports every change.

use parking_lot::Mutex;
use std::sync::Arc;

type ChangeCallback = Arc<dyn Fn(i64) + Send + Sync>;

/// Thread-safe counter of active connections with change notification.
///
/// `increment` and `decrement` are serialized by one lock. The change
/// callback runs synchronously while that lock is held, so callbacks see
/// every intermediate value exactly once and in the order the mutations
/// happened.
///
/// The callback must return quickly and must not call back into the
/// counter: re-entering deadlocks, and any latency it adds is paid by the
/// connection being opened or closed.
pub struct ConnectionCounter {
    value: Mutex<i64>,
    on_change: Option<ChangeCallback>,
}

impl ConnectionCounter {
    /// Create a counter at zero with no callback.
    pub fn new() -> Self {
        Self {
            value: Mutex::new(0),
            on_change: None,
        }
    }

    /// Set the callback invoked with the new value after each change.
    pub fn on_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(callback));
        self
    }

    /// Record a new connection. Returns the new count.
    pub fn increment(&self) -> i64 {
        self.apply(1)
    }

    /// Record a closed connection. Returns the new count.
    pub fn decrement(&self) -> i64 {
        self.apply(-1)
    }

    /// Current number of connections.
    pub fn value(&self) -> i64 {
        *self.value.lock()
    }

    fn apply(&self, delta: i64) -> i64 {
        let mut value = self.value.lock();
        *value += delta;

        if let Some(callback) = &self.on_change {
            callback(*value);
        }
        tracing::info!("connected users: {}", *value);

        *value
    }
}

impl Default for ConnectionCounter {
    fn default() -> Self {
        Self::new()
    }
}
