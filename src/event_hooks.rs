use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use tracing::warn;

/// Small 1-to-N fan-out for session lifecycle notifications (disconnect,
///  pre-reconnect, reconnect-success).
///
/// Sinks are invoked outside the list lock, and a panicking sink is swallowed:
///  a misbehaving subscriber must not prevent disconnect cleanup or starve the
///  remaining sinks.
pub struct EventHooks<E> {
    sinks: Mutex<Vec<Arc<dyn Fn(&E) + Send + Sync>>>,
}

impl<E> EventHooks<E> {
    pub fn new() -> EventHooks<E> {
        EventHooks {
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, sink: impl Fn(&E) + Send + Sync + 'static) {
        self.sinks.lock().unwrap().push(Arc::new(sink));
    }

    pub fn notify(&self, event: &E) {
        let snapshot = self.sinks.lock().unwrap().clone();

        for sink in snapshot {
            if std::panic::catch_unwind(AssertUnwindSafe(|| sink(event))).is_err() {
                warn!("event sink panicked - continuing with the remaining sinks");
            }
        }
    }
}

impl<E> Default for EventHooks<E> {
    fn default() -> Self {
        Self::new()
    }
}
