//! In-process watch fan-out shared by the repository backends.

use std::sync::Mutex;

use tokio::sync::mpsc;

use super::{DataChangedEvent, WatchReceiver};

/// Prefix subscriptions and their senders
#[derive(Default)]
pub struct WatcherSet {
    listeners: Mutex<Vec<(String, mpsc::UnboundedSender<DataChangedEvent>)>>,
}

impl WatcherSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `prefix` (already normalized)
    pub fn subscribe(&self, prefix: String) -> WatchReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push((prefix, tx));
        rx
    }

    /// Remove every listener registered for `prefix`
    pub fn unsubscribe(&self, prefix: &str) {
        self.lock().retain(|(p, _)| p != prefix);
    }

    /// Deliver an event to every listener whose prefix covers the key
    pub fn notify(&self, event: &DataChangedEvent) {
        let mut listeners = self.lock();
        listeners.retain(|(prefix, tx)| {
            if !covers(prefix, &event.key) {
                return !tx.is_closed();
            }
            tx.send(event.clone()).is_ok()
        });
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, mpsc::UnboundedSender<DataChangedEvent>)>> {
        // A panic while holding the lock leaves a valid Vec behind
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Whether `prefix` is `key` itself or one of its ancestors
pub(crate) fn covers(prefix: &str, key: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    key == prefix || (key.starts_with(prefix) && key.as_bytes().get(prefix.len()) == Some(&b'/'))
}
