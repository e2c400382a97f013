//! Lossy reload fan-out to connected browsers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::info;

type SubscriberMap = Arc<RwLock<HashMap<u64, mpsc::Sender<()>>>>;

/// Broadcasts reload signals to every subscriber.
///
/// Each subscriber owns a one-slot queue; a broadcast that finds the slot
/// full skips it — one delivered reload is equivalent to N. Subscription
/// and removal are safe under concurrent broadcast.
#[derive(Clone, Default)]
pub struct ReloadBus {
    subscribers: SubscriberMap,
    next_id: Arc<AtomicU64>,
}

/// A registered reload listener. Dropping it unregisters it.
pub struct ReloadSubscriber {
    id: u64,
    rx: mpsc::Receiver<()>,
    subscribers: SubscriberMap,
}

impl ReloadBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> ReloadSubscriber {
        let (tx, rx) = mpsc::channel(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(id, tx);
        ReloadSubscriber {
            id,
            rx,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Non-blocking fan-out; subscribers with a full slot are skipped.
    pub fn broadcast(&self) {
        let subscribers = self.subscribers.read();
        info!(
            target: "proxy",
            "triggering browser reload for {} client(s)",
            subscribers.len()
        );
        for tx in subscribers.values() {
            let _ = tx.try_send(());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl ReloadSubscriber {
    /// Waits for the next reload signal.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

impl Drop for ReloadSubscriber {
    fn drop(&mut self) {
        self.subscribers.write().remove(&self.id);
    }
}
