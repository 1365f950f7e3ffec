//! Generic fan-out notifier used by [`crate::peer::Peer`] to wake waiters
//! blocked in `free_link`. See spec §4.3.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex};

const DEFAULT_BUFFER: usize = 256;

/// Multi-subscriber broadcast channel. Each subscriber gets its own
/// bounded mpsc receiver; `broadcast` blocks on a full subscriber rather
/// than dropping the message, matching the Go original's blocking send.
pub struct Pubsub<T> {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<T>>>,
}

impl<T: Clone + Send + 'static> Default for Pubsub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Pubsub<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe with the default buffer size.
    pub async fn register(&self) -> (u64, mpsc::Receiver<T>) {
        self.register_n(DEFAULT_BUFFER).await
    }

    /// Subscribe with an explicit buffer size.
    pub async fn register_n(&self, buffer: usize) -> (u64, mpsc::Receiver<T>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.subscribers.lock().await.insert(id, tx);
        (id, rx)
    }

    /// Drop a subscription. Idempotent.
    pub async fn close(&self, id: u64) {
        self.subscribers.lock().await.remove(&id);
    }

    /// Deliver `msg` to every live subscriber. A subscriber whose channel
    /// has been dropped is pruned on this pass.
    pub async fn broadcast(&self, msg: T) {
        let mut subs = self.subscribers.lock().await;
        let mut dead = Vec::new();
        for (&id, tx) in subs.iter() {
            if tx.send(msg.clone()).await.is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            subs.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let pubsub = Pubsub::<u32>::new();
        let (_id_a, mut rx_a) = pubsub.register().await;
        let (_id_b, mut rx_b) = pubsub.register().await;

        pubsub.broadcast(42).await;

        assert_eq!(rx_a.recv().await, Some(42));
        assert_eq!(rx_b.recv().await, Some(42));
    }

    #[tokio::test]
    async fn close_stops_delivery() {
        let pubsub = Pubsub::<u32>::new();
        let (id, mut rx) = pubsub.register().await;
        pubsub.close(id).await;
        pubsub.broadcast(1).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_broadcast() {
        let pubsub = Pubsub::<u32>::new();
        let (_id, rx) = pubsub.register().await;
        drop(rx);
        pubsub.broadcast(1).await;
        assert!(pubsub.subscribers.lock().await.is_empty());
    }
}
