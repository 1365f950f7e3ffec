//! `Peer` — a named remote overlay node and the pool of [`LinkState`]s
//! connecting to it. See spec §3 (Peer) and §4.4.
//!
//! Links in this pool are single-use: once claimed by `free_link` a link
//! stays busy for the life of the tunnel it carries, and `release_link`
//! tears it down rather than returning it for reuse. The pool is kept
//! topped up by `checkup_link_count` dialing fresh links, not by
//! recycling old ones — this mirrors the original Go `peer` exactly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::link::{Dialer, Link};
use crate::node::Node;
use crate::pubsub::Pubsub;

/// Stable identity for a link inside a peer's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(0);

impl LinkId {
    fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Per-link bookkeeping the `Node` frame dispatcher needs: which peer
/// owns it (absent for terminal links), whether it's claimed, whether
/// it's paired with another link to relay DATA/ACK/CLOSE between them.
///
/// `peer` and `attached_to` are `Weak`. The owning `Peer.links` map (for
/// pool links) or the reader task itself (for terminal links, which
/// belong to no pool) holds the only strong reference, so a pair of
/// attached links — possibly in different peers — never forms an
/// ownership cycle.
pub struct LinkState {
    pub id: LinkId,
    pub link: Link,
    peer: Weak<Peer>,
    pub busy: AtomicBool,
    pub close_after_flush: AtomicBool,
    pub wait_for_ack: AtomicBool,
    pub terminal: AtomicBool,
    pub attached_to: Mutex<Option<Weak<LinkState>>>,
    /// Serializes `Node::write`/`flush_and_close` so a write in flight
    /// never races the close transition (spec §9).
    pub write_lock: Mutex<()>,
}

impl LinkState {
    pub(crate) fn new(id: LinkId, link: Link, peer: Weak<Peer>) -> Self {
        Self {
            id,
            link,
            peer,
            busy: AtomicBool::new(false),
            close_after_flush: AtomicBool::new(false),
            wait_for_ack: AtomicBool::new(false),
            terminal: AtomicBool::new(false),
            attached_to: Mutex::new(None),
            write_lock: Mutex::new(()),
        }
    }

    pub(crate) fn new_terminal(link: Link) -> Self {
        let mut ls = Self::new(LinkId::next(), link, Weak::new());
        ls.terminal = AtomicBool::new(true);
        ls
    }

    pub fn peer(&self) -> Option<Arc<Peer>> {
        self.peer.upgrade()
    }

    pub async fn attached(&self) -> Option<Arc<LinkState>> {
        self.attached_to.lock().await.as_ref().and_then(Weak::upgrade)
    }

    pub async fn attach_to(&self, other: &Arc<LinkState>) {
        *self.attached_to.lock().await = Some(Arc::downgrade(other));
    }

    pub async fn detach(&self) -> Option<Arc<LinkState>> {
        self.attached_to.lock().await.take().and_then(|w| w.upgrade())
    }

    pub fn remote_addr(&self) -> &str {
        self.link.remote_addr()
    }
}

pub struct Peer {
    pub name: String,
    pub secret: Vec<u8>,
    dialer: Option<Dialer>,
    min_conns: usize,
    node: Weak<Node>,
    links: Mutex<HashMap<LinkId, Arc<LinkState>>>,
    /// Broadcasts each newly joined link so `free_link` waiters can race
    /// to claim it. Not signalled on release — a released link is gone,
    /// not freed for reuse.
    pubsub: Pubsub<Arc<LinkState>>,
}

impl Peer {
    pub fn new(
        name: String,
        secret: Vec<u8>,
        dialer: Option<Dialer>,
        min_conns: usize,
        node: Weak<Node>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            secret,
            dialer,
            min_conns,
            node,
            links: Mutex::new(HashMap::new()),
            pubsub: Pubsub::new(),
        })
    }

    pub async fn link_count(&self) -> usize {
        self.links.lock().await.len()
    }

    /// Register a link this peer did not dial itself (e.g. accepted
    /// inbound) into its pool, start the node's read loop over it, and
    /// announce it to any waiting `free_link` callers.
    pub async fn adopt(self: &Arc<Self>, link: Link) -> Arc<LinkState> {
        let id = LinkId::next();
        let ls = Arc::new(LinkState::new(id, link, Arc::downgrade(self)));
        self.links.lock().await.insert(id, ls.clone());
        self.spawn_reader(ls.clone());
        self.pubsub.broadcast(ls.clone()).await;
        ls
    }

    /// Dial a fresh link via this peer's `Dialer` and add it to the pool.
    pub async fn dial(self: &Arc<Self>) -> anyhow::Result<Arc<LinkState>> {
        let dialer = self
            .dialer
            .clone()
            .ok_or_else(|| anyhow::anyhow!("peer {} has no dialer configured", self.name))?;
        let link = dialer().await?;
        Ok(self.adopt(link).await)
    }

    fn spawn_reader(self: &Arc<Self>, ls: Arc<LinkState>) {
        if let Some(node) = self.node.upgrade() {
            tokio::spawn(async move {
                node.read_loop(ls).await;
            });
        }
    }

    /// Ensure at least `min_conns` non-busy links exist, dialing more as
    /// needed, in parallel. A no-op for peers with no dialer (accept-only
    /// peers).
    pub async fn checkup_link_count(self: &Arc<Self>) {
        if self.dialer.is_none() {
            return;
        }
        let free = {
            let links = self.links.lock().await;
            links.values().filter(|ls| !ls.busy.load(Ordering::Acquire)).count()
        };
        if free >= self.min_conns {
            return;
        }
        for _ in free..self.min_conns {
            let peer = self.clone();
            tokio::spawn(async move {
                let _ = peer.dial().await;
            });
        }
    }

    /// Claim the first non-busy link already in the pool, or wait up to
    /// `timeout` for a newly-dialed one to arrive. Registers for
    /// new-link announcements before scanning the existing pool so a
    /// link dialed concurrently is never missed.
    pub async fn free_link(self: &Arc<Self>, timeout: Duration) -> Option<Arc<LinkState>> {
        let (id, mut rx) = self.pubsub.register_n(32).await;

        if let Some(ls) = self.claim_from_pool().await {
            self.pubsub.close(id).await;
            return Some(ls);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.pubsub.close(id).await;
                return None;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(candidate)) => {
                    if !candidate.busy.swap(true, Ordering::AcqRel) {
                        self.pubsub.close(id).await;
                        return Some(candidate);
                    }
                    // someone else won the race for this link; keep waiting
                }
                _ => {
                    self.pubsub.close(id).await;
                    return None;
                }
            }
        }
    }

    async fn claim_from_pool(&self) -> Option<Arc<LinkState>> {
        let links = self.links.lock().await;
        links
            .values()
            .find(|ls| !ls.busy.swap(true, Ordering::AcqRel))
            .cloned()
    }

    /// Tear a link down: clear its attachment, remove it from the pool,
    /// and close the underlying transport. Matches the Go original's
    /// `releaseLink` — a released link is destroyed, not recycled.
    pub async fn release_link(&self, ls: &Arc<LinkState>) {
        ls.detach().await;
        self.links.lock().await.remove(&ls.id);
        ls.link.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link;

    /// A real loopback TCP link — no mocks, per the test-tooling policy.
    async fn test_link() -> Link {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        link::from_tcp_stream(stream)
    }

    fn test_peer() -> Arc<Peer> {
        Peer::new("test".to_string(), Vec::new(), None, 2, Weak::new())
    }

    #[tokio::test]
    async fn adopt_registers_link_in_pool() {
        let peer = test_peer();
        let link = test_link().await;
        peer.adopt(link).await;
        assert_eq!(peer.link_count().await, 1);
    }

    #[tokio::test]
    async fn free_link_claims_a_non_busy_pooled_link() {
        let peer = test_peer();
        let link = test_link().await;
        let ls = peer.adopt(link).await;
        let claimed = peer.free_link(Duration::from_millis(200)).await;
        assert_eq!(claimed.map(|c| c.id), Some(ls.id));
    }

    #[tokio::test]
    async fn free_link_times_out_on_empty_pool() {
        let peer = test_peer();
        let claimed = peer.free_link(Duration::from_millis(50)).await;
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn checkup_link_count_is_a_noop_without_a_dialer() {
        let peer = test_peer();
        peer.checkup_link_count().await;
        assert_eq!(peer.link_count().await, 0);
    }

    #[tokio::test]
    async fn release_link_removes_it_from_the_pool_and_closes_it() {
        let peer = test_peer();
        let link = test_link().await;
        let ls = peer.adopt(link).await;
        peer.release_link(&ls).await;
        assert_eq!(peer.link_count().await, 0);
        assert!(ls.link.is_closed());
    }
}
