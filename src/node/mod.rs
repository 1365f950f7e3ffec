//! `Node` — an overlay vertex: accepts and dials WebSocket links, keeps a
//! pool of named [`Peer`]s, and runs the hop-by-hop frame protocol. See
//! spec §3 (Node) and §4.5.

mod dispatch;

pub use dispatch::Frame;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use lru::LruCache;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{Result, TunnelError};
use crate::frame::TargetAddr;
use crate::link::{self, BoxFuture, Dialer, Link};
use crate::peer::{LinkState, Peer};

/// How long `receive_connect_frame` waits for a free link to the next
/// hop before giving up.
const FREE_LINK_TIMEOUT: Duration = Duration::from_secs(5);
/// Interval between `Peer::checkup_link_count` runs for dialed peers.
const CHECKUP_INTERVAL: Duration = Duration::from_secs(5);

pub struct Node {
    pub min_conns: usize,
    pub dialers_count: usize,
    pub key: Vec<u8>,
    pub disable_incoming_conns: bool,
    peers: Mutex<HashMap<String, Arc<Peer>>>,
    /// Mirrors `peers`' (name -> secret) so the synchronous WebSocket
    /// handshake callback can check a connecting peer's secret without
    /// awaiting the async `peers` lock.
    known_secrets: StdMutex<HashMap<String, Vec<u8>>>,
    used_nonces: Mutex<LruCache<String, ()>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Node {
    pub fn new(config: &NodeConfig) -> Arc<Self> {
        let cache_size = NonZeroUsize::new(config.nonce_cache_size.max(1)).expect("cache size is at least 1");
        Arc::new(Self {
            min_conns: config.min_conns,
            dialers_count: config.dialers_count,
            key: config.key.clone(),
            disable_incoming_conns: config.disable_incoming_conns,
            peers: Mutex::new(HashMap::new()),
            known_secrets: StdMutex::new(HashMap::new()),
            used_nonces: Mutex::new(LruCache::new(cache_size)),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn peer(&self, name: &str) -> Option<Arc<Peer>> {
        self.peers.lock().await.get(name).cloned()
    }

    async fn get_or_create_peer(self: &Arc<Self>, name: &str, secret: Vec<u8>) -> Arc<Peer> {
        let mut peers = self.peers.lock().await;
        if let Some(p) = peers.get(name) {
            return p.clone();
        }
        self.known_secrets
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| secret.clone());
        let p = Peer::new(name.to_string(), secret, None, self.min_conns, Arc::downgrade(self));
        peers.insert(name.to_string(), p.clone());
        p
    }

    /// Accept inbound overlay links on `addr` until the node is closed.
    /// The first connection under a given peer name establishes that
    /// peer's secret; subsequent connections must match it.
    pub async fn serve(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TunnelError::Bind { addr: addr.to_string(), source })?;
        info!(%addr, "node listening");

        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = self.close_notify.notified() => break,
            };
            let (stream, remote) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept error");
                    continue;
                }
            };
            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node.accept_one(stream, remote).await {
                    debug!(error = %e, %remote, "websocket handshake failed");
                }
            });
        }
        Ok(())
    }

    async fn accept_one(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) -> anyhow::Result<()> {
        let captured: Arc<StdMutex<(String, Vec<u8>)>> = Arc::new(StdMutex::new((String::new(), Vec::new())));
        let captured2 = captured.clone();
        let known = self.known_secrets.lock().unwrap().clone();
        let known = Arc::new(StdMutex::new(known));

        let callback = move |req: &Request, resp: Response| {
            let name = header_value(req, "name");
            let secret = header_value(req, "secret").into_bytes();
            let allowed = match known.lock().unwrap().get(&name) {
                Some(existing) => existing == &secret,
                None => true,
            };
            *captured2.lock().unwrap() = (name, secret);
            if allowed {
                Ok(resp)
            } else {
                let mut rejection = ErrorResponse::new(None);
                *rejection.status_mut() = StatusCode::FORBIDDEN;
                Err(rejection)
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let (name, secret) = captured.lock().unwrap().clone();
        if name.is_empty() {
            anyhow::bail!("missing name header in handshake");
        }

        let remote_addr = remote.to_string();
        let link = link::from_ws_accept(ws, remote_addr.clone());
        debug!(%remote_addr, %name, "accepted link");
        let peer = self.get_or_create_peer(&name, secret.clone()).await;
        if peer.secret != secret {
            debug!(%remote_addr, %name, "secret mismatch against existing peer, dropping link");
            link.close();
            anyhow::bail!("secret mismatch for peer {name}");
        }
        peer.adopt(link).await;
        Ok(())
    }

    /// Dial `name` at `url` and keep its link pool topped up for the
    /// life of the node.
    pub async fn connect(self: &Arc<Self>, name: String, url: String, secret: Vec<u8>) -> Arc<Peer> {
        self.known_secrets
            .lock()
            .unwrap()
            .entry(name.clone())
            .or_insert_with(|| secret.clone());
        let secret_str = String::from_utf8_lossy(&secret).into_owned();
        let dialer_name = name.clone();
        let dialer_url = url.clone();
        let dialer: Dialer = Arc::new(move || -> BoxFuture<'static, anyhow::Result<Link>> {
            let url = dialer_url.clone();
            let name = dialer_name.clone();
            let secret = secret_str.clone();
            Box::pin(async move { link::connect_ws_with_auth(&url, &name, &secret).await })
        });

        let peer = Peer::new(name.clone(), secret, Some(dialer), self.min_conns, Arc::downgrade(self));
        self.peers.lock().await.insert(name, peer.clone());
        peer.checkup_link_count().await;

        let node = self.clone();
        let peer_for_ticker = peer.clone();
        tokio::spawn(async move { node.checkup_timer(peer_for_ticker).await });

        peer
    }

    async fn checkup_timer(self: Arc<Self>, peer: Arc<Peer>) {
        let mut ticker = tokio::time::interval(CHECKUP_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => peer.checkup_link_count().await,
                _ = self.close_notify.notified() => break,
            }
        }
    }

    /// Accept local TCP connections on `local` and tunnel each one to
    /// `target` through `hops`, using `self.key` to sign the handshake.
    pub async fn listen_proxy(self: &Arc<Self>, hops: Vec<String>, local: SocketAddr, target: TargetAddr) -> Result<()> {
        if hops.is_empty() {
            return Err(TunnelError::EmptyHops);
        }
        let listener = TcpListener::bind(local)
            .await
            .map_err(|source| TunnelError::Bind { addr: local.to_string(), source })?;
        info!(%local, ?hops, ?target, "listen_proxy started");

        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = self.close_notify.notified() => break,
            };
            let (stream, remote_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept error");
                    continue;
                }
            };
            let node = self.clone();
            let hops = hops.clone();
            let target = target.clone();
            tokio::spawn(async move {
                node.handle_local_connection(stream, remote_addr, hops, target).await;
            });
        }
        Ok(())
    }

    async fn handle_local_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        hops: Vec<String>,
        target: TargetAddr,
    ) {
        debug!(%remote_addr, "new local connection, impersonating terminal link");
        let link = link::from_tcp_stream(stream);
        let ls = Arc::new(LinkState::new_terminal(link));

        let mut connect = crate::frame::ConnectPayload::new(hops, target);
        connect.dice_and_sign(&self.key);
        let body = crate::frame::encode_connect(&connect);

        self.receive(Frame { body, link: ls, created: true }).await;
    }

    /// Stop accepting/dialing and wake every background loop. Existing
    /// tunnels are not force-closed; they drain via the normal
    /// CLOSE/ERROR propagation as their underlying sockets close.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
    }
}

fn header_value(req: &Request, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_node_starts_open_and_close_is_idempotent() {
        let node = Node::new(&NodeConfig::default());
        assert!(!node.is_closed());
        node.close();
        assert!(node.is_closed());
        node.close();
        assert!(node.is_closed());
    }

    #[tokio::test]
    async fn unknown_peer_name_returns_none() {
        let node = Node::new(&NodeConfig::default());
        assert!(node.peer("nobody").await.is_none());
    }

    #[tokio::test]
    async fn get_or_create_peer_reuses_the_existing_peer() {
        let node = Node::new(&NodeConfig::default());
        let first = node.get_or_create_peer("jobX", b"secret".to_vec()).await;
        let second = node.get_or_create_peer("jobX", b"different-secret".to_vec()).await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn get_or_create_peer_records_known_secret_for_the_handshake_callback() {
        let node = Node::new(&NodeConfig::default());
        node.get_or_create_peer("jobX", b"secret".to_vec()).await;
        assert_eq!(node.known_secrets.lock().unwrap().get("jobX"), Some(&b"secret".to_vec()));
    }
}
