//! [`Link`] — a bidirectional byte-message channel over either a raw TCP
//! socket or a WebSocket. See spec §4.1.
//!
//! Both transports are reduced to the same shape: a send side accepting
//! `Vec<u8>` messages and a receive side yielding them, backed by two
//! background tasks (reader, writer) per link. For TCP, a "message" is
//! whatever `read()` returns in one call (up to 32KiB); for WebSocket, a
//! message is one binary frame — which, at the `Node` layer, is exactly
//! one encoded protocol frame.

mod tcp;
mod ws;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub use tcp::{connect_tcp, from_tcp_stream};
pub use ws::{connect_ws_with_auth, from_ws_accept};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Produces a fresh outbound [`Link`] on demand. Boxed-closure form avoids
/// pulling in `async-trait` for a single-method contract.
pub type Dialer = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Link>> + Send + Sync>;

const CHANNEL_BUFFER: usize = 32;

/// A single bidirectional link, TCP or WebSocket, with its background
/// reader/writer tasks. `close` is an abrupt, idempotent teardown; `flush_close`
/// is graceful — it lets the writer drain whatever is already queued before
/// the writer itself performs the hard teardown.
pub struct Link {
    tx: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    remote_addr: String,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    fn new(
        tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Vec<u8>>,
        remote_addr: String,
        closed: Arc<AtomicBool>,
        reader: JoinHandle<()>,
        writer: JoinHandle<()>,
    ) -> Self {
        Self {
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
            remote_addr,
            closed,
            reader,
            writer,
        }
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one message. Fails once the link is closed, draining, or its
    /// writer task has exited.
    pub async fn send(&self, msg: Vec<u8>) -> anyhow::Result<()> {
        if self.is_closed() {
            anyhow::bail!("link to {} is closed", self.remote_addr);
        }
        let tx = self.tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx
                .send(msg)
                .await
                .map_err(|_| anyhow::anyhow!("link to {} is closed", self.remote_addr)),
            None => anyhow::bail!("link to {} is closed", self.remote_addr),
        }
    }

    /// Receive the next message, or `None` once the link has closed and
    /// drained.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.rx.lock().await.recv().await
    }

    /// Graceful send-side close: drop the outbound sender so the writer's
    /// `out_rx.recv()` yields `None` once whatever is already queued has
    /// drained, rather than right away. The writer performs the actual
    /// teardown (aborting the reader, marking `closed`) itself once its
    /// loop exits, so nothing already in flight is lost.
    pub fn flush_close(&self) {
        self.tx.lock().unwrap().take();
    }

    /// Idempotent close: aborts both background tasks immediately and marks
    /// the link dead for future `send`/`recv` callers. Unlike `flush_close`,
    /// anything still queued in the writer's channel is discarded.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tx.lock().unwrap().take();
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}
