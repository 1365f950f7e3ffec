//! Frame dispatch — the core hop-by-hop state machine. See spec §4.5.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::frame;
use crate::peer::LinkState;

use super::{Node, FREE_LINK_TIMEOUT};

/// One frame in flight: the encoded bytes, the link it arrived on (or is
/// being impersonated for), and whether it was synthesized internally
/// (an injected CONNECT, or a synthetic CLOSE standing in for EOF) rather
/// than actually read off the wire.
pub struct Frame {
    pub body: Vec<u8>,
    pub link: Arc<LinkState>,
    pub created: bool,
}

impl Node {
    /// Read loop for a single link: deliver every message it produces to
    /// [`Node::receive`], then synthesize a CLOSE frame once it's
    /// exhausted — mirroring the Go original's `read()`, which injects a
    /// close after its channel range loop ends.
    pub(crate) async fn read_loop(self: Arc<Self>, ls: Arc<LinkState>) {
        while let Some(body) = ls.link.recv().await {
            self.clone().receive(Frame { body, link: ls.clone(), created: false }).await;
        }
        let close_body = frame::encode_close();
        self.receive(Frame { body: close_body, link: ls, created: true }).await;
    }

    pub(crate) async fn receive(self: Arc<Self>, f: Frame) {
        let link = f.link.clone();
        let magic = frame::magic_of(&f.body);
        let needs_checkup = !matches!(magic, Some(frame::DATA));

        if needs_checkup {
            self.checkup_for(&link).await;
        }

        if link.terminal.load(Ordering::Acquire) && !f.created {
            self.receive_raw_frame(f).await;
        } else {
            match magic {
                Some(frame::CONNECT) => self.receive_connect_frame(f).await,
                Some(frame::ACK) => self.receive_ack_frame(f).await,
                Some(frame::CLOSE) | Some(frame::ERROR) => self.receive_close_error_frame(f).await,
                Some(frame::DATA) => self.receive_data_frame(f).await,
                _ => debug!("dropping frame with unrecognized magic byte"),
            }
        }

        if needs_checkup {
            self.checkup_for(&link).await;
        }
    }

    async fn checkup_for(&self, ls: &Arc<LinkState>) {
        if let Some(peer) = ls.peer() {
            peer.checkup_link_count().await;
        }
    }

    /// A terminal link's read loop hands us raw, unframed application
    /// bytes (not a protocol frame at all) — wrap them in a DATA frame
    /// and forward to whatever this link is attached to.
    async fn receive_raw_frame(&self, f: Frame) {
        if let Some(attached) = f.link.attached().await {
            let msg = frame::encode_data(f.body);
            self.write(&attached, msg).await;
        }
    }

    async fn receive_connect_frame(self: &Arc<Self>, f: Frame) {
        if self.disable_incoming_conns && !f.created {
            return;
        }

        let connect = match frame::decode_connect(&f.body) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "invalid connect frame, dropping");
                return;
            }
        };

        if connect.hops.is_empty() {
            self.terminate_connect(f, connect).await;
            return;
        }

        let mut hops = connect.hops.clone();
        let next_name = hops.remove(0);

        let Some(next_peer) = self.peer(&next_name).await else {
            if !f.link.terminal.load(Ordering::Acquire) {
                self.write(&f.link, frame::encode_error(format!("next hop not found: {next_name}"))).await;
            } else {
                self.close_term_link(&f.link).await;
            }
            return;
        };

        let Some(free_link) = next_peer.free_link(FREE_LINK_TIMEOUT).await else {
            if !f.link.terminal.load(Ordering::Acquire) {
                self.write(&f.link, frame::encode_error(format!("not enough link to: {next_name}"))).await;
            } else {
                self.close_term_link(&f.link).await;
            }
            return;
        };

        free_link.busy.store(true, Ordering::Release);
        free_link.wait_for_ack.store(true, Ordering::Release);
        free_link.attach_to(&f.link).await;

        f.link.busy.store(true, Ordering::Release);
        f.link.wait_for_ack.store(true, Ordering::Release);
        f.link.attach_to(&free_link).await;

        let mut forwarded = connect;
        forwarded.hops = hops;
        debug!(next = %next_name, "forwarding connect to next hop");
        self.write(&free_link, frame::encode_connect(&forwarded)).await;
    }

    /// This node is the last hop: verify the handshake, dial the actual
    /// target, and register the resulting terminal link.
    async fn terminate_connect(self: &Arc<Self>, f: Frame, connect: frame::ConnectPayload) {
        if !self.key.is_empty() && !connect.valid(&self.key) {
            warn!("invalid connect signature, rejecting");
            self.write(&f.link, frame::encode_error("invalid signature")).await;
            return;
        }

        {
            let mut nonces = self.used_nonces.lock().await;
            if nonces.contains(&connect.nonce) {
                warn!(nonce = %connect.nonce, "duplicated nonce, rejecting");
                self.write(&f.link, frame::encode_error("invalid signature")).await;
                return;
            }
            nonces.put(connect.nonce.clone(), ());
        }

        let addr = format!("{}:{}", connect.target.ip, connect.target.port);
        let target_link = match crate::link::connect_tcp(&addr).await {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, %addr, "cannot dial terminal target");
                self.write(&f.link, frame::encode_error(format!("cannot connect: {e}"))).await;
                return;
            }
        };

        debug!(%addr, "registering terminal link");
        let target_ls = Arc::new(LinkState::new_terminal(target_link));
        target_ls.busy.store(true, Ordering::Release);
        target_ls.attach_to(&f.link).await;

        f.link.attach_to(&target_ls).await;
        f.link.busy.store(true, Ordering::Release);
        f.link.wait_for_ack.store(false, Ordering::Release);

        self.write(&f.link, frame::encode_ack()).await;

        let node = self.clone();
        tokio::spawn(async move { node.read_loop(target_ls).await });
    }

    async fn receive_ack_frame(self: &Arc<Self>, f: Frame) {
        debug!(remote = %f.link.remote_addr(), "received ack frame");
        let attached = f.link.attached().await;
        f.link.wait_for_ack.store(false, Ordering::Release);

        let Some(attached) = attached else { return };
        attached.wait_for_ack.store(false, Ordering::Release);

        if attached.terminal.load(Ordering::Acquire) {
            let node = self.clone();
            tokio::spawn(async move { node.read_loop(attached).await });
        } else {
            debug!("forwarding ack frame");
            self.write(&attached, frame::encode_ack()).await;
        }
    }

    async fn receive_close_error_frame(self: &Arc<Self>, f: Frame) {
        let is_error = frame::magic_of(&f.body) == Some(frame::ERROR);
        debug!(remote = %f.link.remote_addr(), frame = if is_error { "error" } else { "close" }, "received close/error frame");

        let attached = f.link.detach().await;
        match f.link.peer() {
            Some(peer) => peer.release_link(&f.link).await,
            None => f.link.link.close(),
        }

        let Some(attached) = attached else { return };

        if attached.terminal.load(Ordering::Acquire) {
            debug!(remote = %attached.remote_addr(), "flush and close terminal link");
            self.flush_and_close(&attached).await;
        } else {
            debug!(remote = %attached.remote_addr(), "forwarding close/error frame");
            self.write(&attached, f.body.clone()).await;
            attached.detach().await;
            self.flush_and_close(&attached).await;
        }
    }

    async fn receive_data_frame(&self, f: Frame) {
        if !f.link.busy.load(Ordering::Acquire) || f.link.wait_for_ack.load(Ordering::Acquire) {
            return;
        }

        let Some(attached) = f.link.attached().await else { return };

        if attached.terminal.load(Ordering::Acquire) {
            match frame::decode_data(&f.body) {
                Ok(data) => self.write(&attached, data.data).await,
                Err(e) => {
                    // Dropping a single malformed frame rather than tearing
                    // down the tunnel: a proxy boundary should tolerate
                    // transient garbage without killing an otherwise
                    // healthy connection (see DESIGN.md).
                    error!(error = %e, "corrupt data frame, dropping");
                }
            }
        } else {
            self.write(&attached, f.body.clone()).await;
        }
    }

    /// Queue `msg` on `ls`. Serialized against `flush_and_close` by
    /// `ls.write_lock` so a write never lands after the close transition
    /// has begun.
    pub(crate) async fn write(&self, ls: &Arc<LinkState>, msg: Vec<u8>) {
        let _guard = ls.write_lock.lock().await;
        if ls.close_after_flush.load(Ordering::Acquire) {
            warn!("unable to write: link is closing after flush");
            return;
        }
        if let Err(e) = ls.link.send(msg).await {
            debug!(error = %e, "write failed, link likely closed");
        }
    }

    /// Mark `ls` as draining and close its send side gracefully. Queued
    /// writes already past `write`'s lock still land — the writer task
    /// drains them before it tears the link down — and anything after
    /// this point sees `close_after_flush` and is rejected.
    pub(crate) async fn flush_and_close(&self, ls: &Arc<LinkState>) {
        let _guard = ls.write_lock.lock().await;
        ls.close_after_flush.store(true, Ordering::Release);
        ls.link.flush_close();
    }

    async fn close_term_link(&self, ls: &Arc<LinkState>) {
        if !ls.terminal.load(Ordering::Acquire) {
            return;
        }
        ls.link.close();
        ls.detach().await;
    }
}
