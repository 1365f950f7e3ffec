//! WebSocket transport for [`Link`] — carries the full frame protocol
//! between overlay nodes, with ping/pong keep-alive.
//!
//! The reader owns the `SplitStream` half and the writer owns the
//! `SplitSink` half plus the ping ticker; a small internal channel lets
//! the reader ask the writer to emit a `Pong` when it observes an
//! incoming `Ping`, so only the writer task ever touches the sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{Link, CHANNEL_BUFFER};

/// Idle-read deadline: a link with no inbound traffic (data, ping, or
/// pong) for this long is considered dead.
const READ_DEADLINE: Duration = Duration::from_secs(120);
/// Ping interval — 9/10 of the read deadline, leaving margin for a pong
/// to land before the peer would time us out.
const PING_INTERVAL: Duration = Duration::from_secs(108);

/// Dial a WebSocket link carrying the `name`/`secret` handshake headers
/// the accept side checks before admitting the connection.
pub async fn connect_ws_with_auth(url: &str, name: &str, secret: &str) -> anyhow::Result<Link> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = url.into_client_request()?;
    request.headers_mut().insert("name", name.parse()?);
    request.headers_mut().insert("secret", secret.parse()?);
    let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(from_stream(ws, url.to_string()))
}

pub fn from_ws_accept(ws: WebSocketStream<TcpStream>, remote_addr: String) -> Link {
    from_stream(ws, remote_addr)
}

fn from_stream<S>(ws: WebSocketStream<S>, remote_addr: String) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let closed = Arc::new(AtomicBool::new(false));
    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER);
    let (pong_tx, pong_rx) = mpsc::channel::<()>(CHANNEL_BUFFER);

    let reader_closed = closed.clone();
    let reader = tokio::spawn(async move {
        let mut stream = stream;
        loop {
            let next = tokio::time::timeout(READ_DEADLINE, stream.next()).await;
            let msg = match next {
                Ok(Some(Ok(msg))) => msg,
                _ => break,
            };
            match msg {
                Message::Binary(data) => {
                    if in_tx.send(data).await.is_err() {
                        break;
                    }
                }
                Message::Ping(_) => {
                    if pong_tx.send(()).await.is_err() {
                        break;
                    }
                }
                Message::Pong(_) => {}
                Message::Close(_) => break,
                Message::Text(_) | Message::Frame(_) => {}
            }
        }
        reader_closed.store(true, Ordering::Release);
    });
    let reader_abort = reader.abort_handle();

    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        let mut sink = sink;
        let mut out_rx = out_rx;
        let mut pong_rx = pong_rx;
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                msg = out_rx.recv() => {
                    match msg {
                        Some(data) => {
                            if sink.send(Message::Binary(data)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                pong = pong_rx.recv() => {
                    if pong.is_none() {
                        break;
                    }
                    if sink.send(Message::Pong(Vec::new())).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
        // Mirrors the Go original's `defer Close()` inside its writer
        // goroutine: whether the loop ended by graceful drain (channel
        // closed) or a send error, the writer itself tears the link down.
        writer_closed.store(true, Ordering::Release);
        reader_abort.abort();
    });

    Link::new(out_tx, in_rx, remote_addr, closed, reader, writer)
}
