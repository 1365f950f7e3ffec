//! TCP transport for [`Link`] — used for the terminal hop's connection to
//! the local application socket (dial side) or to the final target
//! (accept side).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::{Link, CHANNEL_BUFFER};

const READ_CHUNK: usize = 32 * 1024;

pub fn from_tcp_stream(stream: TcpStream) -> Link {
    let remote_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (read_half, write_half) = stream.into_split();

    let closed = Arc::new(AtomicBool::new(false));
    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER);

    let reader_closed = closed.clone();
    let reader = tokio::spawn(async move {
        let mut read_half = read_half;
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if in_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
        reader_closed.store(true, Ordering::Release);
    });
    let reader_abort = reader.abort_handle();

    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        let mut write_half = write_half;
        let mut out_rx = out_rx;
        while let Some(msg) = out_rx.recv().await {
            if write_half.write_all(&msg).await.is_err() {
                break;
            }
        }
        // Mirrors the Go original's `defer Close()` inside its writer
        // goroutine: whether the loop ended by graceful drain (channel
        // closed) or a write error, the writer itself tears the link down.
        writer_closed.store(true, Ordering::Release);
        reader_abort.abort();
    });

    Link::new(out_tx, in_rx, remote_addr, closed, reader, writer)
}

pub async fn connect_tcp(addr: &str) -> anyhow::Result<Link> {
    let stream = TcpStream::connect(addr).await?;
    Ok(from_tcp_stream(stream))
}
