//! End-to-end tests driving real `Node`s over real sockets — no mocks.
//! Each scenario below mirrors one of the end-to-end scenarios from the
//! tunnel overlay's design notes.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use hopwire::config::NodeConfig;
use hopwire::frame::{self, ConnectPayload, TargetAddr};
use hopwire::link;
use hopwire::Node;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn node_with_key(key: Vec<u8>) -> std::sync::Arc<Node> {
    let config = NodeConfig { key, ..NodeConfig::default() };
    Node::new(&config)
}

/// A TCP echo server: every byte read is written back verbatim.
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A TCP server that accepts and immediately closes every connection.
async fn spawn_hangup_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            drop(stream);
        }
    });
    addr
}

async fn roundtrip(addr: SocketAddr, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(payload).await?;
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Builds the three-node topology used by most scenarios: A (origin), B
/// (relay), C (terminal). A reaches B under peer name "root"; C reaches
/// B under peer name "jobX" (so B can route A's second hop to C).
async fn build_topology(
    a_key: Vec<u8>,
    c_key: Vec<u8>,
) -> (std::sync::Arc<Node>, std::sync::Arc<Node>, std::sync::Arc<Node>, SocketAddr) {
    let node_a = node_with_key(a_key);
    let node_b = Node::new(&NodeConfig::default());
    let node_c = node_with_key(c_key);

    let b_addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let serve_b = node_b.clone();
    tokio::spawn(async move { serve_b.serve(b_addr).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let b_url = format!("ws://{b_addr}");
    node_a.connect("root".into(), b_url.clone(), Vec::new()).await;
    node_c.connect("jobX".into(), b_url, Vec::new()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    (node_a, node_b, node_c, b_addr)
}

#[tokio::test]
async fn two_hop_happy_path() {
    let echo_addr = spawn_echo_server().await;
    let (node_a, _node_b, _node_c, _b_addr) = build_topology(Vec::new(), Vec::new()).await;

    let local_addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let target = TargetAddr { ip: echo_addr.ip().to_string(), port: echo_addr.port() };
    let listen_node = node_a.clone();
    let hops = vec!["root".to_string(), "jobX".to_string()];
    tokio::spawn(async move { listen_node.listen_proxy(hops, local_addr, target).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let got = tokio::time::timeout(Duration::from_secs(5), roundtrip(local_addr, b"hello"))
        .await
        .expect("tunnel timed out")
        .expect("tunnel round-trip failed");
    assert_eq!(got, b"hello");
}

#[tokio::test]
async fn mismatched_signature_is_rejected() {
    let echo_addr = spawn_echo_server().await;
    let (node_a, _node_b, _node_c, _b_addr) =
        build_topology(b"key-a".to_vec(), b"key-c-different".to_vec()).await;

    let local_addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let target = TargetAddr { ip: echo_addr.ip().to_string(), port: echo_addr.port() };
    let listen_node = node_a.clone();
    let hops = vec!["root".to_string(), "jobX".to_string()];
    tokio::spawn(async move { listen_node.listen_proxy(hops, local_addr, target).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect(local_addr).await.unwrap();
    stream.write_all(b"hello").await.ok();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
    // The terminal hop rejects the signature and closes its side of the
    // tunnel; the origin socket observes EOF (a 0-byte read) rather than
    // an echo of "hello".
    match read {
        Ok(Ok(n)) => assert_eq!(n, 0, "expected EOF after signature rejection"),
        Ok(Err(e)) => assert!(matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::BrokenPipe)),
        Err(_) => panic!("origin socket never closed after signature rejection"),
    }
}

#[tokio::test]
async fn replayed_connect_is_rejected() {
    let echo_addr = spawn_echo_server().await;
    let key = b"shared-key".to_vec();
    let node_c = node_with_key(key.clone());

    let c_addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let serve_c = node_c.clone();
    tokio::spawn(async move { serve_c.serve(c_addr).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Impersonate an overlay peer dialing C directly, bypassing any origin.
    let url = format!("ws://{c_addr}");
    let attacker_link = link::connect_ws_with_auth(&url, "attacker", "").await.unwrap();

    let mut connect = ConnectPayload::new(vec![], TargetAddr { ip: echo_addr.ip().to_string(), port: echo_addr.port() });
    connect.dice_and_sign(&key);
    let body = frame::encode_connect(&connect);

    attacker_link.send(body.clone()).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), attacker_link.recv())
        .await
        .unwrap()
        .expect("link closed before ACK");
    assert_eq!(frame::magic_of(&first), Some(frame::ACK), "first CONNECT should be accepted");

    attacker_link.send(body).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), attacker_link.recv())
        .await
        .unwrap()
        .expect("link closed before replay response");
    assert_eq!(frame::magic_of(&second), Some(frame::ERROR), "replayed CONNECT must be rejected");
}

#[tokio::test]
async fn pool_grows_under_concurrent_demand() {
    let echo_addr = spawn_echo_server().await;

    let node_b = Node::new(&NodeConfig { min_conns: 2, ..NodeConfig::default() });
    let node_c = Node::new(&NodeConfig::default());

    let c_addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let serve_c = node_c.clone();
    tokio::spawn(async move { serve_c.serve(c_addr).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    node_b.connect("c".into(), format!("ws://{c_addr}"), Vec::new()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let local_addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let target = TargetAddr { ip: echo_addr.ip().to_string(), port: echo_addr.port() };
    let listen_node = node_b.clone();
    tokio::spawn(async move { listen_node.listen_proxy(vec!["c".to_string()], local_addr, target).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Two long-lived tunnels occupy both pooled links; a third arriving
    // concurrently must still complete, either on a freshly dialed link
    // or by waiting out `free_link`'s 5s timeout.
    let (one, two, three) = tokio::time::timeout(
        Duration::from_secs(8),
        tokio::join!(
            roundtrip(local_addr, b"one"),
            roundtrip(local_addr, b"two"),
            roundtrip(local_addr, b"three"),
        ),
    )
    .await
    .expect("pool exhaustion scenario did not converge");

    one.expect("tunnel through a grown pool should succeed");
    two.expect("tunnel through a grown pool should succeed");
    three.expect("tunnel through a grown pool should succeed");
}

#[tokio::test]
async fn terminal_close_propagates_to_origin() {
    let hangup_addr = spawn_hangup_server().await;
    let (node_a, _node_b, _node_c, _b_addr) = build_topology(Vec::new(), Vec::new()).await;

    let local_addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let target = TargetAddr { ip: hangup_addr.ip().to_string(), port: hangup_addr.port() };
    let listen_node = node_a.clone();
    let hops = vec!["root".to_string(), "jobX".to_string()];
    tokio::spawn(async move { listen_node.listen_proxy(hops, local_addr, target).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect(local_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf)).await;
    match read {
        Ok(Ok(n)) => assert_eq!(n, 0, "origin socket should observe EOF once C's target hangs up"),
        Ok(Err(_)) => {}
        Err(_) => panic!("CLOSE never propagated back to the origin socket"),
    }
}

#[tokio::test]
async fn proactive_peer_secret_rejects_spoofed_inbound_link() {
    let node_b = Node::new(&NodeConfig::default());

    let b_addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let serve_b = node_b.clone();
    tokio::spawn(async move { serve_b.serve(b_addr).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // B proactively dials a peer it names "jobX" with a real secret, the
    // way node_c would in the normal topology. The dial target doesn't
    // need to exist — what matters is that the peer and its secret exist.
    node_b.connect("jobX".into(), "ws://127.0.0.1:1".into(), b"real-secret".to_vec()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // An attacker dials B directly, reusing the "jobX" name with the wrong
    // secret, hoping to be adopted into that peer's pool.
    let url = format!("ws://{b_addr}");
    let result = link::connect_ws_with_auth(&url, "jobX", "wrong-secret").await;
    assert!(result.is_err(), "spoofed secret for an existing peer name must be rejected");

    let jobx = node_b.peer("jobX").await.expect("proactively dialed peer should exist");
    assert_eq!(jobx.link_count().await, 0, "no spoofed link should join the pool");
}

#[tokio::test]
async fn node_close_tears_down_its_listeners() {
    let node_b = Node::new(&NodeConfig::default());
    let b_addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let serve_b = node_b.clone();
    let serve_task = tokio::spawn(async move { serve_b.serve(b_addr).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Sanity: the listener accepts while the node is open.
    TcpStream::connect(b_addr).await.expect("listener should be up before close");

    node_b.close();
    let _ = tokio::time::timeout(Duration::from_secs(2), serve_task).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Close tears down listeners and ticker tasks (not in-flight tunnels,
    // which drain via ordinary CLOSE/ERROR propagation instead) — see
    // DESIGN.md. The bound socket is gone, so new connections are refused.
    let result = TcpStream::connect(b_addr).await;
    assert!(result.is_err(), "listener should stop accepting after Node::close");
}
