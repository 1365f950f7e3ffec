//! `hopwire` — minimal CLI harness over the tunnel core: run a node,
//! keep a peer dialed, or listen locally and tunnel connections through
//! a chain of hops.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hopwire::config::{CliOverrides, NodeConfig};
use hopwire::frame::TargetAddr;
use hopwire::Node;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "hopwire", about = "Multi-hop TCP-over-WebSocket tunneling overlay")]
struct Args {
    /// Path to a hopwire.toml config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level passed to the tracing env filter (e.g. "info", "debug").
    #[arg(long, global = true, env = "HOPWIRE_LOG")]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node, accepting inbound overlay links.
    Serve {
        #[arg(long)]
        addr: Option<SocketAddr>,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        min_conns: Option<usize>,
    },
    /// Dial a named peer and keep its link pool topped up.
    Connect {
        #[arg(long)]
        peer: String,
        #[arg(long)]
        url: String,
        #[arg(long, default_value = "")]
        secret: String,
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Accept local TCP connections and tunnel each through `hops` to
    /// `remote`.
    Listen {
        #[arg(long, value_delimiter = ',')]
        hops: Vec<String>,
        #[arg(long)]
        local: SocketAddr,
        #[arg(long)]
        remote: SocketAddr,
        #[arg(long)]
        addr: Option<SocketAddr>,
        #[arg(long)]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cli = CliOverrides {
        log: args.log.clone(),
        ..Default::default()
    };
    let config = NodeConfig::resolve(cli, args.config.as_deref())?;
    let _guard = setup_logging(&config.log);

    match args.command {
        Command::Serve { addr, key, min_conns } => run_serve(config, addr, key, min_conns).await,
        Command::Connect { peer, url, secret, addr } => run_connect(config, peer, url, secret, addr).await,
        Command::Listen { hops, local, remote, addr, key } => run_listen(config, hops, local, remote, addr, key).await,
    }
}

async fn run_serve(
    mut config: NodeConfig,
    addr: Option<SocketAddr>,
    key: Option<String>,
    min_conns: Option<usize>,
) -> anyhow::Result<()> {
    if let Some(addr) = addr {
        config.bind_addr = addr;
    }
    if let Some(key) = key {
        config.key = hex::decode(&key)?;
    }
    if let Some(min_conns) = min_conns {
        config.min_conns = min_conns;
    }

    let bind_addr = config.bind_addr;
    let node = Node::new(&config);
    info!(%bind_addr, "starting hopwire node");

    let serve_node = node.clone();
    let serve_task = tokio::spawn(async move { serve_node.serve(bind_addr).await });

    wait_for_shutdown().await;
    info!("shutdown signal received, closing node");
    node.close();
    let _ = serve_task.await;
    Ok(())
}

async fn run_connect(
    config: NodeConfig,
    peer: String,
    url: String,
    secret: String,
    addr: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let node = Node::new(&config);

    if let Some(addr) = addr {
        let serve_node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_node.serve(addr).await {
                error!(error = %e, "serve failed");
            }
        });
    }

    node.connect(peer.clone(), url.clone(), secret.into_bytes()).await;
    info!(%peer, %url, "dialing peer");

    wait_for_shutdown().await;
    info!("shutdown signal received, closing node");
    node.close();
    Ok(())
}

async fn run_listen(
    config: NodeConfig,
    hops: Vec<String>,
    local: SocketAddr,
    remote: SocketAddr,
    addr: Option<SocketAddr>,
    key: Option<String>,
) -> anyhow::Result<()> {
    let mut config = config;
    if let Some(key) = key {
        config.key = hex::decode(&key)?;
    }
    let node = Node::new(&config);

    if let Some(addr) = addr {
        let serve_node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_node.serve(addr).await {
                error!(error = %e, "serve failed");
            }
        });
    }

    let target = TargetAddr { ip: remote.ip().to_string(), port: remote.port() };
    info!(%local, ?hops, %remote, "starting listen_proxy");

    let listen_node = node.clone();
    let listen_task = tokio::spawn(async move { listen_node.listen_proxy(hops, local, target).await });

    wait_for_shutdown().await;
    info!("shutdown signal received, closing node");
    node.close();
    let _ = listen_task.await;
    Ok(())
}

/// Initialize the tracing subscriber for stdout-only, compact output.
/// File logging isn't wired into the CLI harness; the setup mirrors the
/// teacher daemon's `setup_logging` minus the file-appender branch.
fn setup_logging(log_level: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
    None
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
