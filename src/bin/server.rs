use clap::Parser;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use raftnode::config::Config;
use raftnode::network::TarpcNetworkFactory;
use raftnode::node::{ApplyMsg, Node};
use raftnode::server::serve_node;
use raftnode::storage::FileStorage;
use raftnode::trace::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "raftnode-server")]
#[command(about = "Single Raft cluster member", long_about = None)]
struct Args {
    #[arg(long)]
    id: u64,

    #[arg(short, long, default_value = "127.0.0.1:7000")]
    listen: SocketAddr,

    /// Other members as `id=host:port`, comma separated.
    #[arg(long, value_delimiter = ',', value_parser = parse_peer)]
    peers: Vec<(u64, SocketAddr)>,

    #[arg(short, long, default_value = ".")]
    storage_dir: std::path::PathBuf,

    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,

    #[arg(long, default_value = "150")]
    election_timeout_min_ms: u64,

    #[arg(long, default_value = "300")]
    election_timeout_max_ms: u64,

    #[arg(long, default_value = "100")]
    rpc_timeout_ms: u64,

    #[arg(long, default_value = "128")]
    max_entries_per_rpc: usize,
}

fn parse_peer(s: &str) -> Result<(u64, SocketAddr), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got {s:?}"))?;
    let id = id.parse().map_err(|e| format!("bad peer id {id:?}: {e}"))?;
    let addr = addr.parse().map_err(|e| format!("bad peer address {addr:?}: {e}"))?;
    Ok((id, addr))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run().await
}

#[tracing::instrument(name = "raftnode-server")]
async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let tracer_provider = init_tracing("raftnode-server")?;

    let config = Config {
        heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
        election_timeout_min: Duration::from_millis(args.election_timeout_min_ms),
        election_timeout_max: Duration::from_millis(args.election_timeout_max_ms),
        rpc_timeout: Duration::from_millis(args.rpc_timeout_ms),
        max_entries_per_rpc: args.max_entries_per_rpc,
    };

    let addrs: HashMap<u64, SocketAddr> = args.peers.iter().copied().collect();
    let network = TarpcNetworkFactory::new(addrs, config.rpc_timeout);
    let storage = Arc::new(FileStorage::open(&args.storage_dir).await?);

    let (apply_tx, mut apply_rx) = mpsc::unbounded_channel();
    let node = Node::new(
        args.id,
        args.peers.iter().map(|(id, _)| *id).collect(),
        config,
        storage,
        &network,
        apply_tx,
    )
    .await?;

    let addr = serve_node(node.clone(), args.listen).await?;
    tracing::info!(id = args.id, %addr, peers = ?args.peers, "Raft node started");

    loop {
        tokio::select! {
            msg = apply_rx.recv() => match msg {
                Some(ApplyMsg::Command { index, command }) => {
                    tracing::info!(index, bytes = command.len(), "Applied command");
                }
                Some(ApplyMsg::Snapshot { term, index, data }) => {
                    let installed = node.cond_install_snapshot(term, index, &data).await;
                    tracing::info!(index, term, installed, "Received snapshot");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    node.kill();
    tracer_provider.shutdown()?;
    Ok(())
}
