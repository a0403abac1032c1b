use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use raft_replica::dispatch::{self, TcpDispatcher};
use raft_replica::machine::MemoryMachine;
use raft_replica::raft::{RaftConfig, Replica};
use raft_replica::storage::FileStore;
use raft_replica::PeerId;
use std::collections::HashMap;
use std::path::PathBuf;

/// One Raft cluster node: persistent state on disk, framed JSON over TCP
/// between peers, and an in-memory state machine.
#[derive(Parser, Debug)]
#[command(name = "server")]
struct Args {
    /// This server's id. Must be unique across the cluster.
    #[arg(long)]
    id: PeerId,

    /// Address to accept Raft and client traffic on, e.g. 127.0.0.1:7001.
    #[arg(long)]
    listen: String,

    /// Other cluster members as id=addr, repeated once per peer.
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(PeerId, String)>,

    /// Election timeout window in milliseconds.
    #[arg(long, default_value_t = 300)]
    election_min: u64,
    #[arg(long, default_value_t = 600)]
    election_max: u64,

    /// Leader heartbeat interval in milliseconds. Keep well below the
    /// election minimum.
    #[arg(long, default_value_t = 100)]
    heartbeat: u64,

    /// Directory for the durable state file (defaults to the working dir).
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Ask the state machine to snapshot every N applied entries,
    /// truncating the log behind each snapshot.
    #[arg(long)]
    snapshot_every: Option<u64>,
}

fn parse_peer(s: &str) -> Result<(PeerId, String), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=addr, got {s}"))?;
    let id = id.parse().map_err(|e| format!("bad peer id {id}: {e}"))?;
    Ok((id, addr.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("starting server {} on {}", args.id, args.listen);
    info!("peers: {:?}", args.peers);

    let state_file = args
        .state_dir
        .unwrap_or_else(|| PathBuf::from("."))
        .join(format!("raft_state_{}.bin", args.id));
    let storage = FileStore::open(&state_file)
        .with_context(|| format!("opening state file {}", state_file.display()))?;

    let machine = match args.snapshot_every {
        Some(every) => MemoryMachine::with_snapshot_every(every),
        None => MemoryMachine::new(),
    };

    let config = RaftConfig {
        me: args.id,
        peers: args.peers.iter().map(|(id, _)| *id).collect(),
        election_timeout_min: args.election_min,
        election_timeout_max: args.election_max,
        heartbeat_interval: args.heartbeat,
    };

    let addresses: HashMap<PeerId, String> = args.peers.into_iter().collect();
    let dispatcher = TcpDispatcher::new(addresses);
    let (replica, handle) = Replica::new(config, storage, machine, dispatcher.clone());

    let listen = args.listen.clone();
    tokio::spawn(async move {
        if let Err(e) = dispatch::serve(&listen, handle, dispatcher).await {
            error!("listener on {} failed: {}", listen, e);
        }
    });

    replica.run().await?;
    Ok(())
}
