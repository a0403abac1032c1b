use anyhow::{bail, Result};
use clap::Parser;
use log::{debug, info};
use raft_replica::dispatch::{read_frame, write_frame};
use raft_replica::{PeerId, RaftMessage};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Submits one entry to the cluster, following leader redirects until a
/// leader accepts it.
#[derive(Parser, Debug)]
#[command(name = "client")]
struct Args {
    /// Cluster members as id=addr, repeated once per server.
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(PeerId, String)>,

    /// The entry payload.
    #[arg(long)]
    data: String,

    /// This client's id on the wire. Must not collide with a server id.
    #[arg(long, default_value_t = 1000)]
    id: PeerId,

    /// Delay before retrying when no leader is known, in milliseconds.
    #[arg(long, default_value_t = 500)]
    retry_ms: u64,

    /// Give up after this many attempts.
    #[arg(long, default_value_t = 10)]
    attempts: u32,
}

fn parse_peer(s: &str) -> Result<(PeerId, String), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=addr, got {s}"))?;
    let id = id.parse().map_err(|e| format!("bad peer id {id}: {e}"))?;
    Ok((id, addr.to_string()))
}

async fn submit(addr: &str, message: &RaftMessage) -> Result<RaftMessage> {
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(&mut stream, message).await?;
    Ok(timeout(Duration::from_millis(3000), read_frame(&mut stream)).await??)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.peers.is_empty() {
        bail!("at least one --peer id=addr is required");
    }

    let addresses: HashMap<PeerId, String> = args.peers.iter().cloned().collect();
    let request = RaftMessage::NewEntry {
        source: args.id,
        data: args.data.clone().into_bytes(),
    };

    // Start anywhere; redirects steer us to the leader.
    let mut target = args.peers[0].0;
    for attempt in 1..=args.attempts {
        let addr = addresses
            .get(&target)
            .cloned()
            .unwrap_or_else(|| args.peers[0].1.clone());
        match submit(&addr, &request).await {
            Ok(RaftMessage::NewEntryResponse {
                source,
                accepted: true,
                ..
            }) => {
                info!("entry accepted by leader {}", source);
                println!("accepted by {}", source);
                return Ok(());
            }
            Ok(RaftMessage::NewEntryResponse {
                source,
                leader_redirect,
                ..
            }) => match leader_redirect {
                Some(leader) => {
                    debug!("{} redirected us to {}", source, leader);
                    target = leader;
                }
                None => {
                    debug!("{} knows no leader yet, retrying", source);
                    sleep(Duration::from_millis(args.retry_ms)).await;
                }
            },
            Ok(other) => debug!("unexpected response: {:?}", other),
            Err(e) => {
                debug!("attempt {} against {} failed: {}", attempt, addr, e);
                sleep(Duration::from_millis(args.retry_ms)).await;
            }
        }
    }
    bail!("no leader accepted the entry after {} attempts", args.attempts)
}
