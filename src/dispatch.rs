use crate::raft::ReplicaHandle;
use crate::{PeerId, RaftMessage};
use anyhow::{Context, Result};
use log::{debug, error};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

/// How long a single fire-and-forget send may take before it is abandoned.
const SEND_TIMEOUT: Duration = Duration::from_millis(5000);

/// How long a client connection waits for the replica's NewEntry answer.
const CLIENT_REPLY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Routes messages between replicas by peer id. Sends are best-effort and
/// non-blocking; the protocol self-corrects through timer-driven retries
/// when a message is lost.
pub trait Dispatcher: Send + Sync {
    fn send_request(&self, to: PeerId, message: RaftMessage);
    fn send_response(&self, to: PeerId, message: RaftMessage);
}

/// In-process dispatcher: delivers straight into the target replica's
/// inbox. This is the network for single-process clusters and tests.
#[derive(Default)]
pub struct LocalRouter {
    routes: Mutex<HashMap<PeerId, ReplicaHandle>>,
}

impl LocalRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: PeerId, handle: ReplicaHandle) {
        self.routes.lock().unwrap().insert(id, handle);
    }

    /// Creates a mailbox for a non-replica participant (a test client):
    /// messages sent to `id` land on the returned receiver.
    pub fn open_endpoint(&self, id: PeerId) -> mpsc::Receiver<RaftMessage> {
        let (tx, rx) = mpsc::channel(crate::raft::INBOX_CAPACITY);
        self.register(id, ReplicaHandle { tx });
        rx
    }

    /// Drops every registered handle. Replicas and the router hold each
    /// other alive; clearing the routes closes every inbox and lets the
    /// cluster shut down.
    pub fn clear(&self) {
        self.routes.lock().unwrap().clear();
    }

    fn deliver(&self, to: PeerId, message: RaftMessage) {
        let handle = self.routes.lock().unwrap().get(&to).cloned();
        match handle {
            Some(handle) => {
                if !handle.message_received(message) {
                    debug!("dropping message for {}: inbox unavailable", to);
                }
            }
            None => debug!("dropping message for unknown peer {}", to),
        }
    }
}

impl Dispatcher for LocalRouter {
    fn send_request(&self, to: PeerId, message: RaftMessage) {
        self.deliver(to, message);
    }

    fn send_response(&self, to: PeerId, message: RaftMessage) {
        self.deliver(to, message);
    }
}

/// TCP dispatcher: one u32-length-prefixed JSON frame per connection.
///
/// Peer-to-peer traffic is fire-and-forget; responses travel back through
/// the receiver's own dispatcher. Client NewEntry connections are the
/// exception: the listener parks a oneshot under the client's id and
/// `send_response` completes it, so the client reads its answer on the
/// connection it asked on.
pub struct TcpDispatcher {
    peers: HashMap<PeerId, String>,
    pending: Mutex<HashMap<PeerId, oneshot::Sender<RaftMessage>>>,
}

impl TcpDispatcher {
    pub fn new(peers: HashMap<PeerId, String>) -> Arc<Self> {
        Arc::new(Self {
            peers,
            pending: Mutex::new(HashMap::new()),
        })
    }

    fn deliver(&self, to: PeerId, message: RaftMessage) {
        let Some(addr) = self.peers.get(&to).cloned() else {
            debug!("dropping message for unknown peer {}", to);
            return;
        };
        tokio::spawn(async move {
            let send = async {
                let mut stream = TcpStream::connect(&addr).await?;
                write_frame(&mut stream, &message).await
            };
            match tokio::time::timeout(SEND_TIMEOUT, send).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("send to {} ({}) failed: {}", to, addr, e),
                Err(_) => debug!("send to {} ({}) timed out", to, addr),
            }
        });
    }
}

impl Dispatcher for TcpDispatcher {
    fn send_request(&self, to: PeerId, message: RaftMessage) {
        self.deliver(to, message);
    }

    fn send_response(&self, to: PeerId, message: RaftMessage) {
        let waiting = self.pending.lock().unwrap().remove(&to);
        let message = match waiting {
            Some(waiting) => match waiting.send(message) {
                Ok(()) => return,
                // Connection gave up waiting; fall back to the address book.
                Err(message) => message,
            },
            None => message,
        };
        self.deliver(to, message);
    }
}

/// Accepts connections on `addr` and feeds every decoded frame into the
/// replica's inbox. Runs until the process exits.
pub async fn serve(addr: &str, handle: ReplicaHandle, dispatcher: Arc<TcpDispatcher>) -> Result<()> {
    let listener = bind_reusable(addr)?;
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let handle = handle.clone();
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, handle, dispatcher).await {
                        debug!("connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("accept failed on {}: {}", addr, e);
                continue;
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    handle: ReplicaHandle,
    dispatcher: Arc<TcpDispatcher>,
) -> Result<()> {
    let message = read_frame(&mut stream).await?;
    if let RaftMessage::NewEntry { source, .. } = &message {
        let client = *source;
        let (tx, rx) = oneshot::channel();
        dispatcher.pending.lock().unwrap().insert(client, tx);
        handle.message_received(message);
        match tokio::time::timeout(CLIENT_REPLY_TIMEOUT, rx).await {
            Ok(Ok(response)) => write_frame(&mut stream, &response).await?,
            _ => {
                // Replica never answered; the client will retry.
                dispatcher.pending.lock().unwrap().remove(&client);
            }
        }
    } else {
        handle.message_received(message);
    }
    Ok(())
}

pub async fn write_frame(stream: &mut TcpStream, message: &RaftMessage) -> Result<()> {
    let bytes = serde_json::to_vec(message)?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame(stream: &mut TcpStream) -> Result<RaftMessage> {
    let len = stream.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Binds with SO_REUSEADDR so a restarted replica can reclaim its port
/// without waiting out TIME_WAIT.
fn bind_reusable(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid listen address {addr}"))?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(TcpListener::from_std(socket.into())?)
}
