//! TCP relay server
//!
//! Peers connect, join a room, and from then on every signal they send is
//! forwarded to the other members of that room and nowhere else. The relay
//! never looks inside a signal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tandem_core::RelayConfig;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::Message;
use crate::room::RoomId;

/// A connected room member
struct Member {
    peer_id: Uuid,
    tx: mpsc::Sender<Message>,
}

/// Server state shared across tasks
struct ServerState {
    rooms: HashMap<RoomId, Vec<Member>>,
    max_room_peers: usize,
}

/// Relay server handle
pub struct Server {
    addr: SocketAddr,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind the configured port and start accepting peers
    pub async fn start(config: &RelayConfig) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, max_room_peers = config.max_room_peers, "Relay started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let state = Arc::new(RwLock::new(ServerState {
            rooms: HashMap::new(),
            max_room_peers: config.max_room_peers.max(1),
        }));

        tokio::spawn(accept_loop(listener, state.clone(), shutdown_tx.clone()));

        Ok(Server {
            addr: bound_addr,
            state,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of rooms with at least one member
    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    /// Members of a room, in join order
    pub async fn room_members(&self, room: &RoomId) -> Vec<Uuid> {
        self.state
            .read()
            .await
            .rooms
            .get(room)
            .map(|members| members.iter().map(|m| m.peer_id).collect())
            .unwrap_or_default()
    }

    /// Tell every member the relay is going away, then stop
    pub async fn shutdown(&self) {
        {
            let s = self.state.read().await;
            for member in s.rooms.values().flatten() {
                let _ = member.tx.send(Message::ServerShutdown).await;
            }
        }
        let _ = self.shutdown_tx.send(());
        info!("Relay shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        let state = state.clone();
                        tokio::spawn(handle_connection(stream, addr, state, shutdown_tx.subscribe()));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single peer connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RwLock<ServerState>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (msg_tx, msg_rx) = mpsc::channel(64);

    // First message must be JoinRequest
    let (room, peer_id) = match handle_join(&mut reader, &state, msg_tx).await {
        Ok(joined) => joined,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Join failed");
            let reason = e.to_string();
            let _ = write_frame(&mut writer, &Message::JoinRejected { reason }).await;
            return;
        }
    };

    info!(addr = %addr, room = %room, peer_id = %peer_id, "Peer joined");
    let writer_handle = tokio::spawn(writer_task(writer, msg_rx));

    loop {
        tokio::select! {
            result = read_frame(&mut reader) => {
                match result {
                    Ok(msg) => handle_message(msg, &room, peer_id, &state).await,
                    Err(Error::ConnectionClosed) => {
                        debug!(peer_id = %peer_id, "Connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!(peer_id = %peer_id, error = %e, "Read error");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    remove_peer(&state, &room, peer_id).await;
    // Drain what is already queued (PeerLeft for others, ServerShutdown)
    let _ = writer_handle.await;

    info!(room = %room, peer_id = %peer_id, "Peer disconnected");
}

/// Handle join request
async fn handle_join(
    reader: &mut ReadHalf<TcpStream>,
    state: &Arc<RwLock<ServerState>>,
    tx: mpsc::Sender<Message>,
) -> Result<(RoomId, Uuid)> {
    let msg = read_frame(reader).await?;

    let Message::JoinRequest { room, peer_id } = msg else {
        return Err(Error::Protocol("Expected JoinRequest".into()));
    };

    let mut s = state.write().await;
    let max_room_peers = s.max_room_peers;
    let members = s.rooms.entry(room.clone()).or_default();

    if members.len() >= max_room_peers {
        return Err(Error::RoomFull(room.to_string()));
    }
    if members.iter().any(|m| m.peer_id == peer_id) {
        return Err(Error::Rejected("Already connected".into()));
    }

    let peers: Vec<Uuid> = members.iter().map(|m| m.peer_id).collect();
    for member in members.iter() {
        let _ = member.tx.send(Message::PeerJoined { peer_id }).await;
    }
    let _ = tx
        .send(Message::JoinAccepted {
            room: room.clone(),
            peer_id,
            peers,
        })
        .await;
    members.push(Member { peer_id, tx });

    Ok((room, peer_id))
}

/// Writer task - sends messages to the client
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

/// Handle an incoming message
async fn handle_message(msg: Message, room: &RoomId, sender_id: Uuid, state: &Arc<RwLock<ServerState>>) {
    match msg {
        Message::Signal { signal, .. } => {
            let msg = Message::Signal {
                from: sender_id,
                signal,
            };
            broadcast_to_room(state, room, msg, Some(sender_id)).await;
        }
        Message::Ping => {
            let s = state.read().await;
            if let Some(member) = find_member(&s, room, sender_id) {
                let _ = member.tx.send(Message::Pong).await;
            }
        }
        _ => {
            debug!(sender_id = %sender_id, "Ignoring unexpected message type");
        }
    }
}

fn find_member<'a>(s: &'a ServerState, room: &RoomId, peer_id: Uuid) -> Option<&'a Member> {
    s.rooms.get(room)?.iter().find(|m| m.peer_id == peer_id)
}

/// Remove a peer, drop the room once empty, and tell whoever is left
async fn remove_peer(state: &Arc<RwLock<ServerState>>, room: &RoomId, peer_id: Uuid) {
    {
        let mut s = state.write().await;
        if let Some(members) = s.rooms.get_mut(room) {
            // Dropping the member's sender lets its writer task finish
            members.retain(|m| m.peer_id != peer_id);
            if members.is_empty() {
                s.rooms.remove(room);
                debug!(room = %room, "Room closed");
            }
        }
    }

    broadcast_to_room(state, room, Message::PeerLeft { peer_id }, None).await;
}

/// Send to every member of a room, optionally excluding one
async fn broadcast_to_room(
    state: &Arc<RwLock<ServerState>>,
    room: &RoomId,
    msg: Message,
    except: Option<Uuid>,
) {
    let s = state.read().await;
    let Some(members) = s.rooms.get(room) else {
        return;
    };
    for member in members {
        if except != Some(member.peer_id) {
            let _ = member.tx.send(msg.clone()).await;
        }
    }
}
