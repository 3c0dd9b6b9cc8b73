//! TCP client for a relay room

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tandem_core::{RelayEvent, Signal, SignalSender};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::Message;
use crate::room::RoomId;

/// Keepalive ping interval
const PING_INTERVAL: Duration = Duration::from_secs(15);

enum ClientCommand {
    Send(Message),
    Disconnect,
}

/// Client handle for a joined room
pub struct RelayClient {
    peer_id: Uuid,
    room: RoomId,
    cmd_tx: mpsc::Sender<ClientCommand>,
}

impl RelayClient {
    /// Connect to a relay and join `room`. Returns once the relay accepted
    /// the join, together with the room's event stream.
    pub async fn connect(addr: SocketAddr, room: RoomId) -> Result<(Self, mpsc::Receiver<RelayEvent>)> {
        let peer_id = Uuid::new_v4();
        info!(addr = %addr, room = %room, peer_id = %peer_id, "Connecting to relay");

        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let join_msg = Message::JoinRequest {
            room: room.clone(),
            peer_id,
        };
        write_frame(&mut writer, &join_msg).await?;

        match read_frame(&mut reader).await? {
            Message::JoinAccepted { peers, .. } => {
                info!(room = %room, present = peers.len(), "Joined room");
            }
            Message::JoinRejected { reason } => {
                warn!(reason = %reason, "Join rejected");
                return Err(Error::Rejected(reason));
            }
            _ => return Err(Error::Protocol("Unexpected first message".into())),
        }

        let (event_tx, event_rx) = mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let _ = event_tx.send(RelayEvent::Connected).await;

        tokio::spawn(connection_task(reader, writer, event_tx, cmd_rx));

        Ok((
            RelayClient {
                peer_id,
                room,
                cmd_tx,
            },
            event_rx,
        ))
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Relay a signal to the other members of the room
    pub async fn send_signal(&self, signal: Signal) -> Result<()> {
        self.cmd_tx
            .send(ClientCommand::Send(Message::Signal {
                from: self.peer_id,
                signal,
            }))
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Leave the room and close the connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }
}

#[async_trait]
impl SignalSender for RelayClient {
    async fn send(&self, signal: Signal) -> tandem_core::Result<()> {
        self.send_signal(signal)
            .await
            .map_err(|e| tandem_core::Error::Signaling(e.to_string()))
    }
}

/// Main connection task
async fn connection_task(
    mut reader: ReadHalf<TcpStream>,
    mut writer: WriteHalf<TcpStream>,
    event_tx: mpsc::Sender<RelayEvent>,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            result = read_frame(&mut reader) => {
                match result {
                    Ok(Message::ServerShutdown) => {
                        info!("Relay is shutting down");
                        break;
                    }
                    Ok(msg) => handle_server_message(msg, &event_tx).await,
                    Err(Error::ConnectionClosed) => {
                        debug!("Relay closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Send(msg)) => {
                        if let Err(e) = write_frame(&mut writer, &msg).await {
                            warn!(error = %e, "Write error");
                            break;
                        }
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        debug!("Disconnect requested");
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if let Err(e) = write_frame(&mut writer, &Message::Ping).await {
                    warn!(error = %e, "Keepalive failed");
                    break;
                }
            }
        }
    }

    let _ = event_tx.send(RelayEvent::Disconnected).await;
    info!("Disconnected from relay");
}

/// Handle a message from the relay
async fn handle_server_message(msg: Message, event_tx: &mpsc::Sender<RelayEvent>) {
    match msg {
        Message::PeerJoined { peer_id } => {
            debug!(peer_id = %peer_id, "Peer joined room");
            let _ = event_tx.send(RelayEvent::PeerJoined).await;
        }
        Message::PeerLeft { peer_id } => {
            debug!(peer_id = %peer_id, "Peer left room");
            let _ = event_tx.send(RelayEvent::PeerLeft).await;
        }
        Message::Signal { from, signal } => {
            debug!(from = %from, "Signal received");
            let _ = event_tx.send(RelayEvent::Signal(signal)).await;
        }
        Message::Pong => {
            debug!("Received pong");
        }
        _ => {
            debug!("Ignoring unexpected message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use std::sync::Arc;
    use tandem_core::mock::MockNetwork;
    use tandem_core::{FileSource, IceCandidate, Peer, PeerConfig, PeerEvent, RelayConfig};

    async fn start_relay() -> (Server, SocketAddr) {
        let server = Server::start(&RelayConfig {
            port: 0,
            max_room_peers: 2,
        })
        .await
        .unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], server.addr().port()));
        (server, addr)
    }

    async fn next(events: &mut mpsc::Receiver<RelayEvent>) -> RelayEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for relay event")
            .expect("relay stream ended")
    }

    #[tokio::test]
    async fn test_signals_stay_in_room() {
        let (server, addr) = start_relay().await;
        let room = RoomId::parse("314159").unwrap();

        let (alice, mut alice_events) = RelayClient::connect(addr, room.clone()).await.unwrap();
        assert_eq!(next(&mut alice_events).await, RelayEvent::Connected);

        let (bob, mut bob_events) = RelayClient::connect(addr, room.clone()).await.unwrap();
        assert_eq!(next(&mut bob_events).await, RelayEvent::Connected);
        assert_eq!(next(&mut alice_events).await, RelayEvent::PeerJoined);

        let (eve, mut eve_events) = RelayClient::connect(addr, RoomId::parse("271828").unwrap())
            .await
            .unwrap();
        assert_eq!(next(&mut eve_events).await, RelayEvent::Connected);

        let candidate = Signal::Candidate(IceCandidate::new("candidate:1"));
        bob.send_signal(candidate.clone()).await.unwrap();
        assert_eq!(next(&mut alice_events).await, RelayEvent::Signal(candidate));

        // Eve hears nothing, not even her own signal echoed
        eve.send_signal(Signal::Candidate(IceCandidate::new("candidate:2")))
            .await
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), eve_events.recv())
                .await
                .is_err()
        );

        bob.disconnect().await;
        assert_eq!(next(&mut bob_events).await, RelayEvent::Disconnected);
        assert_eq!(next(&mut alice_events).await, RelayEvent::PeerLeft);
        assert_eq!(server.room_members(&room).await, vec![alice.peer_id()]);

        server.shutdown().await;
        assert_eq!(next(&mut alice_events).await, RelayEvent::Disconnected);
    }

    #[tokio::test]
    async fn test_full_room_rejected() {
        let (_server, addr) = start_relay().await;
        let room = RoomId::parse("000007").unwrap();

        let _first = RelayClient::connect(addr, room.clone()).await.unwrap();
        let _second = RelayClient::connect(addr, room.clone()).await.unwrap();
        let third = RelayClient::connect(addr, room).await;
        assert!(matches!(third, Err(Error::Rejected(_))));
    }

    #[tokio::test]
    async fn test_peers_transfer_over_relay() {
        let (_server, addr) = start_relay().await;
        let room = RoomId::generate();
        let network = MockNetwork::new();

        let (first_client, first_events) = RelayClient::connect(addr, room.clone()).await.unwrap();
        let mut first = Peer::spawn(
            network.factory(),
            Arc::new(first_client),
            first_events,
            PeerConfig::default(),
        )
        .unwrap();

        let (second_client, second_events) = RelayClient::connect(addr, room).await.unwrap();
        let mut second = Peer::spawn(
            network.factory(),
            Arc::new(second_client),
            second_events,
            PeerConfig::default(),
        )
        .unwrap();

        let joined = tokio::time::timeout(Duration::from_secs(5), first.next_event()).await;
        assert_eq!(joined.unwrap(), Some(PeerEvent::PeerJoined));

        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 256) as u8).collect();
        first
            .send_file(FileSource::new("archive.tar", "application/x-tar", payload.clone()))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), second.next_event())
            .await
            .unwrap();
        let Some(PeerEvent::FileReceived(file)) = received else {
            panic!("expected a received file, got {:?}", received);
        };
        assert_eq!(file.name(), "archive.tar");
        assert_eq!(&file.data[..], &payload[..]);
    }
}
