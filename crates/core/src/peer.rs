//! Peer driver
//!
//! Runs the event loop for one local peer: relay presence and signals,
//! connection events, and application commands all funnel into a single
//! task that drives the [`Negotiator`]. Offers are made on their own task
//! so that remote signals keep flowing while an offer is in progress.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::capability::{ChannelHandle, ConnectionEvent, ConnectionFactory};
use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::negotiation::{NegotiationState, Negotiator, SessionEvent, SessionEvents};
use crate::relay::{RelayEvent, SignalSender};
use crate::transfer::{self, FileSource, ReceivedFile};

/// Event surfaced to the application
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Another peer joined the room; we are now the polite side
    PeerJoined,
    /// The paired peer left; a fresh session is waiting for the next one
    PeerLeft,
    FileReceived(ReceivedFile),
    FileSent { name: String },
    TransferFailed { label: String, reason: String },
    /// Resets exhausted, negotiation stays down until the peer changes
    NegotiationFailed { attempts: u32 },
    /// The relay connection is gone and the driver has stopped
    RelayClosed,
}

enum PeerCommand {
    SendFile(FileSource),
    Leave,
}

/// Handle to a running peer driver
pub struct Peer {
    negotiator: Negotiator,
    event_rx: mpsc::Receiver<PeerEvent>,
    cmd_tx: mpsc::Sender<PeerCommand>,
}

impl Peer {
    /// Create the first session and start driving it
    pub fn spawn(
        factory: Arc<dyn ConnectionFactory>,
        signals: Arc<dyn SignalSender>,
        relay_events: mpsc::Receiver<RelayEvent>,
        config: PeerConfig,
    ) -> Result<Self> {
        let (negotiator, session_events) = Negotiator::new(factory, signals, config)?;

        let (event_tx, event_rx) = mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        tokio::spawn(driver_task(
            negotiator.clone(),
            relay_events,
            session_events,
            cmd_rx,
            event_tx,
        ));

        Ok(Peer {
            negotiator,
            event_rx,
            cmd_tx,
        })
    }

    /// Get the next application event
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        self.event_rx.recv().await
    }

    /// Queue a file for sending on the current session
    pub async fn send_file(&self, file: FileSource) -> Result<()> {
        self.cmd_tx
            .send(PeerCommand::SendFile(file))
            .await
            .map_err(|_| Error::SessionClosed)
    }

    /// Close the session and stop the driver
    pub async fn leave(&self) {
        let _ = self.cmd_tx.send(PeerCommand::Leave).await;
    }

    pub async fn negotiation_state(&self) -> NegotiationState {
        self.negotiator.state().await
    }

    pub async fn generation(&self) -> u64 {
        self.negotiator.generation().await
    }
}

async fn driver_task(
    negotiator: Negotiator,
    mut relay_events: mpsc::Receiver<RelayEvent>,
    mut session_events: SessionEvents,
    mut cmd_rx: mpsc::Receiver<PeerCommand>,
    event_tx: mpsc::Sender<PeerEvent>,
) {
    loop {
        tokio::select! {
            relay = relay_events.recv() => {
                match relay {
                    Some(RelayEvent::Connected) => info!("Joined room"),
                    Some(RelayEvent::PeerJoined) => {
                        negotiator.on_peer_joined().await;
                        let _ = event_tx.send(PeerEvent::PeerJoined).await;
                    }
                    Some(RelayEvent::PeerLeft) => {
                        info!("Peer left, starting a fresh session");
                        if let Err(e) = negotiator.on_peer_left().await {
                            error!(error = %e, "Failed to create a fresh session");
                        }
                        let _ = event_tx.send(PeerEvent::PeerLeft).await;
                    }
                    Some(RelayEvent::Signal(signal)) => {
                        if let Err(e) = negotiator.on_remote_signal(signal).await {
                            report_negotiation_error(e, &event_tx).await;
                        }
                    }
                    Some(RelayEvent::Disconnected) | None => {
                        warn!("Relay connection closed");
                        let _ = event_tx.send(PeerEvent::RelayClosed).await;
                        break;
                    }
                }
            }

            event = session_events.recv() => {
                let Some(SessionEvent { generation, event }) = event else {
                    break;
                };
                if generation != negotiator.generation().await {
                    debug!(generation, "Dropping event of a discarded session");
                    continue;
                }
                handle_connection_event(&negotiator, event, &event_tx).await;
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(PeerCommand::SendFile(file)) => {
                        tokio::spawn(send_task(negotiator.clone(), file, event_tx.clone()));
                    }
                    Some(PeerCommand::Leave) | None => {
                        debug!("Leave requested");
                        break;
                    }
                }
            }
        }
    }

    negotiator.close().await;
    info!("Peer stopped");
}

async fn handle_connection_event(
    negotiator: &Negotiator,
    event: ConnectionEvent,
    event_tx: &mpsc::Sender<PeerEvent>,
) {
    match event {
        ConnectionEvent::NegotiationNeeded => {
            let negotiator = negotiator.clone();
            tokio::spawn(async move {
                if let Err(e) = negotiator.on_negotiation_needed().await {
                    warn!(error = %e, "Failed to send offer");
                }
            });
        }
        ConnectionEvent::LocalCandidate(candidate) => {
            if let Err(e) = negotiator.on_local_candidate(candidate).await {
                warn!(error = %e, "Failed to send local candidate");
            }
        }
        ConnectionEvent::InboundChannel(handle) => {
            let idle_timeout = negotiator.config().transfer_idle_timeout();
            tokio::spawn(receive_task(handle, idle_timeout, event_tx.clone()));
        }
    }
}

async fn report_negotiation_error(e: Error, event_tx: &mpsc::Sender<PeerEvent>) {
    match e {
        Error::ResetLimitExceeded { attempts } => {
            let _ = event_tx.send(PeerEvent::NegotiationFailed { attempts }).await;
        }
        e => warn!(error = %e, "Negotiation step failed"),
    }
}

async fn send_task(negotiator: Negotiator, file: FileSource, event_tx: mpsc::Sender<PeerEvent>) {
    let session = negotiator.session().await;
    let name = file.name.clone();
    let event = match transfer::send_file(&session, file, negotiator.config()).await {
        Ok(()) => PeerEvent::FileSent { name },
        Err(e) => {
            warn!(label = %name, error = %e, "Transfer failed");
            PeerEvent::TransferFailed {
                label: name,
                reason: e.to_string(),
            }
        }
    };
    let _ = event_tx.send(event).await;
}

async fn receive_task(
    handle: ChannelHandle,
    idle_timeout: Option<std::time::Duration>,
    event_tx: mpsc::Sender<PeerEvent>,
) {
    let label = handle.channel.label().to_string();
    let event = match transfer::receive_file(handle, idle_timeout).await {
        Ok(file) => PeerEvent::FileReceived(file),
        Err(e) => {
            warn!(label = %label, error = %e, "Inbound transfer failed");
            PeerEvent::TransferFailed {
                label,
                reason: e.to_string(),
            }
        }
    };
    let _ = event_tx.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockNetwork, MockRelayHub};
    use std::time::Duration;

    async fn next(peer: &mut Peer) -> PeerEvent {
        tokio::time::timeout(Duration::from_secs(5), peer.next_event())
            .await
            .expect("timed out waiting for peer event")
            .expect("peer driver stopped")
    }

    fn spawn(hub: &MockRelayHub, network: &MockNetwork) -> Peer {
        let (member, relay_events) = hub.join();
        Peer::spawn(network.factory(), member, relay_events, PeerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_two_peers_exchange_a_file() {
        let hub = MockRelayHub::new();
        let network = MockNetwork::new();
        let mut first = spawn(&hub, &network);
        let mut second = spawn(&hub, &network);

        assert_eq!(next(&mut first).await, PeerEvent::PeerJoined);
        assert!(first.negotiation_state().await.is_polite());
        assert!(!second.negotiation_state().await.is_polite());

        first
            .send_file(FileSource::new("hello.txt", "text/plain", "hello world"))
            .await
            .unwrap();

        let PeerEvent::FileReceived(file) = next(&mut second).await else {
            panic!("expected a received file");
        };
        assert_eq!(file.name(), "hello.txt");
        assert_eq!(&file.data[..], b"hello world");
        assert_eq!(
            next(&mut first).await,
            PeerEvent::FileSent {
                name: "hello.txt".to_string()
            }
        );

        // and back the other way on the same session
        second
            .send_file(FileSource::new("reply.bin", "", vec![9u8; 20000]))
            .await
            .unwrap();
        let PeerEvent::FileReceived(reply) = next(&mut first).await else {
            panic!("expected a received file");
        };
        assert_eq!(reply.data.len(), 20000);
    }

    #[tokio::test]
    async fn test_peer_left_starts_fresh_session() {
        let hub = MockRelayHub::new();
        let network = MockNetwork::new();
        let mut first = spawn(&hub, &network);
        let (member, relay_events) = hub.join();
        let second = Peer::spawn(network.factory(), member.clone(), relay_events, PeerConfig::default()).unwrap();

        assert_eq!(next(&mut first).await, PeerEvent::PeerJoined);
        let before = first.generation().await;

        second.leave().await;
        member.leave();

        assert_eq!(next(&mut first).await, PeerEvent::PeerLeft);
        assert_eq!(first.generation().await, before + 1);
        assert!(first.negotiation_state().await.is_polite());
    }

    #[tokio::test]
    async fn test_relay_loss_stops_driver() {
        let network = MockNetwork::new();
        let (relay_tx, relay_events) = mpsc::channel(8);
        let hub = MockRelayHub::new();
        let (member, _unused) = hub.join();
        let mut peer = Peer::spawn(network.factory(), member, relay_events, PeerConfig::default()).unwrap();

        relay_tx.send(RelayEvent::Disconnected).await.unwrap();
        assert_eq!(next(&mut peer).await, PeerEvent::RelayClosed);
        assert!(peer.next_event().await.is_none());
    }
}
