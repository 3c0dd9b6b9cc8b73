//! Connection capability seam
//!
//! The media/connection engine (ICE, DTLS, SDP) is opaque to this crate.
//! Implementations wrap a real peer connection; the `mock` module provides an
//! in-memory one for tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::features::BinaryType;
use crate::signal::{IceCandidate, SessionDescription};

/// Signaling state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Events emitted by a connection
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Local state changed and a fresh offer is required
    NegotiationNeeded,
    /// A local network candidate was discovered
    LocalCandidate(IceCandidate),
    /// The remote peer opened a channel
    InboundChannel(ChannelHandle),
}

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Options for opening a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub ordered: bool,
    /// Fixed id agreed out of band; both peers open the channel themselves
    /// and no inbound-channel event is raised for it.
    pub negotiated_id: Option<u16>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            negotiated_id: None,
        }
    }
}

impl ChannelOptions {
    pub fn negotiated(id: u16) -> Self {
        Self {
            ordered: true,
            negotiated_id: Some(id),
        }
    }
}

/// A message on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    /// Byte length of the payload
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(text) => text.len(),
            ChannelMessage::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Events emitted by a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(ChannelMessage),
    /// Buffered amount dropped below the configured low threshold
    BufferedAmountLow,
    Closed,
}

pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// A channel together with its event stream
#[derive(Debug)]
pub struct ChannelHandle {
    pub channel: Arc<dyn DataChannel>,
    pub events: ChannelEvents,
}

/// A bidirectional message pipe carried inside a connection
pub trait DataChannel: Send + Sync + std::fmt::Debug {
    fn label(&self) -> &str;

    fn id(&self) -> Option<u16>;

    fn binary_type(&self) -> BinaryType;

    fn set_binary_type(&self, binary_type: BinaryType);

    /// Bytes queued locally and not yet handed to the transport
    fn buffered_amount(&self) -> usize;

    fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Queue a message. Fails if the channel is not open.
    fn send(&self, message: ChannelMessage) -> Result<()>;

    fn close(&self);
}

/// One peer connection instance
#[async_trait]
pub trait Connection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    /// Generate whichever description the current state calls for (offer
    /// when stable, answer with a remote offer pending) and apply it.
    async fn set_local_description(&self) -> Result<SessionDescription>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply an explicitly created local description
    async fn apply_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<SessionDescription>;

    async fn apply_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn open_channel(&self, label: &str, options: ChannelOptions) -> Result<ChannelHandle>;

    fn close(&self);
}

/// Creates fresh connection instances. A session is never repaired, only
/// replaced by a new connection from the factory.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self) -> Result<(Arc<dyn Connection>, ConnectionEvents)>;
}
