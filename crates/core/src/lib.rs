//! Tandem Core Library
//!
//! Peer negotiation, the feature channel, and chunked file transfer between
//! two peers, on top of an opaque connection capability and signaling relay.

pub mod capability;
pub mod config;
pub mod error;
pub mod features;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod negotiation;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signal;
pub mod transfer;

pub use capability::{
    ChannelEvent, ChannelHandle, ChannelMessage, ChannelOptions, Connection, ConnectionEvent,
    ConnectionFactory, DataChannel, SignalingState,
};
pub use config::{PeerConfig, RelayConfig, TandemConfig};
pub use error::{Error, Result};
pub use features::{BinaryType, Features};
pub use negotiation::{NegotiationState, Negotiator, Role};
pub use peer::{Peer, PeerEvent};
pub use relay::{RelayEvent, SignalSender};
pub use session::Session;
pub use signal::{IceCandidate, SdpType, SessionDescription, Signal};
pub use transfer::{FileSource, ReceivedFile, TransferDescriptor};
