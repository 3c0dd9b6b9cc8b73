//! Signaling relay seam
//!
//! The relay is a room-scoped message bus. It delivers presence events and
//! forwards signals opaquely between the members of one room.

use async_trait::async_trait;

use crate::error::Result;
use crate::signal::Signal;

/// Outbound half of a relay connection
#[async_trait]
pub trait SignalSender: Send + Sync {
    async fn send(&self, signal: Signal) -> Result<()>;
}

/// Events delivered by a relay connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Joined the room
    Connected,
    /// Another peer joined the room
    PeerJoined,
    /// The other peer left the room
    PeerLeft,
    /// A signal from the other peer
    Signal(Signal),
    /// Relay connection lost
    Disconnected,
}
