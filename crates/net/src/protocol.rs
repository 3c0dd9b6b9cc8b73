//! Relay protocol message types
//!
//! All messages are JSON-serialized and length-prefixed on the wire.

use serde::{Deserialize, Serialize};
use tandem_core::Signal;
use uuid::Uuid;

use crate::room::RoomId;

/// Relay protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Client asks to join a room
    JoinRequest { room: RoomId, peer_id: Uuid },

    /// Server accepts join request; `peers` are the members already present
    JoinAccepted {
        room: RoomId,
        peer_id: Uuid,
        peers: Vec<Uuid>,
    },

    /// Server rejects join request
    JoinRejected { reason: String },

    /// Another peer joined the room
    PeerJoined { peer_id: Uuid },

    /// A peer has left the room
    PeerLeft { peer_id: Uuid },

    /// Opaque signal relayed between room members. The server overwrites
    /// `from` with the sender's id.
    Signal { from: Uuid, signal: Signal },

    /// Ping to keep connection alive
    Ping,

    /// Pong response to ping
    Pong,

    /// Server is shutting down
    ServerShutdown,
}

impl Message {
    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::SessionDescription;

    #[test]
    fn test_signal_wire_shape() {
        let from = Uuid::nil();
        let msg = Message::Signal {
            from,
            signal: Signal::Description(SessionDescription::reset()),
        };

        let value: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "Signal",
                "from": "00000000-0000-0000-0000-000000000000",
                "signal": { "description": { "type": "_reset" } }
            })
        );
    }

    #[test]
    fn test_join_with_bad_room_rejected() {
        let bytes = br#"{"type":"JoinRequest","room":"lobby","peer_id":"00000000-0000-0000-0000-000000000000"}"#;
        assert!(Message::from_bytes(bytes).is_err());
    }
}
