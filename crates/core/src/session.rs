//! Connection sessions
//!
//! A session wraps exactly one connection plus whatever the remote peer
//! advertised on the feature channel. Sessions are never repaired: leave,
//! reset and unrecoverable failure all swap in a new one with a higher
//! generation, and work started against an older generation is dropped.

use std::sync::{Arc, OnceLock};

use crate::capability::Connection;
use crate::features::Features;

pub struct Session {
    generation: u64,
    connection: Arc<dyn Connection>,
    remote_features: OnceLock<Features>,
}

impl Session {
    pub fn new(generation: u64, connection: Arc<dyn Connection>) -> Self {
        Self {
            generation,
            connection,
            remote_features: OnceLock::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Features advertised by the remote peer, once the handshake completed
    pub fn remote_features(&self) -> Option<Features> {
        self.remote_features.get().copied()
    }

    /// Record the remote features. Returns false if already recorded.
    pub(crate) fn record_remote_features(&self, features: Features) -> bool {
        self.remote_features.set(features).is_ok()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.generation)
            .field("signaling_state", &self.connection.signaling_state())
            .field("remote_features", &self.remote_features.get())
            .finish()
    }
}
