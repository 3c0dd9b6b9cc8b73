//! Tandem Network Library
//!
//! A room-scoped signaling relay over TCP.
//!
//! # Architecture
//!
//! - **Server**: accepts peers, groups them by room, forwards signals
//! - **Client**: joins one room and implements the core `SignalSender`
//! - **Protocol**: Length-prefixed JSON messages
//!
//! # Usage
//!
//! ```ignore
//! let server = Server::start(&RelayConfig::default()).await?;
//!
//! let (client, events) = RelayClient::connect(addr, RoomId::from_hint(None)).await?;
//! let mut peer = Peer::spawn(factory, Arc::new(client), events, PeerConfig::default())?;
//! while let Some(event) = peer.next_event().await {
//!     match event {
//!         PeerEvent::FileReceived(file) => { /* handle */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod client;
pub mod error;
mod frame;
pub mod protocol;
pub mod room;
pub mod server;

pub use client::RelayClient;
pub use error::{Error, Result};
pub use protocol::Message;
pub use room::RoomId;
pub use server::Server;

pub use tandem_core::config::DEFAULT_RELAY_PORT as DEFAULT_PORT;
